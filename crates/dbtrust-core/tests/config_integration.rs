// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for `TrustConfig`'s data-dir precedence chain and its
//! humantime-as-string serde round trip.

use dbtrust_core::TrustConfig;
use std::path::PathBuf;
use std::time::Duration;

/// `BIBD_HOME` is process-global; each test sets `bibd_home_override`
/// instead of touching the real environment, so these tests are safe to run
/// concurrently with each other.
#[test]
fn bibd_home_override_wins_over_base_config_dir() {
    let config = TrustConfig {
        bibd_home_override: Some(PathBuf::from("/override/home")),
        base_config_dir: Some(PathBuf::from("/base/config")),
        ..Default::default()
    };
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/override/home"));
}

#[test]
fn explicit_data_dir_wins_over_everything() {
    let config = TrustConfig {
        data_dir: Some(PathBuf::from("/explicit")),
        bibd_home_override: Some(PathBuf::from("/override/home")),
        base_config_dir: Some(PathBuf::from("/base/config")),
        ..Default::default()
    };
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/explicit"));
}

#[test]
fn toml_round_trip_preserves_humantime_durations() {
    let config = TrustConfig {
        rotation_interval: Duration::from_secs(3 * 24 * 60 * 60),
        rotation_grace_period: Duration::from_secs(90),
        ..Default::default()
    };

    let serialized = toml::to_string(&config).unwrap();
    assert!(serialized.contains("rotation-interval"));

    let deserialized: TrustConfig = toml::from_str(&serialized).unwrap();
    assert_eq!(deserialized.rotation_interval, config.rotation_interval);
    assert_eq!(deserialized.rotation_grace_period, config.rotation_grace_period);
}

#[test]
fn certificate_config_defaults_are_sensible() {
    let config = TrustConfig::default();
    assert_eq!(config.certificate.dns_names, vec!["localhost".to_string()]);
    assert_eq!(config.certificate.rotation_threshold, Duration::from_secs(30 * 24 * 60 * 60));
}
