// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared fixtures and a mock `RoleApplier` for dbtrust-core integration tests

pub mod fixtures;
pub mod mock_applier;

pub use fixtures::*;
pub use mock_applier::*;
