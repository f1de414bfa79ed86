// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cipher envelope: a method-tagged ciphertext derived from a long-lived
//! node identity key.
//!
//! Wire format (bit-exact):
//! - `X25519_SecretBox`: `0x78 || nonce(24) || secretbox_seal(plaintext)`
//! - `HKDF_AESGCM`: `0x68 || nonce(12) || aesgcm_seal(plaintext)` (tag appended by the AEAD impl)
//! - `Hybrid`: `0x48 || u32_be(hkdf_len) || <HKDF_AESGCM blob> || <X25519_SecretBox blob>`
//!
//! The HKDF salt and info strings are static per spec; see the crate-level
//! design notes for why this is intentional and not a bug.

use crate::error::{Error, Result};
use crate::types::EncryptionMethod;
use aes_gcm::{
    Aes256Gcm, Nonce as AesNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::sync::Mutex;
use xsalsa20poly1305::{
    XSalsa20Poly1305, XNonce,
    aead::{Aead as _, KeyInit as _},
};
use zeroize::Zeroizing;

const SECRETBOX_NONCE_LEN: usize = 24;
const AESGCM_NONCE_LEN: usize = 12;
const HKDF_SALT: &[u8] = b"bibd-static-salt-v1";
const HKDF_INFO: &[u8] = b"bibd-credential-encryption-v1";

/// Derive the symmetric secretbox key from a node identity key by reusing the
/// Ed25519 seed-to-X25519 clamping conversion. This is not an ECDH exchange;
/// the derived scalar is used directly as a symmetric key.
fn derive_secretbox_key(identity_key: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    if identity_key.len() < 32 {
        return Err(Error::InvalidKeyLength(identity_key.len()));
    }
    let mut hasher = Sha512::new();
    hasher.update(&identity_key[..32]);
    let digest = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    Ok(Zeroizing::new(key))
}

/// Derive the AES-256-GCM key via HKDF-SHA256 with the static salt/info.
fn derive_hkdf_key(identity_key: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    if identity_key.len() < 32 {
        return Err(Error::InvalidKeyLength(identity_key.len()));
    }
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &identity_key[..32]);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| Error::GenerationFailed("HKDF expand failed".to_string()))?;
    Ok(Zeroizing::new(okm))
}

/// Encrypts and decrypts credential payloads under a method-tagged envelope.
///
/// The two derived sub-keys are computed once and cached for the lifetime of
/// the envelope, zeroized on drop.
pub struct CipherEnvelope {
    identity_key: Zeroizing<Vec<u8>>,
    method: EncryptionMethod,
    keys: Mutex<HashMap<&'static str, Zeroizing<[u8; 32]>>>,
}

impl CipherEnvelope {
    pub fn new(identity_key: Vec<u8>, method: EncryptionMethod) -> Result<Self> {
        if identity_key.len() < 32 {
            return Err(Error::InvalidKeyLength(identity_key.len()));
        }
        Ok(Self {
            identity_key: Zeroizing::new(identity_key),
            method,
            keys: Mutex::new(HashMap::new()),
        })
    }

    fn secretbox_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let mut cache = self.keys.lock().expect("envelope key cache poisoned");
        if let Some(key) = cache.get("secretbox") {
            return Ok(key.clone());
        }
        let key = derive_secretbox_key(&self.identity_key)?;
        cache.insert("secretbox", key.clone());
        Ok(key)
    }

    fn hkdf_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let mut cache = self.keys.lock().expect("envelope key cache poisoned");
        if let Some(key) = cache.get("hkdf") {
            return Ok(key.clone());
        }
        let key = derive_hkdf_key(&self.identity_key)?;
        cache.insert("hkdf", key.clone());
        Ok(key)
    }

    /// Encrypt `plaintext` under the configured method.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.method {
            EncryptionMethod::X25519SecretBox => self.encrypt_secretbox(plaintext),
            EncryptionMethod::HkdfAesGcm => self.encrypt_hkdf_aesgcm(plaintext),
            EncryptionMethod::Hybrid => {
                let hkdf_blob = self.encrypt_hkdf_aesgcm(plaintext)?;
                let secretbox_blob = self.encrypt_secretbox(plaintext)?;
                let mut out = Vec::with_capacity(1 + 4 + hkdf_blob.len() + secretbox_blob.len());
                out.push(EncryptionMethod::Hybrid.tag());
                out.extend_from_slice(&(hkdf_blob.len() as u32).to_be_bytes());
                out.extend_from_slice(&hkdf_blob);
                out.extend_from_slice(&secretbox_blob);
                Ok(out)
            }
        }
    }

    fn encrypt_secretbox(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.secretbox_key()?;
        let cipher = XSalsa20Poly1305::new_from_slice(key.as_ref())
            .map_err(|_| Error::GenerationFailed("secretbox key init failed".to_string()))?;
        let mut nonce_bytes = [0u8; SECRETBOX_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::GenerationFailed("secretbox seal failed".to_string()))?;

        let mut out = Vec::with_capacity(1 + SECRETBOX_NONCE_LEN + sealed.len());
        out.push(EncryptionMethod::X25519SecretBox.tag());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn encrypt_hkdf_aesgcm(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.hkdf_key()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| Error::GenerationFailed("aes-gcm key init failed".to_string()))?;
        let mut nonce_bytes = [0u8; AESGCM_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = AesNonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::GenerationFailed("aes-gcm seal failed".to_string()))?;

        let mut out = Vec::with_capacity(1 + AESGCM_NONCE_LEN + sealed.len());
        out.push(EncryptionMethod::HkdfAesGcm.tag());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt `ciphertext`. Never reveals which sub-algorithm failed: all
    /// failure paths collapse to `Error::DecryptionFailed`.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let Some(&tag) = ciphertext.first() else {
            return Err(Error::DecryptionFailed);
        };

        match tag {
            b'H' => self.decrypt_hybrid(ciphertext),
            b'h' => self.decrypt_hkdf_blob(ciphertext),
            b'x' => self.decrypt_secretbox_blob(ciphertext),
            _ => self
                .decrypt_hkdf_blob(ciphertext)
                .or_else(|_| self.decrypt_secretbox_blob(ciphertext))
                .map_err(|_| Error::DecryptionFailed),
        }
    }

    fn decrypt_hybrid(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 5 {
            return Err(Error::DecryptionFailed);
        }
        let hkdf_len = u32::from_be_bytes(
            ciphertext[1..5]
                .try_into()
                .map_err(|_| Error::DecryptionFailed)?,
        ) as usize;
        let hkdf_start = 5;
        let hkdf_end = hkdf_start
            .checked_add(hkdf_len)
            .filter(|&end| end <= ciphertext.len())
            .ok_or(Error::DecryptionFailed)?;

        let hkdf_blob = &ciphertext[hkdf_start..hkdf_end];
        if let Ok(plaintext) = self.decrypt_hkdf_blob(hkdf_blob) {
            return Ok(plaintext);
        }

        let secretbox_blob = &ciphertext[hkdf_end..];
        self.decrypt_secretbox_blob(secretbox_blob)
            .map_err(|_| Error::DecryptionFailed)
    }

    fn decrypt_hkdf_blob(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < 1 + AESGCM_NONCE_LEN {
            return Err(Error::DecryptionFailed);
        }
        let key = self.hkdf_key()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| Error::DecryptionFailed)?;
        let nonce = AesNonce::from_slice(&blob[1..1 + AESGCM_NONCE_LEN]);
        cipher
            .decrypt(nonce, &blob[1 + AESGCM_NONCE_LEN..])
            .map_err(|_| Error::DecryptionFailed)
    }

    fn decrypt_secretbox_blob(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < 1 + SECRETBOX_NONCE_LEN {
            return Err(Error::DecryptionFailed);
        }
        let key = self.secretbox_key()?;
        let cipher =
            XSalsa20Poly1305::new_from_slice(key.as_ref()).map_err(|_| Error::DecryptionFailed)?;
        let nonce = XNonce::from_slice(&blob[1..1 + SECRETBOX_NONCE_LEN]);
        cipher
            .decrypt(nonce, &blob[1 + SECRETBOX_NONCE_LEN..])
            .map_err(|_| Error::DecryptionFailed)
    }
}

/// Generate a hex-encoded password of `hex_len` hex characters
/// (`hex_len/2` random bytes). `hex_len` is floored to an even number ≥ 32.
pub fn generate_password(hex_len: usize) -> String {
    let hex_len = hex_len.max(32);
    let byte_len = hex_len / 2;
    let mut bytes = vec![0u8; byte_len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
