//! Sealed at-rest storage for the thermostat OAuth tokens.
//!
//! ```text
//!  blob = [ver:1][nonce:16][ciphertext:n][tag:32]
//!
//!  root    = HMAC(device secret, "smartpanel/token-vault")
//!  enc key = HMAC(root, "enc")      tag key = HMAC(root, "tag")
//!  block i = HMAC(enc key, nonce ‖ i_le32)     ciphertext = plain ⊕ blocks
//!  tag     = HMAC(tag key, ver ‖ nonce ‖ ciphertext)
//! ```
//!
//! The device secret is the factory MAC, so a flash dump moved to another
//! board does not open.  Any tag mismatch is reported as
//! [`StorageError::Corrupted`] and the blob is erased.

use hmac_sha256::HMAC;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::StoragePort;
use crate::error::StorageError;

use super::auth::AuthTokenSet;

const NS: &str = "auth";
const KEY_TOKENS: &str = "tokens";

const VERSION: u8 = 1;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = 1 + NONCE_LEN;

/// Largest sealed blob read back from storage.
pub const MAX_BLOB: usize = 4096;

#[derive(Serialize, Deserialize)]
struct StoredTokens<'a> {
    access: &'a str,
    refresh: &'a str,
}

pub struct TokenVault {
    enc_key: [u8; 32],
    tag_key: [u8; 32],
}

impl TokenVault {
    pub fn new(device_secret: &[u8]) -> Self {
        let root = HMAC::mac(b"smartpanel/token-vault", device_secret);
        Self {
            enc_key: HMAC::mac(b"enc", root),
            tag_key: HMAC::mac(b"tag", root),
        }
    }

    pub fn seal(&self, tokens: &AuthTokenSet) -> Result<Vec<u8>, StorageError> {
        let plain = postcard::to_allocvec(&StoredTokens {
            access: &tokens.access_token,
            refresh: &tokens.refresh_token,
        })
        .map_err(|_| StorageError::IoError)?;

        let nonce = fill_random_nonce();
        let mut blob = Vec::with_capacity(HEADER_LEN + plain.len() + TAG_LEN);
        blob.push(VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&plain);
        self.apply_keystream(&nonce, &mut blob[HEADER_LEN..]);
        let tag = HMAC::mac(&blob, self.tag_key);
        blob.extend_from_slice(&tag);
        Ok(blob)
    }

    /// Verify and decrypt.  `now_ms` becomes the expiry, so a reloaded set
    /// is refreshed before first use.
    pub fn open(&self, blob: &[u8], now_ms: u64) -> Result<AuthTokenSet, StorageError> {
        if blob.len() < HEADER_LEN + TAG_LEN || blob[0] != VERSION {
            return Err(StorageError::Corrupted);
        }
        let (body, tag) = blob.split_at(blob.len() - TAG_LEN);
        let tag: &[u8; TAG_LEN] = tag.try_into().map_err(|_| StorageError::Corrupted)?;
        if !HMAC::verify(body, self.tag_key, tag) {
            return Err(StorageError::Corrupted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&body[1..HEADER_LEN]);
        let mut plain = body[HEADER_LEN..].to_vec();
        self.apply_keystream(&nonce, &mut plain);
        let stored: StoredTokens<'_> =
            postcard::from_bytes(&plain).map_err(|_| StorageError::Corrupted)?;
        Ok(AuthTokenSet {
            access_token: stored.access.into(),
            refresh_token: stored.refresh.into(),
            expires_at_ms: now_ms,
        })
    }

    /// Load the stored set.  `Ok(None)` when nothing is stored; a corrupt
    /// blob is erased before the error is returned.
    pub fn load(
        &self,
        storage: &mut impl StoragePort,
        now_ms: u64,
    ) -> Result<Option<AuthTokenSet>, StorageError> {
        let mut buf = vec![0u8; MAX_BLOB];
        let n = match storage.read(NS, KEY_TOKENS, &mut buf) {
            Ok(n) => n,
            Err(StorageError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.open(&buf[..n], now_ms) {
            Ok(tokens) => {
                info!("Tado: restored sealed tokens");
                Ok(Some(tokens))
            }
            Err(e) => {
                warn!("Tado: sealed tokens failed verification, erasing");
                Self::erase(storage);
                Err(e)
            }
        }
    }

    pub fn store(
        &self,
        storage: &mut impl StoragePort,
        tokens: &AuthTokenSet,
    ) -> Result<(), StorageError> {
        let blob = self.seal(tokens)?;
        storage.write(NS, KEY_TOKENS, &blob)
    }

    pub fn erase(storage: &mut impl StoragePort) {
        let _ = storage.delete(NS, KEY_TOKENS);
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(32).enumerate() {
            let mut block_in = [0u8; NONCE_LEN + 4];
            block_in[..NONCE_LEN].copy_from_slice(nonce);
            block_in[NONCE_LEN..].copy_from_slice(&(i as u32).to_le_bytes());
            let block = HMAC::mac(block_in, self.enc_key);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }
}

// ── Platform-specific nonce generation ───────────────────────

/// ESP-IDF: hardware RNG via `esp_fill_random`.
#[cfg(target_os = "espidf")]
fn fill_random_nonce() -> [u8; NONCE_LEN] {
    let mut buf = [0u8; NONCE_LEN];
    // SAFETY: esp_fill_random writes exactly `len` bytes into a buffer we
    // own exclusively.
    unsafe {
        esp_idf_sys::esp_fill_random(buf.as_mut_ptr().cast(), buf.len());
    }
    buf
}

/// Simulation: `RandomState` entropy, not cryptographic.
#[cfg(not(target_os = "espidf"))]
fn fill_random_nonce() -> [u8; NONCE_LEN] {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut buf = [0u8; NONCE_LEN];
    for chunk in buf.chunks_mut(8) {
        let val = RandomState::new().build_hasher().finish().to_le_bytes();
        chunk.copy_from_slice(&val[..chunk.len()]);
    }
    buf
}
