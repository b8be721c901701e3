//! Sealing hot-wallet seeds at rest.
//!
//! Seeds are sealed under a single long-lived AES-256-GCM key provided via
//! `ENCRYPTION_KEY`. Each seal samples a fresh random 96-bit nonce, which is
//! prepended to the ciphertext; with random nonces the standard NIST
//! collision bound allows ~2^32 seals per key, far beyond the number of hot
//! wallets a deployment will ever hold.
//!
//! Unsealed seeds are returned wrapped in [`secrecy::Secret`] and must never
//! be cached outside the scope of one signing call.

use std::fmt;

use escrow_hex::FromHex;
use ring::aead::{
    AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey,
};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;

use crate::rng::Crng;

/// Length of the sealing key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("encryption key must be {KEY_LEN} bytes of hex")]
    BadKey,
    #[error("sealed blob is too short to contain nonce and tag")]
    TruncatedBlob,
    #[error("decryption failed: wrong key or corrupted blob")]
    Unseal,
}

/// The process-wide key under which hot-wallet seeds are sealed at rest.
#[derive(Clone)]
pub struct SealKey([u8; KEY_LEN]);

impl SealKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from the 64-hex-char `ENCRYPTION_KEY` env value.
    pub fn from_hex(s: &str) -> Result<Self, SealError> {
        <[u8; KEY_LEN]>::from_hex(s)
            .map(Self)
            .map_err(|_| SealError::BadKey)
    }

    fn aead_key(&self) -> LessSafeKey {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0)
            .expect("KEY_LEN matches AES_256_GCM key length");
        LessSafeKey::new(unbound)
    }

    /// Seal a secret blob: `nonce || ciphertext || tag`.
    pub fn seal(
        &self,
        rng: &mut impl Crng,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SealError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut out = Vec::with_capacity(
            NONCE_LEN + plaintext.len() + AES_256_GCM.tag_len(),
        );
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(plaintext);

        let key = self.aead_key();
        let tag = key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut out[NONCE_LEN..])
            .map_err(|_| SealError::Unseal)?;
        out.extend_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Unseal a blob produced by [`seal`](Self::seal).
    pub fn unseal(&self, sealed: &[u8]) -> Result<Secret<Vec<u8>>, SealError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(SealError::TruncatedBlob);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SealError::TruncatedBlob)?;

        let mut buf = ciphertext.to_vec();
        let key = self.aead_key();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| SealError::Unseal)?;
        Ok(Secret::new(plaintext.to_vec()))
    }
}

// Never leak key material through Debug.
impl fmt::Debug for SealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealKey(..)")
    }
}
