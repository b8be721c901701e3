//! Hot-wallet key derivation and transaction signing.
//!
//! Seeds live sealed in the store ([`HotWallet::sealed_seed`]) and are
//! unsealed on demand inside [`sign_tx`]; the unsealed seed never escapes
//! the scope of one signing call.

use escrow_core::{
    ids::Vkey,
    model::HotWallet,
    seal::{SealError, SealKey},
};
use ring::signature::{Ed25519KeyPair, KeyPair as _};
use secrecy::ExposeSecret;
use thiserror::Error;

use crate::{
    hash::blake2b_224,
    txbuild::{SignedTx, TxBody, VkeyWitness},
};

/// Length of a raw ed25519 signing seed.
pub const SEED_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("could not unseal wallet seed: {0}")]
    Unseal(#[from] SealError),
    #[error("sealed seed is not {SEED_LEN} bytes")]
    BadSeedLength,
    #[error("seed was rejected by the signature backend")]
    BadSeed,
    #[error(
        "derived verification key hash does not match the wallet record"
    )]
    VkeyMismatch,
}

/// The verification-key hash of an ed25519 public key.
pub fn vkey_of_public_key(public_key: &[u8]) -> Vkey {
    Vkey::new(blake2b_224(public_key))
}

/// The verification-key hash of the public key derived from a raw seed.
pub fn vkey_of_seed(seed: &[u8; SEED_LEN]) -> Result<Vkey, SignError> {
    let key_pair = Ed25519KeyPair::from_seed_unchecked(seed)
        .map_err(|_| SignError::BadSeed)?;
    Ok(vkey_of_public_key(key_pair.public_key().as_ref()))
}

/// Unseal the wallet's seed and sign the transaction body, returning the
/// signed transaction. Verifies that the derived verification-key hash
/// matches the wallet record before signing; a mismatch means the sealed
/// seed does not belong to this wallet.
pub fn sign_tx(
    seal_key: &SealKey,
    wallet: &HotWallet,
    body: TxBody,
) -> Result<SignedTx, SignError> {
    let seed = seal_key.unseal(&wallet.sealed_seed)?;
    let seed_bytes: &[u8; SEED_LEN] = seed
        .expose_secret()
        .as_slice()
        .try_into()
        .map_err(|_| SignError::BadSeedLength)?;

    let key_pair = Ed25519KeyPair::from_seed_unchecked(seed_bytes)
        .map_err(|_| SignError::BadSeed)?;

    let public_key: [u8; 32] = key_pair
        .public_key()
        .as_ref()
        .try_into()
        .expect("ed25519 public keys are 32 bytes");
    if vkey_of_public_key(&public_key) != wallet.vkey {
        return Err(SignError::VkeyMismatch);
    }

    let signature: [u8; 64] = key_pair
        .sign(body.hash().as_bytes())
        .as_ref()
        .try_into()
        .expect("ed25519 signatures are 64 bytes");

    Ok(SignedTx {
        body,
        witnesses: vec![VkeyWitness {
            public_key,
            signature,
        }],
    })
}
