//! # `escrow-chain`
//!
//! Everything that touches the chain wire: the [`ChainClient`] abstraction
//! over the ledger indexer, the Plutus-data codec for the escrow contract's
//! datum and redeemers, slot arithmetic and validity windows, transaction
//! construction with two-pass execution-budget estimation, and hot-wallet
//! signing.
//!
//! [`ChainClient`]: crate::client::ChainClient

/// `ChainClient` trait, error classification, and the HTTP indexer client.
pub mod client;
/// Datum/redeemer encoding for the escrow contract (`ScriptCodec`).
pub mod codec;
/// BLAKE2b digests used by the chain.
pub mod hash;
/// `PlutusData` and its canonical CBOR form.
pub mod plutus;
/// Slot arithmetic and transaction validity windows.
pub mod slots;
/// Test support: a scriptable in-process ledger implementing `ChainClient`.
pub mod testing;
/// Transaction construction and fee/budget estimation.
pub mod txbuild;
/// Hot-wallet key derivation and transaction signing.
pub mod wallet;
