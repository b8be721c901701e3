//! # `escrow-core`
//!
//! Domain types shared by every escrowd crate: the persisted data model
//! (payment sources, hot wallets, requests, transactions), the lifecycle
//! action and state enums, timestamps, amounts, configuration, and the
//! primitives for sealing hot-wallet seeds at rest.
//!
//! This crate deliberately knows nothing about the chain wire format or the
//! engine's scheduling; those live in `escrow-chain` and `escrow-engine`.

/// Lifecycle actions, next-action records, and park error types.
pub mod action;
/// Asset amounts and fund lists.
pub mod amount;
/// Workspace-wide constants.
pub mod constants;
/// Environment-based service configuration.
pub mod config;
/// Id newtypes for persisted entities and chain artifacts.
pub mod ids;
/// The persisted entity model.
pub mod model;
/// The blockchain network tag.
pub mod network;
/// Random number generation utilities.
pub mod rng;
/// Sealing hot-wallet seeds at rest.
pub mod seal;
/// On-chain states, transaction statuses, wallet kinds.
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// Millisecond unix timestamps.
pub mod time;
