//! # `escrow-engine`
//!
//! The off-chain escrow orchestrator: a per-request lifecycle state machine
//! mirroring the on-chain contract, driven by recurring reconciliation jobs
//! that atomically select work, construct transactions, and transition state
//! under strict concurrency safety.
//!
//! Module map, roughly in dependency order:
//!
//! - [`events`]: state-change events published to observers.
//! - [`store`]: serializable persistence of all entities.
//! - [`locker`]: exclusive hot-wallet leases and the lease reaper.
//! - [`selector`]: transactional "lock-and-query" batch selection.
//! - [`lifecycle`]: one handler per requested action.
//! - [`monitor`]: on-chain reconciliation and confirmation handling.
//! - [`scheduler`]: singleflight periodic job driver.
//! - [`intents`]: the typed in-process API external surfaces call into.
//! - [`testing`]: a scriptable in-process chain client for tests and dev.

pub mod events;
pub mod intents;
pub mod lifecycle;
pub mod locker;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod testing;
