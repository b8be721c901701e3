//! Utilities and extensions built on top of Tokio, shared by the escrowd
//! service crates.

/// `Shutdown`, the process-wide shutdown latch.
pub mod shutdown;
/// `Task` and associated helpers.
pub mod task;

// Can save a `tokio` dependency declaration
pub use tokio;
