//! Shared building blocks for the Skiff node agent and control plane.

pub mod error;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use store::Store;

/// Epoch seconds, the timestamp convention used across all persisted records.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
