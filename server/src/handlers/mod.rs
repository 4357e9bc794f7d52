//! Request handlers for sync operations.

mod export;
mod pull;
mod push;
mod session;

pub use export::*;
pub use pull::*;
pub use push::*;
pub use session::*;

use ward_engine::Timestamp;

/// Milliseconds since the epoch, the engine's timestamp unit.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
