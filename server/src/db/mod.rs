//! Database module for PostgreSQL persistence.

mod clock;
mod pool;
mod records;
mod sessions;
mod snapshots;

pub use clock::*;
pub use pool::*;
pub use records::*;
pub use sessions::*;
pub use snapshots::*;
