//! SQLite-backed storage for local development and integration tests.
//! Mirrors the shape of the real queue/table/blob backend without requiring
//! a live cloud storage account.

pub mod body;
pub mod pool;
pub mod state;

pub use body::SqliteBodyStore;
pub use pool::SqlitePoolCache;
pub use state::SqliteStateStore;
