//! Body, message-state, and topic-affinity storage atop a cloud storage
//! account's queue/table/blob primitives. Two backends share the same
//! traits: `embedded` (SQLite, for development and tests) and `azure`
//! (the real cloud storage account), selected by Cargo feature.

pub mod body;
pub mod broker;
pub mod error;
pub mod state;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "azure")]
pub mod azure;

pub use body::{BodyReadResult, BodyStore, BodyWriteOutcome};
pub use broker::{ConnectionCache, ResourceNames};
pub use error::{Result, StorageError};
pub use state::{NotificationResender, ProcessOutcome, StateStore, SubscriberInvoker};
