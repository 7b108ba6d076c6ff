//! Azure Storage-backed implementation: tables for message/topic state,
//! blob containers with leases for bodies, and storage queues for
//! notifications.

pub mod body;
pub mod broker;
pub mod state;

pub use body::AzureBodyStore;
pub use broker::AzureResourceBroker;
pub use state::AzureStateStore;
