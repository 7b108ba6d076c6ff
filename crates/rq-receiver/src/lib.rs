//! Notification intake, per-topic ordered scheduling, and the background
//! queue listener that drives both.

pub mod error;
pub mod intake;
pub mod listener;
pub mod scheduler;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "azure")]
pub mod azure;

pub use error::{ReceiverError, Result};
pub use intake::{decode_notification, NotificationHeader};
pub use listener::{BackgroundListener, PolledMessage, PolledQueue};
pub use scheduler::TopicScheduler;
