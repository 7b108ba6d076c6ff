//! Core data model, identity, error taxonomy, and logging shared by every
//! reliable-queue crate.

pub mod error;
pub mod identity;
pub mod logging;
pub mod model;

pub use error::{ReliableQueueError, Result};
pub use identity::{safe, safe_opt, table_safe, RuntimeContext};
pub use model::{Message, MessageState, QueueKey, Topic, TopicAffinity, DEFAULT_TOPIC_ID};

/// Derived storage names for the underlying queue, blob container, and
/// tables backing a given queue key. Stable across processes and restarts.
pub mod naming {
    use crate::model::QueueKey;

    pub fn body_container(queue_key: &QueueKey) -> String {
        format!("reliable-queue-body-{}", queue_key.safe())
    }

    pub fn notification_queue(queue_key: &QueueKey) -> String {
        format!("reliable-queue-{}", queue_key.safe())
    }

    pub fn state_table(queue_key: &QueueKey) -> String {
        format!("ReliableQueueState{}", queue_key.table_safe())
    }

    pub fn topic_table(queue_key: &QueueKey) -> String {
        format!("ReliableQueueTopic{}", queue_key.table_safe())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn names_are_bit_exact() {
            let qk = QueueKey::new("Orders");
            assert_eq!(body_container(&qk), "reliable-queue-body-orders");
            assert_eq!(notification_queue(&qk), "reliable-queue-orders");
            assert_eq!(state_table(&qk), "ReliableQueueStateOrders");
            assert_eq!(topic_table(&qk), "ReliableQueueTopicOrders");
        }
    }
}
