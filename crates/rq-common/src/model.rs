//! Core data model: `QueueKey`, `Topic`, `Message`, `TopicAffinity`.

use crate::identity::{safe, table_safe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The reserved topic identifier used when the sender supplies no topic.
pub const DEFAULT_TOPIC_ID: &str = "__default__";

/// A case-insensitive queue name plus its two derived, storage-safe
/// identifiers. Equality and ordering are over the sanitized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueKey {
    name: String,
    safe: String,
    table_safe: String,
}

impl QueueKey {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let lower = name.to_ascii_lowercase();
        Self {
            safe: safe(&lower),
            table_safe: table_safe(&lower),
            name,
        }
    }

    /// Original, user-supplied name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase-alphanumeric identifier safe for queue/container names.
    pub fn safe(&self) -> &str {
        &self.safe
    }

    /// Identifier safe for table names (starts with a letter).
    pub fn table_safe(&self) -> &str {
        &self.table_safe
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.safe == other.safe
    }
}
impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.safe.cmp(&other.safe)
    }
}

impl std::hash::Hash for QueueKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.safe.hash(state);
    }
}

/// A case-insensitive topic name. Empty/blank means the reserved default
/// topic, which bypasses affinity (see `rq-affinity`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    name: String,
    id: String,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            return Self::default_topic();
        }
        let lower = name.trim().to_ascii_lowercase();
        Self {
            id: safe(&lower),
            name,
        }
    }

    pub fn default_topic() -> Self {
        Self {
            name: String::new(),
            id: DEFAULT_TOPIC_ID.to_string(),
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        if id == DEFAULT_TOPIC_ID {
            return Self::default_topic();
        }
        Self { name: id.clone(), id }
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_TOPIC_ID
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Topic {}

/// The message lifecycle. `Unknown` is intentionally not a variant: an
/// unparseable persisted state is a hard error rather than a silently
/// observable sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    New,
    Queued,
    Processing,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::New => "New",
            MessageState::Queued => "Queued",
            MessageState::Processing => "Processing",
            MessageState::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(MessageState::New),
            "Queued" => Some(MessageState::Queued),
            "Processing" => Some(MessageState::Processing),
            "Failed" => Some(MessageState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per in-flight message; the durable entity in the state table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub queue_key: String,
    pub topic: String,
    pub source: String,
    pub owner: String,
    pub created_utc: DateTime<Utc>,
    pub last_updated_utc: DateTime<Utc>,
    /// Global ordering key, assigned from a storage-assigned timestamp on
    /// first persist. Immutable thereafter.
    pub sequence: i64,
    /// Per-process monotonically increasing counter, same-source
    /// tie-breaker.
    pub local_sequence: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: MessageState,
    pub processing_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    pub body_is_null: bool,
    pub size: Option<u64>,
    /// Optimistic-concurrency token. Empty until the row exists in storage.
    #[serde(default)]
    pub e_tag: String,
    pub partition_key: String,
    pub row_key: String,
}

impl Message {
    /// Create a brand-new message in state `New`, owned and sourced by
    /// `source_identity`. `sequence` and `e_tag` are not yet assigned
    /// (filled in by the state store on `add`).
    pub fn new(
        queue_key: &QueueKey,
        topic: &Topic,
        source_identity: &str,
        local_sequence: u32,
        max_attempts: u32,
        processing_timeout_secs: u64,
        overall_timeout_secs: u64,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            row_key: id.clone(),
            id,
            queue_key: queue_key.safe().to_string(),
            topic: topic.id().to_string(),
            source: source_identity.to_string(),
            owner: source_identity.to_string(),
            created_utc: now,
            last_updated_utc: now,
            sequence: 0,
            local_sequence,
            attempts: 0,
            max_attempts,
            state: MessageState::New,
            processing_timeout_secs,
            overall_timeout_secs,
            body_is_null: true,
            size: None,
            e_tag: String::new(),
            partition_key: topic.id().to_string(),
        }
    }

    /// Orders two messages for delivery: messages created by this same
    /// process identity compare by their local sequence counter (a cheap,
    /// monotonic same-source tie-breaker); everything else compares by the
    /// storage-assigned global sequence.
    pub fn cmp_order(&self, other: &Self, this_process_identity: &str) -> Ordering {
        if self.source == other.source && self.source == this_process_identity {
            self.local_sequence.cmp(&other.local_sequence)
        } else {
            self.sequence.cmp(&other.sequence)
        }
    }
}

/// One row per (queue, topic) while a topic affinity grant is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicAffinity {
    pub partition_key: String,
    pub row_key: String,
    pub owner: String,
    pub last_updated_utc: DateTime<Utc>,
    #[serde(default)]
    pub e_tag: String,
}

impl TopicAffinity {
    pub fn new(queue_key: &QueueKey, topic: &Topic, owner: &str) -> Self {
        Self {
            partition_key: queue_key.safe().to_string(),
            row_key: topic.id().to_string(),
            owner: owner.to_string(),
            last_updated_utc: Utc::now(),
            e_tag: String::new(),
        }
    }
}
