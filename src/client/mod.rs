//! Broker client capability traits.
//!
//! Everything the consumption engine needs from a Kafka cluster is
//! expressed here, so the engine can run against the real client
//! (`KafkaClient`) or the in-memory one from `crate::testing`.

pub mod kafka;

use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;

pub use kafka::KafkaClient;

/// A single message read from a partition.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Which end of a partition's log to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPosition {
    Oldest,
    /// The log-end offset, one past the last message.
    Newest,
}

/// Ordered messages from one partition. Errors are stream-level failures,
/// distinct from the stream simply ending.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record>> + Send>>;

/// Read-side operations against a Kafka-compatible cluster.
///
/// Implementations must be safe for concurrent use: one consumption task
/// per partition shares a single client.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// All topic names known to the cluster.
    async fn topics(&self) -> Result<Vec<String>>;

    /// Partition ids of a topic.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Concrete oldest or newest offset of a partition.
    async fn offset(&self, topic: &str, partition: i32, position: OffsetPosition) -> Result<i64>;

    /// Opens a message stream over one partition starting at `start`.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
    ) -> Result<RecordStream>;

    /// Offset bookkeeping for a consumer group.
    async fn offset_manager(&self, group: &str) -> Result<Arc<dyn OffsetManager>>;

    /// Addresses of the cluster's brokers.
    async fn brokers(&self) -> Result<Vec<String>>;

    /// Consumer groups known to one broker. Results may overlap between
    /// brokers; callers deduplicate.
    async fn groups_on_broker(&self, broker: &str) -> Result<Vec<String>>;
}

/// A consumer group's offset store, handing out per-partition managers.
#[async_trait]
pub trait OffsetManager: Send + Sync {
    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Arc<dyn PartitionOffsetManager>>;
}

/// Committed-offset operations for one (group, topic, partition).
///
/// The committed offset is the next offset the group should consume.
#[async_trait]
pub trait PartitionOffsetManager: Send + Sync {
    /// The next offset to consume, as currently committed.
    async fn next_offset(&self) -> Result<i64>;

    /// Advances the committed position. Never rewinds.
    async fn mark_offset(&self, offset: i64) -> Result<()>;

    /// Forces the committed position, rewinding if necessary.
    async fn reset_offset(&self, offset: i64) -> Result<()>;

    /// Flushes any buffered commits. Called when the owning partition
    /// loop ends.
    async fn flush(&self) -> Result<()>;
}
