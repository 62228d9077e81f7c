//! `BrokerClient` backed by rdkafka.
//!
//! Metadata and offset lookups go through a shared `BaseConsumer` on the
//! blocking pool; each consumed partition gets its own `StreamConsumer`
//! pinned to an explicit start offset.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    BrokerClient, OffsetManager, OffsetPosition, PartitionOffsetManager, Record, RecordStream,
};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct KafkaClient {
    config: ClientConfig,
    base: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaClient {
    /// Connects to `brokers` (comma separated `host:port` list). `group`
    /// becomes the client's consumer group; without one a throwaway id is
    /// used since librdkafka insists on having something.
    pub fn new(brokers: &str, group: Option<&str>, client_id: &str) -> Result<Self> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("group.id", group.unwrap_or("ktail-anonymous"))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");

        let base: BaseConsumer = config
            .create()
            .with_context(|| format!("failed to connect to brokers {brokers}"))?;

        Ok(Self {
            config,
            base: Arc::new(base),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        })
    }

    /// Runs a blocking librdkafka call off the async runtime.
    async fn with_base<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> Result<T> + Send + 'static,
    {
        let base = self.base.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || f(base.as_ref(), timeout)).await?
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    async fn topics(&self) -> Result<Vec<String>> {
        self.with_base(|base, timeout| {
            let metadata = base.fetch_metadata(None, timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topic = topic.to_string();
        self.with_base(move |base, timeout| {
            let metadata = base.fetch_metadata(Some(&topic), timeout)?;
            let t = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| anyhow!("topic {topic:?} not found"))?;
            Ok(t.partitions().iter().map(|p| p.id()).collect())
        })
        .await
    }

    async fn offset(&self, topic: &str, partition: i32, position: OffsetPosition) -> Result<i64> {
        let topic = topic.to_string();
        self.with_base(move |base, timeout| {
            let (low, high) = base
                .fetch_watermarks(&topic, partition, timeout)
                .with_context(|| format!("failed to fetch watermarks for {topic}/{partition}"))?;
            Ok(match position {
                OffsetPosition::Oldest => low,
                OffsetPosition::Newest => high,
            })
        })
        .await
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
    ) -> Result<RecordStream> {
        let consumer: StreamConsumer = self.config.clone().create()?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(start))?;
        consumer.assign(&tpl)?;
        debug!("assigned {topic}/{partition} at offset {start}");

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = consumer.recv() => {
                        let item = received
                            .map(|msg| Record {
                                topic: msg.topic().to_string(),
                                partition: msg.partition(),
                                offset: msg.offset(),
                                key: Bytes::copy_from_slice(msg.key().unwrap_or_default()),
                                value: Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
                                timestamp: msg
                                    .timestamp()
                                    .to_millis()
                                    .and_then(chrono::DateTime::from_timestamp_millis),
                            })
                            .map_err(Into::into);
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn offset_manager(&self, group: &str) -> Result<Arc<dyn OffsetManager>> {
        let mut config = self.config.clone();
        config.set("group.id", group);
        let consumer: BaseConsumer = config
            .create()
            .with_context(|| format!("failed to create offset manager for group {group:?}"))?;
        Ok(Arc::new(KafkaOffsetManager {
            consumer: Arc::new(consumer),
            timeout: self.timeout,
        }))
    }

    async fn brokers(&self) -> Result<Vec<String>> {
        self.with_base(|base, timeout| {
            let metadata = base.fetch_metadata(None, timeout)?;
            Ok(metadata
                .brokers()
                .iter()
                .map(|b| format!("{}:{}", b.host(), b.port()))
                .collect())
        })
        .await
    }

    async fn groups_on_broker(&self, broker: &str) -> Result<Vec<String>> {
        // librdkafka's group listing already fans out to every broker in
        // the cluster, so the broker argument is informational here and
        // duplicate results are left to the caller's dedup.
        debug!("listing groups (asked for broker {broker})");
        self.with_base(|base, timeout| {
            let groups = base.fetch_group_list(None, timeout)?;
            Ok(groups
                .groups()
                .iter()
                .map(|g| g.name().to_string())
                .collect())
        })
        .await
    }
}

struct KafkaOffsetManager {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

#[async_trait]
impl OffsetManager for KafkaOffsetManager {
    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Arc<dyn PartitionOffsetManager>> {
        Ok(Arc::new(KafkaPartitionOffsetManager {
            consumer: self.consumer.clone(),
            topic: topic.to_string(),
            partition,
            timeout: self.timeout,
            marked: AtomicI64::new(-1),
        }))
    }
}

struct KafkaPartitionOffsetManager {
    consumer: Arc<BaseConsumer>,
    topic: String,
    partition: i32,
    timeout: Duration,
    /// Highest offset marked so far, -1 before the first mark.
    marked: AtomicI64,
}

impl KafkaPartitionOffsetManager {
    async fn commit(&self, offset: i64, mode: CommitMode) -> Result<()> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset))?;
            consumer.commit(&tpl, mode)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl PartitionOffsetManager for KafkaPartitionOffsetManager {
    async fn next_offset(&self) -> Result<i64> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, partition);
            let committed = consumer.committed_offsets(tpl, timeout)?;
            let elem = committed
                .find_partition(&topic, partition)
                .ok_or_else(|| anyhow!("no committed entry for {topic}/{partition}"))?;
            match elem.offset() {
                Offset::Offset(n) => Ok(n),
                // Nothing committed yet: start from the log start.
                _ => Ok(0),
            }
        })
        .await?
    }

    async fn mark_offset(&self, offset: i64) -> Result<()> {
        let previous = self.marked.fetch_max(offset, Ordering::SeqCst);
        if offset <= previous {
            return Ok(());
        }
        self.commit(offset, CommitMode::Async).await
    }

    async fn reset_offset(&self, offset: i64) -> Result<()> {
        self.marked.store(offset, Ordering::SeqCst);
        self.commit(offset, CommitMode::Sync).await
    }

    async fn flush(&self) -> Result<()> {
        let marked = self.marked.load(Ordering::SeqCst);
        if marked < 0 {
            return Ok(());
        }
        if let Err(e) = self.commit(marked, CommitMode::Sync).await {
            warn!(
                "failed to flush offset {marked} for {}/{}: {e:#}",
                self.topic, self.partition
            );
            return Err(e);
        }
        Ok(())
    }
}
