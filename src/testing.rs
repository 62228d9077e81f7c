//! In-memory `BrokerClient` for tests.
//!
//! Holds topics, records and committed group offsets in process, counts
//! stream opens, and can hold streams open (to exercise the inactivity
//! timeout) or inject a stream error after the stored records.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{
    BrokerClient, OffsetManager, OffsetPosition, PartitionOffsetManager, Record, RecordStream,
};

#[derive(Clone)]
struct StoredRecord {
    key: Bytes,
    value: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
    fail_after_snapshot: bool,
}

#[derive(Default)]
struct MemoryState {
    topics: DashMap<String, Vec<PartitionLog>>,
    /// (group, topic, partition) -> next offset to consume.
    committed: DashMap<(String, String, i32), i64>,
    /// broker address -> groups it knows about.
    brokers: DashMap<String, Vec<String>>,
    stream_opens: AtomicUsize,
    hold_open: AtomicBool,
}

/// Fake cluster. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryClient {
    state: Arc<MemoryState>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&self, name: &str, partitions: usize) {
        let logs = (0..partitions).map(|_| PartitionLog::default()).collect();
        self.state.topics.insert(name.to_string(), logs);
    }

    /// Appends a record, returning its offset.
    pub fn produce(&self, topic: &str, partition: i32, key: &[u8], value: &[u8]) -> i64 {
        let mut logs = self
            .state
            .topics
            .get_mut(topic)
            .unwrap_or_else(|| panic!("unknown topic {topic:?}"));
        let log = &mut logs[partition as usize];
        log.records.push(StoredRecord {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            timestamp: Utc::now(),
        });
        (log.records.len() - 1) as i64
    }

    pub fn set_committed(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state
            .committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|v| *v)
    }

    pub fn add_broker(&self, addr: &str, groups: &[&str]) {
        self.state
            .brokers
            .insert(addr.to_string(), groups.iter().map(|g| g.to_string()).collect());
    }

    /// Streams for this partition yield an error after the stored records.
    pub fn fail_partition_stream(&self, topic: &str, partition: i32) {
        let mut logs = self.state.topics.get_mut(topic).expect("unknown topic");
        logs[partition as usize].fail_after_snapshot = true;
    }

    /// Keeps streams open after the stored records instead of ending them,
    /// the way a live partition with no traffic behaves.
    pub fn hold_streams_open(&self, hold: bool) {
        self.state.hold_open.store(hold, Ordering::SeqCst);
    }

    pub fn stream_open_count(&self) -> usize {
        self.state.stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn topics(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .state
            .topics
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let logs = self
            .state
            .topics
            .get(topic)
            .ok_or_else(|| anyhow!("topic {topic:?} not found"))?;
        Ok((0..logs.len() as i32).collect())
    }

    async fn offset(&self, topic: &str, partition: i32, position: OffsetPosition) -> Result<i64> {
        let logs = self
            .state
            .topics
            .get(topic)
            .ok_or_else(|| anyhow!("topic {topic:?} not found"))?;
        let log = logs
            .get(partition as usize)
            .ok_or_else(|| anyhow!("partition {topic}/{partition} not found"))?;
        Ok(match position {
            OffsetPosition::Oldest => 0,
            OffsetPosition::Newest => log.records.len() as i64,
        })
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
    ) -> Result<RecordStream> {
        self.state.stream_opens.fetch_add(1, Ordering::SeqCst);

        let (snapshot, fail) = {
            let logs = self
                .state
                .topics
                .get(topic)
                .ok_or_else(|| anyhow!("topic {topic:?} not found"))?;
            let log = logs
                .get(partition as usize)
                .ok_or_else(|| anyhow!("partition {topic}/{partition} not found"))?;
            (log.records.clone(), log.fail_after_snapshot)
        };

        let hold_open = self.state.hold_open.load(Ordering::SeqCst);
        let topic = topic.to_string();
        let first = start.max(0) as usize;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            for (i, stored) in snapshot.iter().enumerate().skip(first) {
                let record = Record {
                    topic: topic.clone(),
                    partition,
                    offset: i as i64,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    timestamp: Some(stored.timestamp),
                };
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
            if fail {
                let _ = tx.send(Err(anyhow!("injected stream failure"))).await;
                return;
            }
            if hold_open {
                tx.closed().await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn offset_manager(&self, group: &str) -> Result<Arc<dyn OffsetManager>> {
        Ok(Arc::new(MemoryOffsetManager {
            state: self.state.clone(),
            group: group.to_string(),
        }))
    }

    async fn brokers(&self) -> Result<Vec<String>> {
        let mut addrs: Vec<_> = self
            .state
            .brokers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        addrs.sort();
        Ok(addrs)
    }

    async fn groups_on_broker(&self, broker: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .brokers
            .get(broker)
            .map(|g| g.value().clone())
            .unwrap_or_default())
    }
}

struct MemoryOffsetManager {
    state: Arc<MemoryState>,
    group: String,
}

#[async_trait]
impl OffsetManager for MemoryOffsetManager {
    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Arc<dyn PartitionOffsetManager>> {
        Ok(Arc::new(MemoryPartitionOffsetManager {
            state: self.state.clone(),
            key: (self.group.clone(), topic.to_string(), partition),
        }))
    }
}

struct MemoryPartitionOffsetManager {
    state: Arc<MemoryState>,
    key: (String, String, i32),
}

#[async_trait]
impl PartitionOffsetManager for MemoryPartitionOffsetManager {
    async fn next_offset(&self) -> Result<i64> {
        Ok(self.state.committed.get(&self.key).map(|v| *v).unwrap_or(0))
    }

    async fn mark_offset(&self, offset: i64) -> Result<()> {
        self.state
            .committed
            .entry(self.key.clone())
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
        Ok(())
    }

    async fn reset_offset(&self, offset: i64) -> Result<()> {
        self.state.committed.insert(self.key.clone(), offset);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
