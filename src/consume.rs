//! Concurrent multi-partition consumption.
//!
//! One task per partition resolves its offset range, streams records and
//! funnels them through a single sink task. The sink acknowledges each
//! record before the sender continues, so output is serialized even
//! though partitions are consumed concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};

use crate::client::{
    BrokerClient, OffsetManager, OffsetPosition, PartitionOffsetManager, Record,
};
use crate::offset::{ALL_PARTITIONS, OffsetInterval, OffsetSpec, parse_offsets};
use crate::sink::{RecordSink, SinkVerdict};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    /// Consumer group for offset commits. No group, no commits.
    pub group: Option<String>,
    /// Offset spec in the `crate::offset` grammar.
    pub offsets: String,
    /// Inactivity timeout per partition. None disables it.
    pub timeout: Option<Duration>,
}

/// Terminal state of one partition's consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// The resolved end offset was reached. Normal termination.
    ReachedEnd,
    /// No record arrived within the inactivity timeout. Normal termination.
    TimedOut,
    /// The broker closed the stream.
    StreamClosed,
    /// The shared quit signal fired.
    Cancelled,
    /// A stream or broker error ended this partition; siblings continue.
    Errored,
}

#[derive(Debug)]
pub struct ConsumeSummary {
    pub outcomes: Vec<(i32, PartitionOutcome)>,
    /// Records handed to the sink.
    pub delivered: u64,
    pub errors: usize,
}

struct Delivery {
    record: Record,
    ack: oneshot::Sender<()>,
}

struct Session {
    client: Arc<dyn BrokerClient>,
    topic: String,
    group: Option<String>,
    timeout: Option<Duration>,
    scope: HashMap<i32, OffsetInterval>,
    offset_manager: Option<Arc<dyn OffsetManager>>,
    /// Lazily created per-partition offset managers. The lock is held
    /// across creation so no partition ever gets two.
    poms: Mutex<HashMap<i32, Arc<dyn PartitionOffsetManager>>>,
    quit: broadcast::Sender<()>,
}

/// Consumes the configured partitions until every loop reaches a terminal
/// state. Setup failures (bad spec, no partitions, resume without group)
/// are returned; per-partition failures are logged and counted in the
/// summary without affecting siblings.
pub async fn start_consume(
    client: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
    sink: Box<dyn RecordSink>,
    quit: broadcast::Sender<()>,
) -> Result<ConsumeSummary> {
    let scope = parse_offsets(&config.offsets)?;

    let resumes = scope.values().any(|interval| {
        matches!(interval.start, OffsetSpec::Resume { .. })
            || matches!(interval.end, OffsetSpec::Resume { .. })
    });
    if resumes && config.group.is_none() {
        bail!("cannot resume without a consumer group");
    }

    let offset_manager = match &config.group {
        Some(group) => Some(client.offset_manager(group).await?),
        None => None,
    };

    let session = Arc::new(Session {
        client,
        topic: config.topic,
        group: config.group,
        timeout: config.timeout,
        scope,
        offset_manager,
        poms: Mutex::new(HashMap::new()),
        quit,
    });

    let partitions = session.find_partitions().await?;
    if partitions.is_empty() {
        bail!("no partitions to consume");
    }
    info!(
        "consuming topic {} partitions {partitions:?}",
        session.topic
    );

    let (tx, rx) = mpsc::channel::<Delivery>(1);
    let sink_task = tokio::spawn(run_sink(rx, sink, session.quit.clone()));

    // Every loop subscribes before any record can flow, so none can miss
    // an early quit signal.
    let quit_rxs: Vec<_> = partitions
        .iter()
        .map(|_| session.quit.subscribe())
        .collect();
    let handles: Vec<_> = partitions
        .iter()
        .zip(quit_rxs)
        .map(|(&partition, quit_rx)| {
            let session = session.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                (
                    partition,
                    session.consume_partition(partition, tx, quit_rx).await,
                )
            })
        })
        .collect();
    drop(tx);

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in futures::future::join_all(handles).await {
        let (partition, outcome) = handle.context("partition task panicked")?;
        outcomes.push((partition, outcome));
    }
    let delivered = sink_task.await.context("sink task panicked")?;
    session.close().await;

    let errors = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == PartitionOutcome::Errored)
        .count();
    Ok(ConsumeSummary {
        outcomes,
        delivered,
        errors,
    })
}

/// The single point every partition serializes through.
async fn run_sink(
    mut rx: mpsc::Receiver<Delivery>,
    mut sink: Box<dyn RecordSink>,
    quit: broadcast::Sender<()>,
) -> u64 {
    let mut delivered = 0u64;
    while let Some(Delivery { record, ack }) = rx.recv().await {
        match sink.deliver(&record) {
            Ok(SinkVerdict::Continue) => delivered += 1,
            Ok(SinkVerdict::Stop) => {
                delivered += 1;
                let _ = quit.send(());
            }
            Err(e) => {
                error!("sink failed: {e:#}");
                let _ = quit.send(());
            }
        }
        let _ = ack.send(());
    }
    delivered
}

impl Session {
    /// The partitions in scope: every topic partition when the spec has
    /// an "all" entry, otherwise the explicitly listed ones that exist.
    async fn find_partitions(&self) -> Result<Vec<i32>> {
        let all = self
            .client
            .partitions(&self.topic)
            .await
            .with_context(|| format!("failed to read partitions for topic {:?}", self.topic))?;
        if self.scope.contains_key(&ALL_PARTITIONS) {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|p| self.scope.contains_key(p))
            .collect())
    }

    /// Turns a symbolic offset into a concrete one for `partition`.
    async fn resolve_offset(&self, spec: OffsetSpec, partition: i32) -> Result<i64> {
        match spec {
            OffsetSpec::Absolute(n) => Ok(n),
            OffsetSpec::Oldest { diff } => {
                let oldest = self
                    .client
                    .offset(&self.topic, partition, OffsetPosition::Oldest)
                    .await?;
                Ok(oldest + diff)
            }
            OffsetSpec::Newest { diff } => {
                // The broker's newest points one past the last message.
                let newest = self
                    .client
                    .offset(&self.topic, partition, OffsetPosition::Newest)
                    .await?;
                Ok(newest - 1 + diff)
            }
            OffsetSpec::Resume { diff } => {
                if self.group.is_none() {
                    bail!("cannot resume without a consumer group");
                }
                let pom = self.partition_offsets(partition).await?;
                Ok(pom.next_offset().await? + diff)
            }
        }
    }

    async fn partition_offsets(&self, partition: i32) -> Result<Arc<dyn PartitionOffsetManager>> {
        let manager = self
            .offset_manager
            .as_ref()
            .context("no consumer group configured")?;
        let mut poms = self.poms.lock().await;
        if let Some(pom) = poms.get(&partition) {
            return Ok(pom.clone());
        }
        let pom = manager
            .manage_partition(&self.topic, partition)
            .await
            .with_context(|| format!("failed to create offset manager for partition {partition}"))?;
        poms.insert(partition, pom.clone());
        Ok(pom)
    }

    async fn consume_partition(
        self: Arc<Self>,
        partition: i32,
        out: mpsc::Sender<Delivery>,
        mut quit: broadcast::Receiver<()>,
    ) -> PartitionOutcome {
        let interval = self
            .scope
            .get(&partition)
            .or_else(|| self.scope.get(&ALL_PARTITIONS))
            .copied()
            .unwrap_or_else(OffsetInterval::unbounded);

        let start = match self.resolve_offset(interval.start, partition).await {
            Ok(offset) => offset,
            Err(e) => {
                error!("failed to resolve start offset for partition {partition}: {e:#}");
                return PartitionOutcome::Errored;
            }
        };
        let end = match self.resolve_offset(interval.end, partition).await {
            Ok(offset) => offset,
            Err(e) => {
                error!("failed to resolve end offset for partition {partition}: {e:#}");
                return PartitionOutcome::Errored;
            }
        };
        info!(
            "consuming topic {} partition {partition} in [{start}, {end}] / [{}, {}]",
            self.topic, interval.start, interval.end
        );

        let mut stream = match self
            .client
            .consume_partition(&self.topic, partition, start)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to consume partition {partition} from {start}: {e:#}");
                return PartitionOutcome::Errored;
            }
        };

        let pom = if self.group.is_some() {
            match self.partition_offsets(partition).await {
                Ok(pom) => Some(pom),
                Err(e) => {
                    error!("partition {partition}: {e:#}");
                    return PartitionOutcome::Errored;
                }
            }
        } else {
            None
        };

        let outcome = loop {
            // Recreated each turn, so any received record rearms it.
            let idle = async {
                match self.timeout {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = quit.recv() => break PartitionOutcome::Cancelled,
                _ = idle => {
                    info!(
                        "consuming from partition {partition} timed out after {:?}",
                        self.timeout.unwrap_or_default()
                    );
                    break PartitionOutcome::TimedOut;
                }
                item = stream.next() => match item {
                    None => {
                        debug!("partition {partition} stream closed");
                        break PartitionOutcome::StreamClosed;
                    }
                    Some(Err(e)) => {
                        error!("partition {partition} consumer encountered error: {e:#}");
                        break PartitionOutcome::Errored;
                    }
                    Some(Ok(record)) => {
                        let offset = record.offset;
                        if let Some(pom) = &pom {
                            // Committed offset is the next one to read.
                            if let Err(e) = pom.mark_offset(offset + 1).await {
                                error!("failed to mark offset {} for partition {partition}: {e:#}", offset + 1);
                                break PartitionOutcome::Errored;
                            }
                        }
                        let (ack_tx, ack_rx) = oneshot::channel();
                        if out.send(Delivery { record, ack: ack_tx }).await.is_err() {
                            break PartitionOutcome::Cancelled;
                        }
                        if ack_rx.await.is_err() {
                            break PartitionOutcome::Cancelled;
                        }
                        if end > 0 && offset >= end {
                            break PartitionOutcome::ReachedEnd;
                        }
                    }
                }
            }
        };

        if let Some(pom) = self.poms.lock().await.remove(&partition) {
            log_close(&format!("offset manager for partition {partition}"), pom.flush().await);
        }
        debug!("partition {partition} loop finished: {outcome:?}");
        outcome
    }

    async fn close(&self) {
        let mut poms = self.poms.lock().await;
        for (partition, pom) in poms.drain() {
            log_close(
                &format!("offset manager for partition {partition}"),
                pom.flush().await,
            );
        }
    }
}

fn log_close(what: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!("closed {what}"),
        Err(e) => warn!("failed to close {what}: {e:#}"),
    }
}
