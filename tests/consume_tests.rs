//! End-to-end consumption scenarios against the in-memory cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ktail::consume::{ConsumerConfig, PartitionOutcome, start_consume};
use ktail::sink::CollectSink;
use ktail::testing::MemoryClient;

fn config(topic: &str, group: Option<&str>, offsets: &str) -> ConsumerConfig {
    ConsumerConfig {
        topic: topic.to_string(),
        group: group.map(str::to_string),
        offsets: offsets.to_string(),
        timeout: None,
    }
}

fn seeded(partitions: usize, per_partition: usize) -> MemoryClient {
    let client = MemoryClient::new();
    client.add_topic("t", partitions);
    for p in 0..partitions {
        for i in 0..per_partition {
            client.produce("t", p as i32, format!("k{i}").as_bytes(), format!("p{p}-v{i}").as_bytes());
        }
    }
    client
}

#[tokio::test]
async fn oldest_to_newest_delivers_everything_exactly_once() {
    let client = seeded(2, 5);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    let summary = start_consume(
        Arc::new(client),
        config("t", None, "all=oldest:newest"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    assert_eq!(summary.delivered, 10);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.outcomes.len(), 2);
    assert!(
        summary
            .outcomes
            .iter()
            .all(|(_, o)| *o == PartitionOutcome::ReachedEnd),
        "outcomes: {:?}",
        summary.outcomes
    );

    // Exactly offsets 0..5 per partition, no duplicates.
    let mut seen: HashMap<i32, Vec<i64>> = HashMap::new();
    for record in records.lock().unwrap().iter() {
        seen.entry(record.partition).or_default().push(record.offset);
    }
    for partition in [0, 1] {
        let offsets = seen.get_mut(&partition).unwrap();
        offsets.sort();
        assert_eq!(*offsets, vec![0, 1, 2, 3, 4], "partition {partition}");
    }
}

#[tokio::test]
async fn resume_starts_exactly_at_committed_offset() {
    let client = seeded(1, 10);
    client.set_committed("g", "t", 0, 7);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    let summary = start_consume(
        Arc::new(client.clone()),
        config("t", Some("g"), "0=resume"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    let offsets: Vec<i64> = records.lock().unwrap().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![7, 8, 9], "no replay of 0..7, no skip past 7");
    assert_eq!(summary.errors, 0);
    // Everything delivered got marked, offset + 1 each time.
    assert_eq!(client.committed("g", "t", 0), Some(10));
}

#[tokio::test]
async fn resume_applies_relative_diff() {
    let client = seeded(1, 10);
    client.set_committed("g", "t", 0, 7);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    start_consume(
        Arc::new(client),
        config("t", Some("g"), "0=resume-2"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    let first = records.lock().unwrap().first().map(|r| r.offset);
    assert_eq!(first, Some(5));
}

#[tokio::test]
async fn newest_relative_start_counts_back_from_log_end() {
    let client = seeded(1, 10);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    // newest resolves to the last message (log end minus one).
    start_consume(
        Arc::new(client),
        config("t", None, "0=newest-3:"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    let offsets: Vec<i64> = records.lock().unwrap().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn bounded_range_is_inclusive_of_its_end() {
    let client = seeded(1, 10);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    let summary = start_consume(
        Arc::new(client),
        config("t", None, "0=1:3"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    let offsets: Vec<i64> = records.lock().unwrap().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![1, 2, 3]);
    assert_eq!(summary.outcomes, vec![(0, PartitionOutcome::ReachedEnd)]);
}

#[tokio::test]
async fn inactivity_timeout_is_normal_termination() {
    let client = seeded(2, 2);
    client.hold_streams_open(true);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    let mut config = config("t", None, "all=oldest:");
    config.timeout = Some(Duration::from_millis(50));
    let summary = start_consume(Arc::new(client), config, Box::new(sink), quit)
        .await
        .unwrap();

    assert_eq!(records.lock().unwrap().len(), 4);
    assert_eq!(summary.errors, 0, "timeouts are not errors");
    assert!(
        summary
            .outcomes
            .iter()
            .all(|(_, o)| *o == PartitionOutcome::TimedOut),
        "outcomes: {:?}",
        summary.outcomes
    );
}

#[tokio::test]
async fn stream_error_is_confined_to_its_partition() {
    let client = seeded(2, 3);
    client.fail_partition_stream("t", 0);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    let summary = start_consume(
        Arc::new(client),
        config("t", None, "all=oldest:"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    assert_eq!(summary.errors, 1);
    let outcomes: HashMap<i32, PartitionOutcome> = summary.outcomes.into_iter().collect();
    assert_eq!(outcomes[&0], PartitionOutcome::Errored);
    assert_eq!(outcomes[&1], PartitionOutcome::StreamClosed);

    // The healthy sibling still delivered its full log.
    let sibling: Vec<i64> = records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.partition == 1)
        .map(|r| r.offset)
        .collect();
    assert_eq!(sibling, vec![0, 1, 2]);
}

#[tokio::test]
async fn one_stream_open_and_one_outcome_per_partition() {
    let client = seeded(4, 2);
    let (quit, _) = broadcast::channel(1);
    let (sink, _) = CollectSink::new();

    let summary = start_consume(
        Arc::new(client.clone()),
        config("t", None, "all=oldest:newest"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    assert_eq!(client.stream_open_count(), 4);
    assert_eq!(summary.outcomes.len(), 4);
}

#[tokio::test]
async fn explicit_partition_overrides_the_all_fallback() {
    let client = seeded(2, 10);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::new();

    start_consume(
        Arc::new(client),
        config("t", None, "all=oldest:newest,1=8:"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    let mut by_partition: HashMap<i32, Vec<i64>> = HashMap::new();
    for record in records.lock().unwrap().iter() {
        by_partition
            .entry(record.partition)
            .or_default()
            .push(record.offset);
    }
    by_partition.values_mut().for_each(|v| v.sort());
    assert_eq!(by_partition[&0], (0..10).collect::<Vec<i64>>());
    assert_eq!(by_partition[&1], vec![8, 9]);
}

#[tokio::test]
async fn sink_stop_cancels_all_partitions() {
    let client = seeded(2, 50);
    client.hold_streams_open(true);
    let (quit, _) = broadcast::channel(1);
    let (sink, records) = CollectSink::stopping_after(3);

    let summary = start_consume(
        Arc::new(client),
        config("t", None, "all=oldest:"),
        Box::new(sink),
        quit,
    )
    .await
    .unwrap();

    // Cancellation is cooperative, so a few in-flight records may land
    // after the stop verdict, but nowhere near the full logs.
    let collected = records.lock().unwrap().len();
    assert!(collected >= 3, "collected {collected}");
    assert!(collected < 100, "collected {collected}");
    assert_eq!(summary.outcomes.len(), 2);
    assert!(
        summary
            .outcomes
            .iter()
            .all(|(_, o)| *o == PartitionOutcome::Cancelled),
        "outcomes: {:?}",
        summary.outcomes
    );
}
