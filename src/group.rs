//! Consumer-group inspection: discovery, per-partition lag, offset reset.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::client::{BrokerClient, OffsetPosition};

/// Where to move a group's committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    Oldest,
    Newest,
    Absolute(i64),
}

impl FromStr for ResetTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oldest" => Ok(ResetTarget::Oldest),
            "newest" => Ok(ResetTarget::Newest),
            _ => match s.parse::<i64>() {
                Ok(n) if n >= 0 => Ok(ResetTarget::Absolute(n)),
                _ => Err(anyhow!(
                    "invalid reset {s:?}: newest, oldest or a specific offset expected"
                )),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    /// Inspect only this group; discover all groups when unset.
    pub group: Option<String>,
    /// Inspect only this topic; all topics (optionally filtered) when unset.
    pub topic: Option<String>,
    pub filter_groups: Option<Regex>,
    pub filter_topics: Option<Regex>,
    /// Partitions to limit to; empty means every partition of the topic.
    pub partitions: Vec<i32>,
    pub reset: Option<ResetTarget>,
    /// When false, only group names are reported. Much faster.
    pub fetch_offsets: bool,
    /// Include partitions without a committed offset.
    pub all_offsets: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOffset {
    pub partition: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub offsets: Vec<GroupOffset>,
}

/// Lists groups and, unless disabled, their per-partition offsets and lag.
/// With a reset target, moves each selected partition's committed offset
/// first: forward via mark, backward via reset.
pub async fn inspect_groups(
    client: Arc<dyn BrokerClient>,
    config: GroupConfig,
) -> Result<Vec<GroupInfo>> {
    if config.reset.is_some() && (config.group.is_none() || config.topic.is_none()) {
        bail!("group and topic are required to reset offsets");
    }

    let groups = match &config.group {
        Some(group) => vec![group.clone()],
        None => {
            let mut groups = find_groups(&client).await?;
            if let Some(filter) = &config.filter_groups {
                groups.retain(|g| filter.is_match(g));
            }
            info!("found {} groups", groups.len());
            groups
        }
    };

    if !config.fetch_offsets {
        return Ok(groups
            .into_iter()
            .map(|group| GroupInfo {
                group,
                topic: None,
                offsets: Vec::new(),
            })
            .collect());
    }

    let topics = match (&config.topic, &config.filter_topics) {
        (Some(topic), _) => vec![topic.clone()],
        (None, filter) => {
            let mut topics = client.topics().await?;
            if let Some(filter) = filter {
                topics.retain(|t| filter.is_match(t));
            }
            info!("found {} topics", topics.len());
            topics
        }
    };

    let mut handles = Vec::new();
    for group in &groups {
        for topic in &topics {
            let partitions = if config.partitions.is_empty() {
                client
                    .partitions(topic)
                    .await
                    .with_context(|| format!("failed to read partitions for topic {topic:?}"))?
            } else {
                config.partitions.clone()
            };
            let client = client.clone();
            let group = group.clone();
            let topic = topic.clone();
            let reset = config.reset;
            let all_offsets = config.all_offsets;
            handles.push(tokio::spawn(async move {
                group_topic_offsets(client, group, topic, partitions, reset, all_offsets).await
            }));
        }
    }

    let mut infos = Vec::new();
    for handle in futures::future::join_all(handles).await {
        if let Some(info) = handle.context("group inspection task panicked")? {
            infos.push(info);
        }
    }
    infos.sort_by(|a, b| (&a.group, &a.topic).cmp(&(&b.group, &b.topic)));
    Ok(infos)
}

/// Enumerates groups from every broker and deduplicates the union.
async fn find_groups(client: &Arc<dyn BrokerClient>) -> Result<Vec<String>> {
    let brokers = client.brokers().await?;
    debug!("querying {} brokers for groups", brokers.len());

    let (tx, mut rx) = mpsc::channel::<String>(16);
    for broker in brokers {
        let client = client.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match client.groups_on_broker(&broker).await {
                Ok(groups) => {
                    for group in groups {
                        if tx.send(group).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("failed to list groups on broker {broker}: {e:#}"),
            }
        });
    }
    drop(tx);

    let mut seen = HashSet::new();
    while let Some(group) = rx.recv().await {
        seen.insert(group);
    }
    let mut groups: Vec<_> = seen.into_iter().collect();
    groups.sort();
    Ok(groups)
}

/// Fans out one task per partition and collects the rows in partition order.
async fn group_topic_offsets(
    client: Arc<dyn BrokerClient>,
    group: String,
    topic: String,
    partitions: Vec<i32>,
    reset: Option<ResetTarget>,
    all_offsets: bool,
) -> Option<GroupInfo> {
    let (tx, mut rx) = mpsc::channel::<GroupOffset>(16);
    for partition in partitions {
        let client = client.clone();
        let group = group.clone();
        let topic = topic.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match fetch_group_offset(&client, &group, &topic, partition, reset, all_offsets).await
            {
                Ok(Some(row)) => {
                    let _ = tx.send(row).await;
                }
                Ok(None) => {}
                Err(e) => error!(
                    "failed to fetch offset for group={group} topic={topic} partition={partition}: {e:#}"
                ),
            }
        });
    }
    drop(tx);

    let mut offsets = Vec::new();
    while let Some(row) = rx.recv().await {
        offsets.push(row);
    }
    if offsets.is_empty() {
        return None;
    }
    offsets.sort_by_key(|o| o.partition);
    Some(GroupInfo {
        group,
        topic: Some(topic),
        offsets,
    })
}

async fn fetch_group_offset(
    client: &Arc<dyn BrokerClient>,
    group: &str,
    topic: &str,
    partition: i32,
    reset: Option<ResetTarget>,
    all_offsets: bool,
) -> Result<Option<GroupOffset>> {
    debug!("fetching offsets for group={group} topic={topic} partition={partition}");
    let manager = client.offset_manager(group).await?;
    let pom = manager.manage_partition(topic, partition).await?;
    let mut committed = pom.next_offset().await?;

    if let Some(target) = reset {
        let resolved = match target {
            ResetTarget::Absolute(n) => n,
            ResetTarget::Oldest => client.offset(topic, partition, OffsetPosition::Oldest).await?,
            ResetTarget::Newest => client.offset(topic, partition, OffsetPosition::Newest).await?,
        };
        if resolved > committed {
            pom.mark_offset(resolved).await?;
        } else {
            pom.reset_offset(resolved).await?;
        }
        info!("moved group={group} topic={topic} partition={partition} from {committed} to {resolved}");
        committed = resolved;

        // Pinned to a log end this instant; lag would be noise.
        if !matches!(target, ResetTarget::Absolute(_)) {
            return Ok(Some(GroupOffset {
                partition,
                partition_offset: None,
                group_offset: None,
                lag: None,
            }));
        }
    }

    let newest = client.offset(topic, partition, OffsetPosition::Newest).await?;
    let lag = newest - committed;
    if committed > 0 || all_offsets {
        Ok(Some(GroupOffset {
            partition,
            partition_offset: Some(newest),
            group_offset: Some(committed),
            lag: Some(lag),
        }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryClient;

    fn seeded_client() -> MemoryClient {
        let client = MemoryClient::new();
        client.add_topic("orders", 2);
        for i in 0..10 {
            client.produce("orders", 0, b"k", format!("v{i}").as_bytes());
        }
        for i in 0..4 {
            client.produce("orders", 1, b"k", format!("v{i}").as_bytes());
        }
        client
    }

    fn config_for(group: &str, topic: &str) -> GroupConfig {
        GroupConfig {
            group: Some(group.to_string()),
            topic: Some(topic.to_string()),
            fetch_offsets: true,
            ..GroupConfig::default()
        }
    }

    #[tokio::test]
    async fn lag_is_newest_minus_committed() {
        let client = seeded_client();
        client.set_committed("g", "orders", 0, 7);
        client.set_committed("g", "orders", 1, 4);

        let infos = inspect_groups(Arc::new(client), config_for("g", "orders"))
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        let offsets = &infos[0].offsets;
        assert_eq!(
            offsets[0],
            GroupOffset {
                partition: 0,
                partition_offset: Some(10),
                group_offset: Some(7),
                lag: Some(3),
            }
        );
        assert_eq!(offsets[1].lag, Some(0));
    }

    #[tokio::test]
    async fn uncommitted_partitions_hidden_unless_all_offsets() {
        let client = seeded_client();
        client.set_committed("g", "orders", 0, 7);

        let infos = inspect_groups(Arc::new(client.clone()), config_for("g", "orders"))
            .await
            .unwrap();
        assert_eq!(infos[0].offsets.len(), 1);

        let mut config = config_for("g", "orders");
        config.all_offsets = true;
        let infos = inspect_groups(Arc::new(client), config).await.unwrap();
        assert_eq!(infos[0].offsets.len(), 2);
    }

    #[tokio::test]
    async fn discovery_deduplicates_across_brokers() {
        let client = seeded_client();
        client.add_broker("b1:9092", &["g1", "g2"]);
        client.add_broker("b2:9092", &["g2", "g3"]);

        let groups = find_groups(&(Arc::new(client) as Arc<dyn BrokerClient>))
            .await
            .unwrap();
        assert_eq!(groups, vec!["g1", "g2", "g3"]);
    }

    #[tokio::test]
    async fn group_filter_applies_to_discovery() {
        let client = seeded_client();
        client.add_broker("b1:9092", &["orders-app", "billing-app", "orders-audit"]);
        client.set_committed("orders-app", "orders", 0, 1);
        client.set_committed("orders-audit", "orders", 0, 1);
        client.set_committed("billing-app", "orders", 0, 1);

        let config = GroupConfig {
            filter_groups: Some(Regex::new("^orders-").unwrap()),
            topic: Some("orders".to_string()),
            fetch_offsets: true,
            ..GroupConfig::default()
        };
        let infos = inspect_groups(Arc::new(client), config).await.unwrap();
        let groups: Vec<_> = infos.iter().map(|i| i.group.as_str()).collect();
        assert_eq!(groups, vec!["orders-app", "orders-audit"]);
    }

    #[tokio::test]
    async fn reset_forward_marks_and_backward_rewinds() {
        let client = seeded_client();
        client.set_committed("g", "orders", 0, 5);

        let mut config = config_for("g", "orders");
        config.partitions = vec![0];
        config.reset = Some(ResetTarget::Absolute(8));
        inspect_groups(Arc::new(client.clone()), config.clone())
            .await
            .unwrap();
        assert_eq!(client.committed("g", "orders", 0), Some(8));

        config.reset = Some(ResetTarget::Absolute(2));
        inspect_groups(Arc::new(client.clone()), config).await.unwrap();
        assert_eq!(client.committed("g", "orders", 0), Some(2));
    }

    #[tokio::test]
    async fn reset_to_named_end_reports_partition_only() {
        let client = seeded_client();
        client.set_committed("g", "orders", 0, 5);

        let mut config = config_for("g", "orders");
        config.partitions = vec![0];
        config.reset = Some(ResetTarget::Newest);
        let infos = inspect_groups(Arc::new(client.clone()), config).await.unwrap();
        assert_eq!(client.committed("g", "orders", 0), Some(10));
        assert_eq!(
            infos[0].offsets[0],
            GroupOffset {
                partition: 0,
                partition_offset: None,
                group_offset: None,
                lag: None,
            }
        );
    }

    #[tokio::test]
    async fn reset_requires_group_and_topic() {
        let client = seeded_client();
        let config = GroupConfig {
            reset: Some(ResetTarget::Newest),
            fetch_offsets: true,
            ..GroupConfig::default()
        };
        let err = inspect_groups(Arc::new(client), config).await.unwrap_err();
        assert!(err.to_string().contains("group and topic are required"));
    }

    #[tokio::test]
    async fn fetch_offsets_false_lists_names_only() {
        let client = seeded_client();
        client.add_broker("b1:9092", &["g1", "g2"]);

        let config = GroupConfig {
            fetch_offsets: false,
            ..GroupConfig::default()
        };
        let infos = inspect_groups(Arc::new(client), config).await.unwrap();
        let groups: Vec<_> = infos.iter().map(|i| i.group.as_str()).collect();
        assert_eq!(groups, vec!["g1", "g2"]);
        assert!(infos.iter().all(|i| i.offsets.is_empty()));
    }

    #[test]
    fn reset_target_parsing() {
        assert_eq!("oldest".parse::<ResetTarget>().unwrap(), ResetTarget::Oldest);
        assert_eq!("newest".parse::<ResetTarget>().unwrap(), ResetTarget::Newest);
        assert_eq!("23".parse::<ResetTarget>().unwrap(), ResetTarget::Absolute(23));
        assert!("-5".parse::<ResetTarget>().is_err());
        assert!("bogus".parse::<ResetTarget>().is_err());
    }
}
