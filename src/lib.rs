//! Kafka offset-range consumer and consumer-group inspector.
//!
//! The offset spec grammar lives in [`offset`], the consumption engine in
//! [`consume`], group inspection in [`group`]. Broker access is behind
//! the [`client::BrokerClient`] trait; [`testing`] has an in-memory
//! implementation.

pub mod client;
pub mod codec;
pub mod consume;
pub mod group;
pub mod offset;
pub mod sink;
pub mod testing;

pub use client::{BrokerClient, KafkaClient, Record};
pub use consume::{ConsumeSummary, ConsumerConfig, PartitionOutcome, start_consume};
pub use group::{GroupConfig, GroupInfo, inspect_groups};
pub use offset::{OffsetInterval, OffsetSpec, parse_offsets};
