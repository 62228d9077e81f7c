//! Where consumed records go.
//!
//! The consumption engine pushes every record through exactly one sink,
//! one record at a time.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::client::Record;
use crate::codec::Encoding;

/// What the engine should do after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkVerdict {
    Continue,
    /// Stop the whole session cooperatively.
    Stop,
}

pub trait RecordSink: Send {
    fn deliver(&mut self, record: &Record) -> Result<SinkVerdict>;
}

#[derive(Serialize)]
struct PrintedRecord<'a> {
    seq: u64,
    topic: &'a str,
    partition: i32,
    offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    value: String,
    value_size: usize,
}

/// Prints one JSON line per record to stdout.
pub struct PrintSink {
    key_encoding: Encoding,
    value_encoding: Encoding,
    /// Only records whose value matches are printed.
    grep: Option<Regex>,
    /// Stop after this many printed records.
    max: Option<u64>,
    seq: u64,
}

impl PrintSink {
    pub fn new(
        key_encoding: Encoding,
        value_encoding: Encoding,
        grep: Option<Regex>,
        max: Option<u64>,
    ) -> Self {
        Self {
            key_encoding,
            value_encoding,
            grep,
            max,
            seq: 0,
        }
    }

    fn render(&self, seq: u64, record: &Record) -> Result<String> {
        let printed = PrintedRecord {
            seq,
            topic: &record.topic,
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp.map(|t| t.to_rfc3339()),
            key: if record.key.is_empty() {
                None
            } else {
                Some(self.key_encoding.encode(&record.key))
            },
            value: self.value_encoding.encode(&record.value),
            value_size: record.value.len(),
        };
        Ok(serde_json::to_string(&printed)?)
    }
}

impl RecordSink for PrintSink {
    fn deliver(&mut self, record: &Record) -> Result<SinkVerdict> {
        if let Some(grep) = &self.grep {
            if !grep.is_match(&String::from_utf8_lossy(&record.value)) {
                return Ok(SinkVerdict::Continue);
            }
        }
        self.seq += 1;
        println!("{}", self.render(self.seq, record)?);
        match self.max {
            Some(max) if self.seq >= max => Ok(SinkVerdict::Stop),
            _ => Ok(SinkVerdict::Continue),
        }
    }
}

/// Collects records in memory. Test support.
pub struct CollectSink {
    records: Arc<Mutex<Vec<Record>>>,
    stop_after: Option<usize>,
}

impl CollectSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<Record>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                records: records.clone(),
                stop_after: None,
            },
            records,
        )
    }

    pub fn stopping_after(n: usize) -> (Self, Arc<Mutex<Vec<Record>>>) {
        let (mut sink, records) = Self::new();
        sink.stop_after = Some(n);
        (sink, records)
    }
}

impl RecordSink for CollectSink {
    fn deliver(&mut self, record: &Record) -> Result<SinkVerdict> {
        let mut records = self.records.lock().unwrap();
        records.push(record.clone());
        match self.stop_after {
            Some(n) if records.len() >= n => Ok(SinkVerdict::Stop),
            _ => Ok(SinkVerdict::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(value: &str) -> Record {
        Record {
            topic: "t".to_string(),
            partition: 0,
            offset: 0,
            key: Bytes::new(),
            value: Bytes::copy_from_slice(value.as_bytes()),
            timestamp: None,
        }
    }

    #[test]
    fn grep_skips_non_matching_values() {
        let mut sink = PrintSink::new(
            Encoding::String,
            Encoding::String,
            Some(Regex::new("keep").unwrap()),
            None,
        );
        assert_eq!(sink.deliver(&record("drop me")).unwrap(), SinkVerdict::Continue);
        assert_eq!(sink.seq, 0);
        assert_eq!(sink.deliver(&record("keep me")).unwrap(), SinkVerdict::Continue);
        assert_eq!(sink.seq, 1);
    }

    #[test]
    fn max_stops_after_nth_printed_record() {
        let mut sink = PrintSink::new(Encoding::String, Encoding::String, None, Some(2));
        assert_eq!(sink.deliver(&record("a")).unwrap(), SinkVerdict::Continue);
        assert_eq!(sink.deliver(&record("b")).unwrap(), SinkVerdict::Stop);
    }

    #[test]
    fn rendered_record_is_json_with_expected_fields() {
        let sink = PrintSink::new(Encoding::String, Encoding::Hex, None, None);
        let line = sink.render(1, &record("hi")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["seq"], 1);
        assert_eq!(parsed["topic"], "t");
        assert_eq!(parsed["value"], "6869");
        assert_eq!(parsed["value_size"], 2);
        assert!(parsed.get("key").is_none());
    }
}
