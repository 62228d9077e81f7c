//! Partition/offset range specification language.
//!
//! A spec is a comma separated list of per-partition intervals, e.g.
//! `0=4:,2=1:10,6` or `all=newest-10:`. Parsing is pure; symbolic
//! offsets are resolved against broker state at consumption time.

use std::collections::HashMap;
use std::fmt;
use std::num::IntErrorKind;

use thiserror::Error;

/// Reserved partition key meaning "every partition not listed explicitly".
pub const ALL_PARTITIONS: i32 = -1;

/// Errors produced while parsing an offset spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OffsetParseError {
    #[error("invalid partition number {0:?}")]
    InvalidPartition(String),
    #[error("partition number {0:?} is too large")]
    PartitionTooLarge(String),
    #[error("invalid offset {0:?}")]
    InvalidOffset(String),
    #[error("offset {0:?} is too large")]
    OffsetTooLarge(String),
}

/// A symbolic position in a partition's log.
///
/// Relative variants carry a signed delta applied after the base is
/// resolved against the broker (or the consumer group for `Resume`).
/// An absolute offset carries no delta by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Absolute(i64),
    Oldest { diff: i64 },
    Newest { diff: i64 },
    Resume { diff: i64 },
}

impl OffsetSpec {
    pub const OLDEST: OffsetSpec = OffsetSpec::Oldest { diff: 0 };
    pub const NEWEST: OffsetSpec = OffsetSpec::Newest { diff: 0 };
    pub const RESUME: OffsetSpec = OffsetSpec::Resume { diff: 0 };
    /// "Consume to the end of time" upper bound.
    pub const MAX: OffsetSpec = OffsetSpec::Absolute(i64::MAX);

    /// True if resolving this offset needs broker or group state.
    pub fn is_relative(&self) -> bool {
        !matches!(self, OffsetSpec::Absolute(_))
    }

    fn with_diff(self, diff: i64) -> Self {
        match self {
            OffsetSpec::Absolute(n) => OffsetSpec::Absolute(n),
            OffsetSpec::Oldest { .. } => OffsetSpec::Oldest { diff },
            OffsetSpec::Newest { .. } => OffsetSpec::Newest { diff },
            OffsetSpec::Resume { .. } => OffsetSpec::Resume { diff },
        }
    }
}

impl fmt::Display for OffsetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, diff) = match self {
            OffsetSpec::Absolute(n) => return write!(f, "{n}"),
            OffsetSpec::Oldest { diff } => ("oldest", *diff),
            OffsetSpec::Newest { diff } => ("newest", *diff),
            OffsetSpec::Resume { diff } => ("resume", *diff),
        };
        if diff != 0 {
            write!(f, "{name}{diff:+}")
        } else {
            write!(f, "{name}")
        }
    }
}

/// An inclusive consumption range for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetInterval {
    pub start: OffsetSpec,
    pub end: OffsetSpec,
}

impl OffsetInterval {
    /// Everything the partition currently holds and ever will.
    pub fn unbounded() -> Self {
        OffsetInterval {
            start: OffsetSpec::OLDEST,
            end: OffsetSpec::MAX,
        }
    }
}

impl fmt::Display for OffsetInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Parses a set of partition/offset specifiers in the following syntax:
///
/// ```text
/// offsets           := [ partitionInterval { "," partitionInterval } ]
/// partitionInterval := partition "=" interval | partition | interval
/// partition         := "all" | number
/// interval          := [ offset ] [ ":" [ offset ] ]
/// offset            := number | namedRelative | numericRelative |
///                      namedRelative numericRelative
/// namedRelative     := "newest" | "oldest" | "resume"
/// numericRelative   := "+" number | "-" number
/// ```
///
/// A missing start defaults to `oldest`, a missing end to `i64::MAX`.
/// `+N` alone means `oldest+N`, `-N` alone means `newest-N`. Later
/// entries for the same partition override earlier ones.
pub fn parse_offsets(spec: &str) -> Result<HashMap<i32, OffsetInterval>, OffsetParseError> {
    let mut result = HashMap::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        // A bare decimal is ambiguous between a partition number and a
        // single-offset interval. Try the partition reading first; only
        // when that fails does the token get treated as an interval.
        if let Ok(p) = parse_partition(entry) {
            result.insert(p, OffsetInterval::unbounded());
            continue;
        }
        let (partition, interval_str) = match entry.find('=') {
            Some(i) => (parse_partition(&entry[..i])?, &entry[i + 1..]),
            None => (ALL_PARTITIONS, entry),
        };
        result.insert(partition, parse_interval(interval_str)?);
    }
    Ok(result)
}

/// Parses a partition number, or the word "all" meaning every partition.
fn parse_partition(s: &str) -> Result<i32, OffsetParseError> {
    if s == "all" {
        return Ok(ALL_PARTITIONS);
    }
    match s.parse::<u32>() {
        Ok(p) if p <= i32::MAX as u32 => Ok(p as i32),
        Ok(_) => Err(OffsetParseError::PartitionTooLarge(s.to_string())),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => {
            Err(OffsetParseError::PartitionTooLarge(s.to_string()))
        }
        Err(_) => Err(OffsetParseError::InvalidPartition(s.to_string())),
    }
}

fn parse_interval(s: &str) -> Result<OffsetInterval, OffsetParseError> {
    if s.is_empty() {
        return Ok(OffsetInterval::unbounded());
    }
    // Only the first colon separates start from end.
    let (start, end) = match s.find(':') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    };
    Ok(OffsetInterval {
        start: parse_interval_part(start, OffsetSpec::OLDEST)?,
        end: parse_interval_part(end, OffsetSpec::MAX)?,
    })
}

/// Parses one half of an interval pair, using `default` when empty.
fn parse_interval_part(s: &str, default: OffsetSpec) -> Result<OffsetSpec, OffsetParseError> {
    if s.is_empty() {
        return Ok(default);
    }
    // Absolute offsets must fit 63 unsigned bits.
    match s.parse::<u64>() {
        Ok(n) if n <= i64::MAX as u64 => return Ok(OffsetSpec::Absolute(n as i64)),
        Ok(_) => return Err(OffsetParseError::OffsetTooLarge(s.to_string())),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => {
            return Err(OffsetParseError::OffsetTooLarge(s.to_string()));
        }
        Err(_) => {}
    }
    parse_relative_offset(s)
}

/// Parses a relative offset such as "oldest", "newest-30", or "+20".
fn parse_relative_offset(s: &str) -> Result<OffsetSpec, OffsetParseError> {
    if let Some(o) = parse_named_offset(s) {
        return Ok(o);
    }
    let i = s
        .find(['+', '-'])
        .ok_or_else(|| OffsetParseError::InvalidOffset(s.to_string()))?;
    let base = if i > 0 {
        // The sign isn't at the start, so a named offset must precede it.
        parse_named_offset(&s[..i])
            .ok_or_else(|| OffsetParseError::InvalidOffset(s.to_string()))?
    } else if s.as_bytes()[i] == b'+' {
        OffsetSpec::OLDEST
    } else {
        OffsetSpec::NEWEST
    };
    // The leading sign is kept so the diff carries the right direction.
    let diff = s[i..].parse::<i64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            OffsetParseError::OffsetTooLarge(s.to_string())
        }
        _ => OffsetParseError::InvalidOffset(s.to_string()),
    })?;
    Ok(base.with_diff(diff))
}

fn parse_named_offset(s: &str) -> Option<OffsetSpec> {
    match s {
        "oldest" => Some(OffsetSpec::OLDEST),
        "newest" => Some(OffsetSpec::NEWEST),
        "resume" => Some(OffsetSpec::RESUME),
        _ => None,
    }
}
