//! Checkpoint values and the positions derived from them.

use std::cmp::Ordering;
use std::fmt;

const TRIM_HORIZON: &str = "TRIM_HORIZON";
const AFTER_SEQUENCE_NUMBER: &str = "AFTER_SEQUENCE_NUMBER";
const SHARD_END: &str = "SHARD_END";

/// A persisted position within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Start of the shard.
    TrimHorizon,
    /// Last record the application finished with.
    SequenceNumber(String),
    /// Every record of a closed shard has been processed.
    ShardEnd,
}

impl Checkpoint {
    /// Parses the stored representation.
    pub fn parse(value: &str) -> Self {
        match value {
            TRIM_HORIZON => Self::TrimHorizon,
            SHARD_END => Self::ShardEnd,
            sequence_number => Self::SequenceNumber(sequence_number.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TrimHorizon => TRIM_HORIZON,
            Self::SequenceNumber(sequence_number) => sequence_number,
            Self::ShardEnd => SHARD_END,
        }
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, Self::ShardEnd)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a new shard iterator starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingPosition {
    TrimHorizon,
    AfterSequenceNumber(String),
}

impl StartingPosition {
    /// Position for resuming after `checkpoint`, or `None` once the shard
    /// has been fully consumed.
    pub fn from_checkpoint(checkpoint: Option<&Checkpoint>) -> Option<Self> {
        match checkpoint {
            None | Some(Checkpoint::TrimHorizon) => Some(Self::TrimHorizon),
            Some(Checkpoint::SequenceNumber(sequence_number)) => {
                Some(Self::AfterSequenceNumber(sequence_number.clone()))
            }
            Some(Checkpoint::ShardEnd) => None,
        }
    }

    /// Kinesis `ShardIteratorType` for this position.
    pub fn iterator_type(&self) -> &'static str {
        match self {
            Self::TrimHorizon => TRIM_HORIZON,
            Self::AfterSequenceNumber(_) => AFTER_SEQUENCE_NUMBER,
        }
    }

    pub fn sequence_number(&self) -> Option<&str> {
        match self {
            Self::TrimHorizon => None,
            Self::AfterSequenceNumber(sequence_number) => Some(sequence_number),
        }
    }
}

/// Totally ordered view of a shard's checkpoint.
///
/// A shard that was never checkpointed sorts first, then the trim horizon,
/// then sequence numbers by numeric value, then the shard end. Equality
/// follows the same order, so `"0042"` equals `"42"`.
#[derive(Debug, Clone, Default)]
pub struct ExtendedSequenceNumber(Option<Checkpoint>);

impl ExtendedSequenceNumber {
    pub fn new(checkpoint: Option<Checkpoint>) -> Self {
        Self(checkpoint)
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.0.as_ref()
    }

    fn rank(&self) -> u8 {
        match &self.0 {
            None => 0,
            Some(Checkpoint::TrimHorizon) => 1,
            Some(Checkpoint::SequenceNumber(_)) => 2,
            Some(Checkpoint::ShardEnd) => 3,
        }
    }
}

impl From<Option<Checkpoint>> for ExtendedSequenceNumber {
    fn from(checkpoint: Option<Checkpoint>) -> Self {
        Self(checkpoint)
    }
}

impl Ord for ExtendedSequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (Some(Checkpoint::SequenceNumber(a)), Some(Checkpoint::SequenceNumber(b))) => {
                compare_sequence_numbers(a, b)
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialEq for ExtendedSequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExtendedSequenceNumber {}

impl PartialOrd for ExtendedSequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExtendedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(checkpoint) => checkpoint.fmt(f),
            None => f.write_str("<none>"),
        }
    }
}

/// Kinesis sequence numbers are decimal strings wider than any integer type.
fn compare_sequence_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');

    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
