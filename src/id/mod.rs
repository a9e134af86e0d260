//! Time-sortable 64-bit identifiers.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! | 1 bit  | 41 bits                 | 10 bits | 12 bits |
//! | unused | ms since SPILLWAY_EPOCH | node    | counter |
//! ```
//!
//! The unused top bit keeps every identifier a positive `i64`, which is what
//! SQLite stores in an `INTEGER PRIMARY KEY`.

pub mod allocator;
pub mod clock;

pub use allocator::{AllocError, AllocatorConfig, ClockRollbackPolicy, IdAllocator};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Custom epoch: Wednesday, January 1, 2025 00:00:00 UTC (Unix ms).
pub const SPILLWAY_EPOCH: u64 = 1_735_689_600_000;

pub const TIMESTAMP_BITS: u32 = 41;
pub const NODE_BITS: u32 = 10;
pub const COUNTER_BITS: u32 = 12;

const NODE_SHIFT: u32 = COUNTER_BITS;
const TIMESTAMP_SHIFT: u32 = COUNTER_BITS + NODE_BITS;

pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;
pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
pub const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;

/// A 64-bit identifier, assigned before persistence and never regenerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(u64);

impl Identifier {
    /// Assemble an identifier from an epoch-relative timestamp, node and counter.
    ///
    /// Components wider than their field are masked.
    pub const fn from_parts(timestamp: u64, node: NodeId, counter: u64) -> Self {
        Self(
            ((timestamp & MAX_TIMESTAMP) << TIMESTAMP_SHIFT)
                | ((node.0 as u64) << NODE_SHIFT)
                | (counter & MAX_COUNTER),
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The identifier as stored in an SQLite `INTEGER` column.
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    /// Milliseconds since [`SPILLWAY_EPOCH`].
    pub const fn timestamp(self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) & MAX_TIMESTAMP
    }

    /// Unix milliseconds at which this identifier was allocated.
    pub const fn unix_millis(self) -> u64 {
        self.timestamp() + SPILLWAY_EPOCH
    }

    pub const fn node(self) -> NodeId {
        NodeId(((self.0 >> NODE_SHIFT) as u16) & MAX_NODE)
    }

    pub const fn counter(self) -> u64 {
        self.0 & MAX_COUNTER
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identifier {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Node tag folded into every identifier an allocator issues.
///
/// Allocators with distinct node tags can never collide. Allocators that pick
/// [`NodeId::random`] should also set
/// [`AllocatorConfig::random_counter_start`]; they then collide only if they
/// share a tag, a millisecond and a counter start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct NodeId(u16);

impl NodeId {
    pub fn new(node: u16) -> Result<Self, AllocError> {
        if node > MAX_NODE {
            return Err(AllocError::InvalidNode(node));
        }
        Ok(Self(node))
    }

    /// Pick a node tag at random.
    pub fn random() -> Self {
        Self(rand::random_range(0..=MAX_NODE))
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for NodeId {
    type Error = AllocError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u16 {
    fn from(node: NodeId) -> Self {
        node.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_round_trip() {
        let node = NodeId::new(513).unwrap();
        let id = Identifier::from_parts(123_456_789, node, 4095);

        assert_eq!(id.timestamp(), 123_456_789);
        assert_eq!(id.node(), node);
        assert_eq!(id.counter(), 4095);
        assert_eq!(id.unix_millis(), SPILLWAY_EPOCH + 123_456_789);
    }

    #[test]
    fn test_max_identifier_is_positive_i64() {
        let id = Identifier::from_parts(MAX_TIMESTAMP, NodeId::new(MAX_NODE).unwrap(), MAX_COUNTER);
        assert!(id.as_i64() > 0);
        assert_eq!(Identifier::from_i64(id.as_i64()), id);
    }

    #[test]
    fn test_ordering_follows_timestamp_first() {
        let high_node = NodeId::new(MAX_NODE).unwrap();
        let earlier = Identifier::from_parts(10, high_node, MAX_COUNTER);
        let later = Identifier::from_parts(11, NodeId::default(), 0);
        assert!(earlier < later);
    }

    #[test]
    fn test_node_id_rejects_out_of_range() {
        assert!(NodeId::new(1023).is_ok());
        assert!(matches!(NodeId::new(1024), Err(AllocError::InvalidNode(1024))));
    }

    #[test]
    fn test_parse_and_display() {
        let id: Identifier = "987654321".parse().unwrap();
        assert_eq!(id.raw(), 987_654_321);
        assert_eq!(id.to_string(), "987654321");
    }

    #[test]
    fn test_serde_as_integer() {
        let id = Identifier::from_raw(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let node: NodeId = serde_json::from_str("7").unwrap();
        assert_eq!(node.get(), 7);
        assert!(serde_json::from_str::<NodeId>("4000").is_err());
    }
}
