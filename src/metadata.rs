//! Cluster-wide Kafka metadata.
use std::{fmt::Display, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{client::refresh::RefreshFailure, protocol::error::ErrorCode};

/// Sentinel leader id of a partition without a leader.
pub const NO_LEADER: i32 = -1;

/// Connection state of a broker, as last reported by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    /// No connection attempt has been reported yet.
    #[default]
    Unknown,
    Up,
    Down,
}

/// Metadata for a certain broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    /// The broker ID
    pub id: i32,

    /// The broker hostname
    pub host: String,

    /// The broker port
    pub port: i32,

    /// Rack.
    pub rack: Option<String>,

    /// Connection state, owned by the connection manager.
    pub state: BrokerState,
}

impl Broker {
    pub fn new(id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            rack: None,
            state: BrokerState::Unknown,
        }
    }
}

impl Display for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Metadata for a certain partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// The partition index
    pub id: i32,

    /// The ID of the leader broker, [`NO_LEADER`] if there is none
    pub leader: i32,

    /// The set of all nodes that host this partition
    pub replicas: Vec<i32>,

    /// The set of all nodes that are in sync with the leader for this partition
    pub isr: Vec<i32>,

    /// Partition-level error reported by the broker
    pub error: Option<ErrorCode>,
}

impl Partition {
    pub fn new(id: i32, leader: i32, replicas: Vec<i32>) -> Self {
        Self {
            id,
            leader,
            isr: replicas.clone(),
            replicas,
            error: None,
        }
    }

    pub fn has_leader(&self) -> bool {
        self.leader != NO_LEADER
    }
}

/// Resolution state of a cached topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    /// Never successfully queried.
    Unknown,

    /// The last accepted refresh returned partition data.
    Present,

    /// A refresh confirmed the topic is absent.
    ///
    /// `since` is the time of the transition into this state; later negatives
    /// keep the original timestamp.
    Error { error: ErrorCode, since: Instant },
}

/// Metadata for a certain topic.
///
/// Entries are immutable; a refresh replaces the whole entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMetadata {
    /// The topic name
    pub name: String,

    pub state: TopicState,

    /// Topic-level error reported alongside partition data, e.g. a leader
    /// election in progress
    pub error: Option<ErrorCode>,

    /// True if the topic is internal
    pub is_internal: bool,

    /// Each partition in the topic, ordered by index
    pub partitions: Arc<Vec<Partition>>,

    /// Generation of the refresh this entry was taken from, `0` for lazily
    /// created entries
    pub generation: u64,

    /// When the entry was last written by a refresh
    pub fetched_at: Option<Instant>,
}

impl TopicMetadata {
    pub(crate) fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TopicState::Unknown,
            error: None,
            is_internal: false,
            partitions: Default::default(),
            generation: 0,
            fetched_at: None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, TopicState::Present)
    }

    /// Returns the partition with index `partition`.
    pub fn partition(&self, partition: i32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == partition)
    }

    /// Returns `true` if the entry was never fetched or is older than `max_age`.
    pub fn is_stale(&self, now: Instant, max_age: std::time::Duration) -> bool {
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) >= max_age,
            None => true,
        }
    }
}

/// How a [`TopologySnapshot`] came to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    /// Produced by a refresh that completed for this query.
    Refreshed,

    /// Served from cache without a network round-trip, the cache being
    /// younger than the configured max age.
    Cached,

    /// The refresh did not succeed; the last known data is returned together
    /// with the reason.
    Stale(RefreshFailure),
}

/// Point-in-time copy of (a part of) the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    /// Brokers, ordered by ID.
    pub brokers: Vec<Broker>,

    /// Topics, ordered by name.
    pub topics: Vec<TopicMetadata>,

    pub freshness: Freshness,

    pub taken_at: DateTime<Utc>,
}

impl TopologySnapshot {
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn broker(&self, id: i32) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.id == id)
    }

    pub(crate) fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    /// Restricts the snapshot to the given topics.
    pub(crate) fn filtered<'a, I>(&self, topics: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let want: Vec<&str> = topics.into_iter().collect();
        Self {
            brokers: self.brokers.clone(),
            topics: self
                .topics
                .iter()
                .filter(|t| want.contains(&t.name.as_str()))
                .cloned()
                .collect(),
            freshness: self.freshness.clone(),
            taken_at: self.taken_at,
        }
    }
}
