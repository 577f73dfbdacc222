//! Interface to the transport that talks to the cluster.
//!
//! Connection management and the metadata wire codec live outside this crate;
//! the cache only needs something that can answer a topology query.
use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    client::refresh::RefreshScope,
    metadata::{Broker, Partition},
    protocol::error::ErrorCode,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("no broker reachable: {0}")]
    Unreachable(String),

    #[error("connection to broker {broker} failed: {source}")]
    Connection {
        broker: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read/write data")]
    IO(#[from] std::io::Error),

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

/// Result for a single topic within a [`TopologyResponse`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopicResult {
    /// Topic-level error, `None` if the broker reported no error
    pub error: Option<ErrorCode>,

    /// True if the topic is internal
    pub is_internal: bool,

    /// Each partition in the topic
    pub partitions: Vec<Partition>,
}

impl TopicResult {
    /// A topic with the given partitions and no error.
    pub fn present(partitions: Vec<Partition>) -> Self {
        Self {
            error: None,
            is_internal: false,
            partitions,
        }
    }

    /// A topic the broker reported as failed, without partition data.
    pub fn error(error: ErrorCode) -> Self {
        Self {
            error: Some(error),
            is_internal: false,
            partitions: vec![],
        }
    }
}

/// Decoded answer to a topology query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologyResponse {
    /// Brokers in the cluster
    ///
    /// Authoritative for full queries, additive for partial ones.
    pub brokers: Option<Vec<Broker>>,

    pub topics: HashMap<String, TopicResult>,

    /// Throttle time requested by the broker
    pub throttle_time: Option<Duration>,
}

/// Issues topology queries against the cluster.
///
/// Implementations should give up once `deadline` passes; the scheduler stops
/// waiting at that point regardless.
pub trait BrokerQueryClient: Debug + Send + Sync + 'static {
    fn send_topology_query<'a>(
        &'a self,
        scope: &'a RefreshScope,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<TopologyResponse, TransportError>>;
}

impl<T> BrokerQueryClient for Arc<T>
where
    T: BrokerQueryClient + ?Sized,
{
    fn send_topology_query<'a>(
        &'a self,
        scope: &'a RefreshScope,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<TopologyResponse, TransportError>> {
        (**self).send_topology_query(scope, deadline)
    }
}
