use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    backoff::BackoffConfig,
    connection::BrokerQueryClient,
    metadata::{Broker, BrokerState, Freshness, TopologySnapshot},
    protocol::error::ErrorCode,
    topic::Topic,
};

pub mod config;
pub mod error;
pub mod metadata_store;
pub mod refresh;
pub mod subscription;

use config::MetadataConfig;
use error::{Error, Result};
use metadata_store::MetadataStore;
use refresh::{RefreshScheduler, RefreshScope};
use subscription::SubscriptionResolver;

/// Which part of the topology a caller wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataScope {
    /// All topics in the cluster.
    All,

    Topic(String),

    Topics(Vec<String>),
}

impl TryFrom<MetadataScope> for RefreshScope {
    type Error = Error;

    fn try_from(scope: MetadataScope) -> Result<Self> {
        match scope {
            MetadataScope::All => Ok(Self::Full),
            MetadataScope::Topic(topic) => Self::topic(topic),
            MetadataScope::Topics(topics) => Self::topics(topics),
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    client: Arc<dyn BrokerQueryClient>,
    config: MetadataConfig,
}

impl ClientBuilder {
    /// Create a new [`ClientBuilder`] on top of the transport answering
    /// topology queries.
    pub fn new(client: Arc<dyn BrokerQueryClient>) -> Self {
        Self {
            client,
            config: MetadataConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: MetadataConfig) -> Self {
        self.config = config;
        self
    }

    /// Max age of cached metadata.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    /// Tick of the background maintenance.
    pub fn fast_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.fast_refresh_interval = interval;
        self
    }

    /// Deadline of a single topology query.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// How long an absent subscribed topic is held back before it is reported.
    pub fn error_grace_window(mut self, window: Duration) -> Self {
        self.config.error_grace_window = window;
        self
    }

    /// Backoff between failed refreshes.
    pub fn backoff_config(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Refresh only stale topics instead of the whole cluster.
    pub fn sparse_refresh(mut self, sparse: bool) -> Self {
        self.config.sparse_refresh = sparse;
        self
    }

    /// Build [`Client`].
    ///
    /// Must be called within a tokio runtime, which the client then uses for
    /// its refreshes. The cache starts out empty.
    pub async fn build(self) -> Result<Client> {
        self.config.validate()?;

        let store = Arc::new(MetadataStore::new());
        let scheduler = Arc::new(RefreshScheduler::new(
            self.client,
            Arc::clone(&store),
            Handle::current(),
            self.config.request_timeout,
            self.config.backoff.clone(),
        ));
        let resolver = Arc::new(SubscriptionResolver::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            self.config.error_grace_window,
        ));

        let maintenance = tokio::spawn(maintain(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&resolver),
            self.config.clone(),
        ));

        Ok(Client {
            store,
            scheduler,
            resolver,
            config: self.config,
            maintenance,
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Application-facing handle to the metadata cache.
///
/// Dropping the client stops its background maintenance.
#[derive(Debug)]
pub struct Client {
    store: Arc<MetadataStore>,
    scheduler: Arc<RefreshScheduler>,
    resolver: Arc<SubscriptionResolver>,
    config: MetadataConfig,
    maintenance: JoinHandle<()>,
}

impl Client {
    /// Returns metadata for `scope`, refreshing it unless the cache is
    /// younger than the refresh interval.
    ///
    /// If the refresh fails or `timeout` expires, the last known data is
    /// returned with [`Freshness::Stale`]. Without any data to fall back on
    /// this is an error.
    pub async fn query_metadata(
        &self,
        scope: MetadataScope,
        timeout: Duration,
    ) -> Result<TopologySnapshot> {
        let scope = RefreshScope::try_from(scope)?;

        if let Some(snapshot) = self.cached(&scope) {
            debug!(?scope, "serving metadata from cache");
            return Ok(snapshot);
        }

        let outcome = self.scheduler.request(scope.clone(), timeout).await?;
        match outcome.result {
            Ok(_) => Ok(Arc::unwrap_or_clone(outcome.snapshot)),
            Err(failure) => {
                if self.has_data_for(&scope) {
                    Ok(Arc::unwrap_or_clone(outcome.snapshot))
                } else {
                    Err(Error::MetadataUnavailable(failure))
                }
            }
        }
    }

    /// Subscribes to `topics`, replacing any previous subscription.
    ///
    /// Returns immediately; topics that are not resolved yet keep being
    /// refreshed in the background. Use [`poll_error`](Self::poll_error) to
    /// learn about topics that turned out not to exist.
    pub fn subscribe<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        self.resolver.subscribe(topics).map(|_| ())
    }

    pub fn unsubscribe(&self) {
        self.resolver.unsubscribe();
    }

    /// Currently subscribed topics, ordered by name.
    pub fn subscription(&self) -> Vec<String> {
        self.resolver.subscription().into_iter().collect()
    }

    /// Returns the error of a subscribed topic once it has been absent for
    /// longer than the grace window, `None` otherwise.
    pub fn poll_error(&self, topic: &str) -> Option<ErrorCode> {
        self.resolver.poll_error(topic)
    }

    /// Returns a list of topics in the cluster
    pub async fn list_topics(&self, timeout: Duration) -> Result<Vec<Topic>> {
        let snapshot = self.query_metadata(MetadataScope::All, timeout).await?;

        Ok(snapshot
            .topics
            .into_iter()
            .filter(|t| t.is_present() && !t.is_internal)
            .map(|t| Topic {
                name: t.name,
                partitions: t.partitions.iter().map(|p| p.id).collect(),
            })
            .collect())
    }

    /// Everything cached right now, without touching the network.
    pub fn cached_snapshot(&self) -> TopologySnapshot {
        self.store.snapshot(None)
    }

    /// Cached leader of a partition.
    pub fn partition_leader(&self, topic: &str, partition: i32) -> Option<Broker> {
        self.store.partition_leader(topic, partition)
    }

    /// Records the connection state of a broker.
    ///
    /// Returns `false` if the broker is not known.
    pub fn set_broker_state(&self, id: i32, state: BrokerState) -> bool {
        self.store.set_broker_state(id, state)
    }

    /// Drops all cached metadata.
    ///
    /// Refreshes already in flight still merge their results.
    pub fn reset(&self) {
        info!("resetting metadata cache");
        self.store.clear();
    }

    fn cached(&self, scope: &RefreshScope) -> Option<TopologySnapshot> {
        let now = Instant::now();
        let max_age = self.config.refresh_interval;

        let fresh = match scope.topic_names() {
            None => self
                .store
                .last_full_refresh()
                .is_some_and(|at| now.saturating_duration_since(at) < max_age),
            Some(topics) => topics.iter().all(|topic| {
                let entry = self.store.ensure(topic);
                entry.is_present() && !entry.is_stale(now, max_age)
            }),
        };

        fresh.then(|| {
            self.store
                .snapshot(scope.topic_names())
                .with_freshness(Freshness::Cached)
        })
    }

    fn has_data_for(&self, scope: &RefreshScope) -> bool {
        match scope.topic_names() {
            None => self.store.has_data(),
            Some(topics) => topics
                .iter()
                .filter_map(|t| self.store.get(t))
                .any(|t| t.fetched_at.is_some()),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

/// Background upkeep: resolves the subscription, refreshes stale metadata and
/// retries failed refreshes.
async fn maintain(
    store: Arc<MetadataStore>,
    scheduler: Arc<RefreshScheduler>,
    resolver: Arc<SubscriptionResolver>,
    config: MetadataConfig,
) {
    let mut interval = tokio::time::interval(config.fast_refresh_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        resolver.resolve_subscription();

        let now = Instant::now();
        if config.sparse_refresh {
            let stale = store.stale_topics(now, config.refresh_interval);
            if !stale.is_empty() {
                debug!(topics = stale.len(), "refreshing stale topics");
                scheduler.submit(RefreshScope::Topics(stale.into_iter().collect())).ok();
            }
        } else if store.has_data()
            && store
                .last_full_refresh()
                .is_none_or(|at| now.saturating_duration_since(at) >= config.refresh_interval)
        {
            debug!("refreshing full topology");
            scheduler.submit(RefreshScope::Full).ok();
        }

        scheduler.retry_due();
    }
}
