//! Resolution of subscribed topics.
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    client::{
        error::{Error, Result, validate_topic_name},
        metadata_store::MetadataStore,
        refresh::{RefreshScheduler, RefreshScope},
    },
    metadata::TopicState,
    protocol::error::ErrorCode,
};

/// Where the topics of one resolution pass stand.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Topics with partition data.
    pub present: Vec<String>,

    /// Topics still being looked up, including negatives within the grace
    /// window.
    pub pending: Vec<String>,

    /// Topics confirmed absent for longer than the grace window.
    pub failed: Vec<(String, ErrorCode)>,

    /// Token of the targeted refresh issued for `pending`, if any.
    pub refresh: Option<u64>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Maps the application's topic subscription onto cache entries and keeps
/// unresolved ones refreshing.
///
/// A negative result for a subscribed topic is reported only once the topic
/// has stayed in the error state for the grace window, so a topic that is
/// being created or briefly missing from a broker's view does not surface as
/// unknown.
#[derive(Debug)]
pub struct SubscriptionResolver {
    store: Arc<MetadataStore>,
    scheduler: Arc<RefreshScheduler>,
    grace_window: Duration,
    subscription: RwLock<BTreeSet<String>>,

    /// Topics whose error was already logged.
    surfaced: Mutex<HashSet<String>>,
}

impl SubscriptionResolver {
    pub fn new(
        store: Arc<MetadataStore>,
        scheduler: Arc<RefreshScheduler>,
        grace_window: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            grace_window,
            subscription: Default::default(),
            surfaced: Default::default(),
        }
    }

    /// Replaces the subscription and starts resolving it.
    pub fn subscribe(&self, topics: BTreeSet<String>) -> Result<Resolution> {
        if topics.is_empty() {
            return Err(Error::EmptySubscription);
        }
        for topic in &topics {
            validate_topic_name(topic)?;
        }

        {
            let mut subscription = self.subscription.write();
            if *subscription == topics {
                debug!(?topics, "subscription unchanged");
            } else {
                info!(?topics, "subscription changed");
                self.surfaced.lock().retain(|t| topics.contains(t));
                *subscription = topics.clone();
            }
        }

        Ok(self.resolve(topics.iter().map(String::as_str)))
    }

    pub fn unsubscribe(&self) {
        let previous = std::mem::take(&mut *self.subscription.write());
        self.surfaced.lock().clear();
        if !previous.is_empty() {
            info!(topics = ?previous, "unsubscribed");
        }
    }

    pub fn subscription(&self) -> BTreeSet<String> {
        self.subscription.read().clone()
    }

    /// Resolves the current subscription, see [`resolve`](Self::resolve).
    pub fn resolve_subscription(&self) -> Resolution {
        let topics = self.subscription();
        self.resolve(topics.iter().map(String::as_str))
    }

    /// Classifies `topics` by their cache state and issues one targeted
    /// refresh for those not yet resolved.
    pub fn resolve<'a, I>(&self, topics: I) -> Resolution
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        let mut resolution = Resolution::default();

        for topic in topics {
            let entry = self.store.ensure(topic);
            match entry.state {
                TopicState::Present => {
                    if self.surfaced.lock().remove(topic) {
                        info!(topic, "subscribed topic resolved");
                    }
                    resolution.present.push(topic.to_owned());
                }
                TopicState::Unknown => resolution.pending.push(topic.to_owned()),
                TopicState::Error { error, since } => {
                    if now.saturating_duration_since(since) < self.grace_window {
                        debug!(topic, %error, "suppressing topic error within grace window");
                        resolution.pending.push(topic.to_owned());
                    } else {
                        if self.surfaced.lock().insert(topic.to_owned()) {
                            warn!(topic, %error, "subscribed topic unavailable");
                        }
                        resolution.failed.push((topic.to_owned(), error));
                    }
                }
            }
        }

        if !resolution.pending.is_empty() {
            match RefreshScope::topics(resolution.pending.iter().cloned())
                .and_then(|scope| self.scheduler.submit(scope))
            {
                Ok(token) => resolution.refresh = Some(token),
                Err(e) => warn!(%e, "cannot refresh unresolved topics"),
            }
        }

        resolution
    }

    /// Returns the error of a subscribed topic that stayed absent for longer
    /// than the grace window.
    pub fn poll_error(&self, topic: &str) -> Option<ErrorCode> {
        if !self.subscription.read().contains(topic) {
            return None;
        }

        match self.store.get(topic)?.state {
            TopicState::Error { error, since }
                if Instant::now().saturating_duration_since(since) >= self.grace_window =>
            {
                Some(error)
            }
            _ => None,
        }
    }
}
