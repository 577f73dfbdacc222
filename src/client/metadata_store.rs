use std::{
    collections::{BTreeSet, HashMap, HashSet, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    client::refresh::RefreshScope,
    connection::TopicResult,
    metadata::{Broker, BrokerState, Freshness, TopicMetadata, TopicState, TopologySnapshot},
    protocol::error::ErrorCode,
};

/// Counters describing what a [`MetadataStore::merge`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Topics now holding partition data from this merge.
    pub present: usize,

    /// Topics moved into (or kept in) the error state.
    pub negative: usize,

    /// Topics left alone because the store already held a newer generation.
    pub superseded: usize,

    /// Topics left alone because the result was transient, or because another
    /// pending refresh may still resolve them.
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct BrokerEntry {
    broker: Broker,
    generation: u64,
}

/// The authoritative cache of brokers, topics and partitions.
///
/// Reads never wait on the network. Every mutation goes through
/// [`merge`](Self::merge), which swaps whole topic entries one at a time, so
/// a reader observes either the old or the new partition list of a topic,
/// never a mix.
#[derive(Debug, Default)]
pub struct MetadataStore {
    brokers: RwLock<HashMap<i32, BrokerEntry>>,
    topics: RwLock<HashMap<String, Arc<TopicMetadata>>>,

    /// Generation and completion time of the newest merged full refresh.
    last_full_refresh: Mutex<Option<(u64, Instant)>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest merged entry for `topic`, `None` if the store never heard of it.
    pub fn get(&self, topic: &str) -> Option<Arc<TopicMetadata>> {
        self.topics.read().get(topic).map(Arc::clone)
    }

    /// Returns the entry for `topic`, creating an unknown one if needed.
    pub fn ensure(&self, topic: &str) -> Arc<TopicMetadata> {
        if let Some(entry) = self.get(topic) {
            return entry;
        }

        let mut topics = self.topics.write();
        Arc::clone(
            topics
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(TopicMetadata::unknown(topic))),
        )
    }

    /// Merges the result of a refresh with the given `generation`.
    pub fn merge(
        &self,
        scope: &RefreshScope,
        generation: u64,
        brokers: Option<Vec<Broker>>,
        topics: HashMap<String, TopicResult>,
    ) -> MergeSummary {
        self.merge_guarded(scope, generation, brokers, topics, &|_| false)
    }

    /// Like [`merge`](Self::merge), but negatives for topics where
    /// `still_resolving` returns `true` are not applied.
    pub(crate) fn merge_guarded(
        &self,
        scope: &RefreshScope,
        generation: u64,
        brokers: Option<Vec<Broker>>,
        topics: HashMap<String, TopicResult>,
        still_resolving: &dyn Fn(&str) -> bool,
    ) -> MergeSummary {
        let now = Instant::now();
        let mut summary = MergeSummary::default();

        if let Some(brokers) = brokers {
            self.merge_brokers(scope.is_full(), generation, brokers);
        }

        let listed: HashSet<String> = if scope.is_full() {
            topics.keys().cloned().collect()
        } else {
            HashSet::new()
        };

        for (name, result) in topics {
            match result.error {
                Some(error) if error.is_definitive_absence() => {
                    if still_resolving(&name) {
                        debug!(topic = name.as_str(), generation, "deferring negative result");
                        summary.deferred += 1;
                        continue;
                    }

                    if self.swap_topic(&name, generation, |current| {
                        negative_entry(&name, error, generation, now, current)
                    }) {
                        summary.negative += 1;
                    } else {
                        summary.superseded += 1;
                    }
                }
                Some(error) if result.partitions.is_empty() => {
                    if error.is_retriable() {
                        debug!(
                            topic = name.as_str(),
                            %error,
                            "transient topic error without partition data",
                        );
                    } else {
                        warn!(
                            topic = name.as_str(),
                            %error,
                            "non-retriable topic error without partition data, keeping cached entry",
                        );
                    }
                    summary.deferred += 1;
                }
                error => {
                    let mut partitions = result.partitions;
                    partitions.sort_by_key(|p| p.id);
                    let partitions = Arc::new(partitions);

                    if self.swap_topic(&name, generation, |_| TopicMetadata {
                        name: name.clone(),
                        state: TopicState::Present,
                        error,
                        is_internal: result.is_internal,
                        partitions,
                        generation,
                        fetched_at: Some(now),
                    }) {
                        summary.present += 1;
                    } else {
                        summary.superseded += 1;
                    }
                }
            }
        }

        if scope.is_full() {
            // Topics the cluster did not list are gone, unless a newer result
            // already arrived for them.
            let absent: Vec<String> = self
                .topics
                .read()
                .values()
                .filter(|t| !listed.contains(&t.name) && t.generation < generation)
                .map(|t| t.name.clone())
                .collect();

            for name in absent {
                if still_resolving(&name) {
                    debug!(topic = name.as_str(), generation, "deferring absence");
                    summary.deferred += 1;
                    continue;
                }

                if self.swap_topic(&name, generation, |current| {
                    negative_entry(
                        &name,
                        ErrorCode::UnknownTopicOrPartition,
                        generation,
                        now,
                        current,
                    )
                }) {
                    summary.negative += 1;
                }
            }

            let mut last = self.last_full_refresh.lock();
            if last.is_none_or(|(g, _)| g < generation) {
                *last = Some((generation, now));
            }
        }

        debug!(generation, ?scope, ?summary, "merged metadata");
        summary
    }

    /// Replaces the entry for `name` unless the stored one is at least as new.
    ///
    /// Returns `true` if the entry was replaced.
    fn swap_topic<F>(&self, name: &str, generation: u64, build: F) -> bool
    where
        F: FnOnce(Option<&TopicMetadata>) -> TopicMetadata,
    {
        let mut topics = self.topics.write();
        let new = match topics.get(name) {
            Some(current) if current.generation >= generation => return false,
            current => Arc::new(build(current.map(Arc::as_ref))),
        };
        topics.insert(name.to_owned(), new);
        true
    }

    fn merge_brokers(&self, authoritative: bool, generation: u64, brokers: Vec<Broker>) {
        let mut table = self.brokers.write();

        if authoritative {
            let listed: HashSet<i32> = brokers.iter().map(|b| b.id).collect();
            table.retain(|id, entry| {
                let keep = listed.contains(id) || entry.generation >= generation;
                if !keep {
                    info!(broker = id, url = %entry.broker, "Broker removed");
                }
                keep
            });
        }

        for broker in brokers {
            match table.entry(broker.id) {
                Entry::Occupied(mut o) => {
                    let current = o.get_mut();
                    if current.generation >= generation {
                        continue;
                    }

                    let state = if current.broker.host != broker.host
                        || current.broker.port != broker.port
                    {
                        info!(
                            broker = broker.id,
                            from = %current.broker,
                            to = %broker,
                            "Broker address updated",
                        );
                        BrokerState::Unknown
                    } else {
                        current.broker.state
                    };

                    *current = BrokerEntry {
                        broker: Broker { state, ..broker },
                        generation,
                    };
                }
                Entry::Vacant(v) => {
                    info!(broker = broker.id, url = %broker, "New broker");
                    v.insert(BrokerEntry { broker, generation });
                }
            }
        }
    }

    /// Records the connection state of a broker.
    ///
    /// Returns `false` if the broker is not known.
    pub fn set_broker_state(&self, id: i32, state: BrokerState) -> bool {
        match self.brokers.write().get_mut(&id) {
            Some(entry) => {
                entry.broker.state = state;
                true
            }
            None => false,
        }
    }

    pub fn broker(&self, id: i32) -> Option<Broker> {
        self.brokers.read().get(&id).map(|e| e.broker.clone())
    }

    /// Broker currently leading `partition` of `topic`.
    pub fn partition_leader(&self, topic: &str, partition: i32) -> Option<Broker> {
        let topic = self.get(topic)?;
        let partition = topic.partition(partition)?;
        if !partition.has_leader() {
            return None;
        }
        self.broker(partition.leader)
    }

    /// Point-in-time copy of the cache, optionally restricted to `topics`.
    pub fn snapshot(&self, topics: Option<&BTreeSet<String>>) -> TopologySnapshot {
        let brokers = self.brokers.read();
        let cached = self.topics.read();

        let mut brokers: Vec<Broker> = brokers.values().map(|e| e.broker.clone()).collect();
        brokers.sort_by_key(|b| b.id);

        let mut topics: Vec<TopicMetadata> = match topics {
            Some(want) => want
                .iter()
                .filter_map(|name| cached.get(name))
                .map(|t| t.as_ref().clone())
                .collect(),
            None => cached.values().map(|t| t.as_ref().clone()).collect(),
        };
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        TopologySnapshot {
            brokers,
            topics,
            freshness: Freshness::Cached,
            taken_at: Utc::now(),
        }
    }

    /// Resolved topics whose entry is older than `max_age`.
    ///
    /// Confirmed absences are included so a topic created later is picked up.
    pub fn stale_topics(&self, now: Instant, max_age: Duration) -> Vec<String> {
        self.topics
            .read()
            .values()
            .filter(|t| !matches!(t.state, TopicState::Unknown) && t.is_stale(now, max_age))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Completion time of the newest merged full refresh.
    pub fn last_full_refresh(&self) -> Option<Instant> {
        self.last_full_refresh.lock().map(|(_, at)| at)
    }

    /// Returns `true` if the store holds anything learnt from the cluster.
    pub fn has_data(&self) -> bool {
        !self.brokers.read().is_empty()
            || self
                .topics
                .read()
                .values()
                .any(|t| !matches!(t.state, TopicState::Unknown))
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.brokers.write().clear();
        self.topics.write().clear();
        *self.last_full_refresh.lock() = None;
        debug!("cleared metadata cache");
    }
}

fn negative_entry(
    name: &str,
    error: ErrorCode,
    generation: u64,
    now: Instant,
    current: Option<&TopicMetadata>,
) -> TopicMetadata {
    let since = match current.map(|c| c.state) {
        Some(TopicState::Error { since, .. }) => since,
        _ => now,
    };

    TopicMetadata {
        name: name.to_owned(),
        state: TopicState::Error { error, since },
        error: Some(error),
        is_internal: current.is_some_and(|c| c.is_internal),
        partitions: Default::default(),
        generation,
        fetched_at: Some(now),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::metadata::Partition;

    fn topics(entries: &[(&str, TopicResult)]) -> HashMap<String, TopicResult> {
        entries
            .iter()
            .map(|(name, result)| (name.to_string(), result.clone()))
            .collect()
    }

    fn one_partition(leader: i32) -> TopicResult {
        TopicResult::present(vec![Partition::new(0, leader, vec![leader])])
    }

    fn partial(names: &[&str]) -> RefreshScope {
        RefreshScope::topics(names.iter().copied()).unwrap()
    }

    #[test]
    fn test_get_unknown() {
        let store = MetadataStore::new();
        assert!(store.get("bananas").is_none());

        let entry = store.ensure("bananas");
        assert_eq!(entry.state, TopicState::Unknown);
        assert_eq!(entry.generation, 0);
        assert!(Arc::ptr_eq(&entry, &store.get("bananas").unwrap()));
        assert!(!store.has_data());
    }

    #[tokio::test]
    async fn test_merge_partial() {
        let store = MetadataStore::new();
        let summary = store.merge(
            &partial(&["bananas"]),
            1,
            Some(vec![Broker::new(1, "localhost", 9092)]),
            topics(&[("bananas", one_partition(1))]),
        );
        assert_eq!(summary.present, 1);

        let entry = store.get("bananas").unwrap();
        assert!(entry.is_present());
        assert_eq!(entry.generation, 1);
        assert_eq!(entry.partitions.len(), 1);
        assert_eq!(store.partition_leader("bananas", 0).unwrap().id, 1);
        assert!(store.partition_leader("bananas", 1).is_none());
        assert!(store.has_data());
        assert!(store.last_full_refresh().is_none());
    }

    #[tokio::test]
    async fn test_older_generation_is_noop() {
        let store = MetadataStore::new();
        store.merge(
            &partial(&["bananas"]),
            5,
            None,
            topics(&[("bananas", one_partition(1))]),
        );
        let before = store.get("bananas").unwrap();

        let summary = store.merge(
            &RefreshScope::Full,
            3,
            None,
            topics(&[("bananas", one_partition(2))]),
        );
        assert_eq!(summary.superseded, 1);

        let after = store.get("bananas").unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        // same generation is a no-op as well
        store.merge(
            &partial(&["bananas"]),
            5,
            None,
            topics(&[("bananas", TopicResult::error(ErrorCode::UnknownTopicOrPartition))]),
        );
        assert!(Arc::ptr_eq(&before, &store.get("bananas").unwrap()));
    }

    #[tokio::test]
    async fn test_full_refresh_marks_absent_topics() {
        let store = MetadataStore::new();
        store.merge(
            &partial(&["bananas", "platanos"]),
            1,
            None,
            topics(&[("bananas", one_partition(1)), ("platanos", one_partition(1))]),
        );
        store.ensure("goats");

        let summary = store.merge(
            &RefreshScope::Full,
            2,
            None,
            topics(&[("bananas", one_partition(2))]),
        );
        assert_eq!(summary.present, 1);
        assert_eq!(summary.negative, 2);
        assert!(store.last_full_refresh().is_some());

        assert_eq!(store.get("bananas").unwrap().partitions[0].leader, 2);
        for name in ["platanos", "goats"] {
            let entry = store.get(name).unwrap();
            assert_matches!(
                entry.state,
                TopicState::Error {
                    error: ErrorCode::UnknownTopicOrPartition,
                    ..
                }
            );
            assert!(entry.partitions.is_empty());
        }
    }

    #[tokio::test]
    async fn test_full_refresh_respects_newer_topics() {
        let store = MetadataStore::new();
        store.merge(
            &partial(&["bananas"]),
            7,
            None,
            topics(&[("bananas", one_partition(1))]),
        );

        // older full refresh that did not see the topic yet
        let summary = store.merge(&RefreshScope::Full, 6, None, HashMap::new());
        assert_eq!(summary.negative, 0);
        assert!(store.get("bananas").unwrap().is_present());
    }

    #[tokio::test]
    async fn test_still_resolving_defers_negative() {
        let store = MetadataStore::new();
        store.ensure("bananas");

        let summary = store.merge_guarded(
            &RefreshScope::Full,
            1,
            None,
            HashMap::new(),
            &|name| name == "bananas",
        );
        assert_eq!(summary.deferred, 1);
        assert_eq!(store.get("bananas").unwrap().state, TopicState::Unknown);

        let summary = store.merge_guarded(
            &partial(&["bananas"]),
            2,
            None,
            topics(&[("bananas", TopicResult::error(ErrorCode::UnknownTopicOrPartition))]),
            &|name| name == "bananas",
        );
        assert_eq!(summary.deferred, 1);
        assert_eq!(store.get("bananas").unwrap().state, TopicState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_keeps_transition_time() {
        let store = MetadataStore::new();
        let negative = || topics(&[("bananas", TopicResult::error(ErrorCode::UnknownTopicOrPartition))]);

        store.merge(&partial(&["bananas"]), 1, None, negative());
        let first = match store.get("bananas").unwrap().state {
            TopicState::Error { since, .. } => since,
            state => panic!("unexpected state: {state:?}"),
        };

        tokio::time::advance(Duration::from_secs(10)).await;
        store.merge(&partial(&["bananas"]), 2, None, negative());
        let entry = store.get("bananas").unwrap();
        assert_eq!(entry.generation, 2);
        assert_matches!(entry.state, TopicState::Error { since, .. } if since == first);

        // a positive result resets the state
        store.merge(&partial(&["bananas"]), 3, None, topics(&[("bananas", one_partition(1))]));
        assert!(store.get("bananas").unwrap().is_present());
    }

    #[tokio::test]
    async fn test_transient_error() {
        let store = MetadataStore::new();
        store.merge(&partial(&["bananas"]), 1, None, topics(&[("bananas", one_partition(1))]));
        let before = store.get("bananas").unwrap();

        let summary = store.merge(
            &partial(&["bananas"]),
            2,
            None,
            topics(&[("bananas", TopicResult::error(ErrorCode::LeaderNotAvailable))]),
        );
        assert_eq!(summary.deferred, 1);
        assert!(Arc::ptr_eq(&before, &store.get("bananas").unwrap()));

        // errors Kafka does not retry do not evict the entry either
        assert!(!ErrorCode::UnknownServerError.is_retriable());
        let summary = store.merge(
            &partial(&["bananas"]),
            3,
            None,
            topics(&[("bananas", TopicResult::error(ErrorCode::UnknownServerError))]),
        );
        assert_eq!(summary.deferred, 1);
        assert!(Arc::ptr_eq(&before, &store.get("bananas").unwrap()));

        // with partition data the error is recorded next to it
        let mut result = TopicResult::present(vec![Partition::new(0, -1, vec![1])]);
        result.error = Some(ErrorCode::LeaderNotAvailable);
        store.merge(&partial(&["bananas"]), 4, None, topics(&[("bananas", result)]));

        let entry = store.get("bananas").unwrap();
        assert!(entry.is_present());
        assert_eq!(entry.error, Some(ErrorCode::LeaderNotAvailable));
        assert!(store.partition_leader("bananas", 0).is_none());
    }

    #[tokio::test]
    async fn test_brokers() {
        let store = MetadataStore::new();
        store.merge(
            &RefreshScope::Full,
            1,
            Some(vec![
                Broker::new(1, "kafka-1", 9092),
                Broker::new(2, "kafka-2", 9092),
            ]),
            HashMap::new(),
        );
        assert!(store.set_broker_state(1, BrokerState::Up));
        assert!(!store.set_broker_state(42, BrokerState::Up));

        // partial refreshes add brokers but never remove them
        store.merge(
            &partial(&["bananas"]),
            2,
            Some(vec![Broker::new(3, "kafka-3", 9092)]),
            HashMap::new(),
        );
        assert_eq!(store.snapshot(None).brokers.len(), 3);

        // full refreshes are authoritative
        store.merge(
            &RefreshScope::Full,
            3,
            Some(vec![
                Broker::new(1, "kafka-1", 9092),
                Broker::new(2, "kafka-2-new", 9093),
            ]),
            HashMap::new(),
        );
        let snapshot = store.snapshot(None);
        assert_eq!(
            snapshot.brokers.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(snapshot.broker(1).unwrap().state, BrokerState::Up);
        assert_eq!(snapshot.broker(2).unwrap().host, "kafka-2-new");

        // older full refresh neither removes nor rewrites
        store.merge(
            &RefreshScope::Full,
            2,
            Some(vec![Broker::new(1, "stale", 1)]),
            HashMap::new(),
        );
        assert_eq!(store.broker(1).unwrap().host, "kafka-1");
        assert!(store.broker(2).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_filter() {
        let store = MetadataStore::new();
        store.merge(
            &partial(&["platanos", "bananas"]),
            1,
            None,
            topics(&[("platanos", one_partition(1)), ("bananas", one_partition(1))]),
        );

        let all = store.snapshot(None);
        assert_eq!(
            all.topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["bananas", "platanos"]
        );
        assert_eq!(all.freshness, Freshness::Cached);

        let want = BTreeSet::from(["bananas".to_owned(), "goats".to_owned()]);
        let some = store.snapshot(Some(&want));
        assert_eq!(some.topics.len(), 1);
        assert_eq!(some.topics[0].name, "bananas");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_topics() {
        let store = MetadataStore::new();
        store.ensure("goats");
        store.merge(
            &partial(&["bananas", "platanos"]),
            1,
            None,
            topics(&[
                ("bananas", one_partition(1)),
                ("platanos", TopicResult::error(ErrorCode::UnknownTopicOrPartition)),
            ]),
        );
        let max_age = Duration::from_secs(60);
        assert!(store.stale_topics(Instant::now(), max_age).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let mut stale = store.stale_topics(Instant::now(), max_age);
        stale.sort();
        assert_eq!(stale, vec!["bananas", "platanos"]);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MetadataStore::new();
        store.merge(
            &RefreshScope::Full,
            1,
            Some(vec![Broker::new(1, "kafka-1", 9092)]),
            topics(&[("bananas", one_partition(1))]),
        );
        store.clear();
        assert!(!store.has_data());
        assert!(store.get("bananas").is_none());
        assert!(store.last_full_refresh().is_none());
    }

    #[test]
    fn test_concurrent_readers_see_whole_partition_lists() {
        let store = MetadataStore::new();
        let partitions = |generation: i32| {
            TopicResult::present(
                (0..8)
                    .map(|p| Partition::new(p, generation, vec![generation]))
                    .collect(),
            )
        };
        store.merge(&partial(&["bananas"]), 1, None, topics(&[("bananas", partitions(1))]));

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1_000 {
                        let entry = store.get("bananas").unwrap();
                        let leader = entry.partitions[0].leader;
                        assert!(entry.partitions.iter().all(|p| p.leader == leader));
                        assert_eq!(entry.generation, leader as u64);
                    }
                });
            }

            s.spawn(|| {
                for generation in 2..500 {
                    store.merge(
                        &partial(&["bananas"]),
                        generation as u64,
                        None,
                        topics(&[("bananas", partitions(generation))]),
                    );
                }
            });
        });

        assert_eq!(store.get("bananas").unwrap().generation, 499);
    }

    proptest! {
        #[test]
        fn test_newest_generation_wins(
            generations in Just((1..=12_u64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let store = MetadataStore::new();
            for generation in generations {
                store.merge(
                    &partial(&["bananas"]),
                    generation,
                    None,
                    topics(&[("bananas", one_partition(generation as i32))]),
                );
            }

            let entry = store.get("bananas").unwrap();
            prop_assert_eq!(entry.generation, 12);
            prop_assert_eq!(entry.partitions[0].leader, 12);
        }
    }
}
