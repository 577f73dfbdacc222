//! Coordination of topology refreshes.
//!
//! Callers ask for a [`RefreshScope`]; the [`RefreshScheduler`] makes sure at
//! most one network query is outstanding per scope, lets narrower requests
//! ride along with a pending broader one, merges the result into the
//! [`MetadataStore`] and releases every waiter exactly once.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::oneshot,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, warn};

use crate::{
    backoff::{Backoff, BackoffConfig},
    client::{
        error::{Error, Result, validate_topic_name},
        metadata_store::MetadataStore,
    },
    connection::{BrokerQueryClient, TopologyResponse, TransportError},
    metadata::{Freshness, TopologySnapshot},
};

/// What a refresh asks the cluster for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshScope {
    /// Every topic in the cluster.
    Full,

    /// An explicit set of topics.
    Topics(BTreeSet<String>),
}

impl RefreshScope {
    /// A partial scope over `topics`, which must be non-empty and valid.
    pub fn topics<I, S>(topics: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::EmptyScope);
        }
        for topic in &topics {
            validate_topic_name(topic)?;
        }
        Ok(Self::Topics(topics))
    }

    pub fn topic(topic: impl Into<String>) -> Result<Self> {
        Self::topics([topic])
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Returns `true` if a refresh of `self` answers everything `other` asks.
    pub fn covers(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Full, _) => true,
            (Self::Topics(_), Self::Full) => false,
            (Self::Topics(mine), Self::Topics(theirs)) => theirs.is_subset(mine),
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        match self {
            Self::Full => true,
            Self::Topics(topics) => topics.contains(topic),
        }
    }

    /// Topic names of a partial scope, `None` for a full one.
    pub fn topic_names(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Full => None,
            Self::Topics(topics) => Some(topics),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Topics(topics) if topics.is_empty())
    }
}

/// Why a refresh did not update the cache.
#[derive(Debug, Error, Clone)]
pub enum RefreshFailure {
    #[error("Transport error: {0}")]
    Transport(Arc<TransportError>),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("refresh timed out")]
    TimedOut,
}

impl PartialEq for RefreshFailure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Transport(a), Self::Transport(b)) => Arc::ptr_eq(a, b),
            (Self::InvalidResponse(a), Self::InvalidResponse(b)) => a == b,
            (Self::TimedOut, Self::TimedOut) => true,
            _ => false,
        }
    }
}

/// What a waiter receives once its refresh reached a terminal state.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Token of the refresh that served this waiter.
    pub token: u64,

    /// Generation of the merged refresh, or why nothing was merged.
    pub result: Result<u64, RefreshFailure>,

    /// Cache contents for the requested scope after the refresh.
    pub snapshot: Arc<TopologySnapshot>,
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure(&self) -> Option<&RefreshFailure> {
        self.result.as_ref().err()
    }
}

/// Lifecycle of a refresh request.
///
/// `Created → InFlight → {Completed, Failed, TimedOut}`. A retry is a new
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for backoff or throttling of its scope to pass.
    Created,
    InFlight,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug)]
struct PendingRefresh {
    token: u64,
    scope: RefreshScope,
    state: RequestState,

    /// Assigned when the query is dispatched.
    generation: Option<u64>,

    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    submitted_at: Instant,
    deadline: Instant,
}

/// Earliest time the next query for a scope may be dispatched.
#[derive(Debug)]
struct ScopeGate {
    not_before: Instant,
    backoff: Backoff,

    /// Consecutive failures, `0` if the gate only stems from throttling.
    failures: u32,
}

/// Deduplicates and runs topology refreshes.
#[derive(Debug)]
pub struct RefreshScheduler {
    client: Arc<dyn BrokerQueryClient>,
    store: Arc<MetadataStore>,
    runtime: Handle,

    request_timeout: Duration,
    backoff_config: BackoffConfig,

    /// In-flight requests by scope. Lookup and insert happen under one lock.
    pending: Mutex<HashMap<RefreshScope, PendingRefresh>>,

    gates: Mutex<HashMap<RefreshScope, ScopeGate>>,

    next_token: AtomicU64,
    next_generation: AtomicU64,
    queries: AtomicU64,
}

impl RefreshScheduler {
    /// Creates a scheduler that spawns its refreshes onto `runtime`.
    pub fn new(
        client: Arc<dyn BrokerQueryClient>,
        store: Arc<MetadataStore>,
        runtime: Handle,
        request_timeout: Duration,
        backoff_config: BackoffConfig,
    ) -> Self {
        Self {
            client,
            store,
            runtime,
            request_timeout,
            backoff_config,
            pending: Default::default(),
            gates: Default::default(),
            next_token: AtomicU64::new(1),
            next_generation: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Refreshes `scope` and waits up to `timeout` for the outcome.
    ///
    /// If the wait times out the refresh keeps running; the caller gets the
    /// current cache contents flagged with [`RefreshFailure::TimedOut`].
    pub async fn request(
        self: &Arc<Self>,
        scope: RefreshScope,
        timeout: Duration,
    ) -> Result<RefreshOutcome> {
        if scope.is_empty() {
            return Err(Error::EmptyScope);
        }

        let (tx, rx) = oneshot::channel();
        let token = self.enqueue(&scope, Some(tx));

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                warn!(token, ?scope, "refresh dropped without an outcome");
                self.cached_outcome(token, &scope, RefreshFailure::TimedOut)
            }
            Err(_) => {
                debug!(token, ?scope, "stopped waiting for refresh");
                self.cached_outcome(token, &scope, RefreshFailure::TimedOut)
            }
        };

        // Joined a broader refresh, only hand out what was asked for.
        match scope.topic_names() {
            Some(names)
                if outcome
                    .snapshot
                    .topics
                    .iter()
                    .any(|t| !names.contains(&t.name)) =>
            {
                Ok(RefreshOutcome {
                    snapshot: Arc::new(
                        outcome.snapshot.filtered(names.iter().map(String::as_str)),
                    ),
                    ..outcome
                })
            }
            _ => Ok(outcome),
        }
    }

    /// Starts a refresh of `scope` without waiting for it.
    ///
    /// Returns the token of the refresh that will serve the scope.
    pub fn submit(self: &Arc<Self>, scope: RefreshScope) -> Result<u64> {
        if scope.is_empty() {
            return Err(Error::EmptyScope);
        }
        Ok(self.enqueue(&scope, None))
    }

    /// Re-submits failed scopes whose backoff elapsed.
    ///
    /// Returns the number of scopes submitted.
    pub fn retry_due(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let due: Vec<RefreshScope> = self
            .gates
            .lock()
            .iter()
            .filter(|(_, gate)| gate.failures > 0 && gate.not_before <= now)
            .map(|(scope, _)| scope.clone())
            .collect();

        for scope in &due {
            debug!(?scope, "retrying failed refresh");
            self.enqueue(scope, None);
        }
        due.len()
    }

    /// Number of topology queries sent so far.
    pub fn queries_sent(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of refreshes not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Joins a pending refresh covering `scope` or starts a new one.
    fn enqueue(
        self: &Arc<Self>,
        scope: &RefreshScope,
        waiter: Option<oneshot::Sender<RefreshOutcome>>,
    ) -> u64 {
        let mut pending = self.pending.lock();

        let existing = if pending.contains_key(scope) {
            pending.get_mut(scope)
        } else {
            pending.values_mut().find(|p| p.scope.covers(scope))
        };
        if let Some(request) = existing {
            debug!(
                token = request.token,
                ?scope,
                pending_scope = ?request.scope,
                "joining pending refresh",
            );
            request.waiters.extend(waiter);
            return request.token;
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let submitted_at = Instant::now();
        let deadline = submitted_at + self.request_timeout;
        pending.insert(
            scope.clone(),
            PendingRefresh {
                token,
                scope: scope.clone(),
                state: RequestState::Created,
                generation: None,
                waiters: waiter.into_iter().collect(),
                submitted_at,
                deadline,
            },
        );
        drop(pending);

        debug!(token, ?scope, "created refresh");
        self.runtime
            .spawn(Arc::clone(self).run(token, scope.clone(), deadline));
        token
    }

    async fn run(self: Arc<Self>, token: u64, scope: RefreshScope, deadline: Instant) {
        if let Some(not_before) = self.not_before(&scope) {
            if not_before >= deadline {
                sleep_until(deadline).await;
                self.finish(token, &scope, Err(RefreshFailure::TimedOut));
                return;
            }
            debug!(token, ?scope, "delaying refresh");
            sleep_until(not_before).await;
        }

        let generation = self.dispatch(token, &scope);
        let mut query = self.client.send_topology_query(&scope, deadline);

        tokio::select! {
            res = &mut query => self.complete(token, &scope, generation, res),
            _ = sleep_until(deadline) => {
                self.record_failure(&scope, &RefreshFailure::TimedOut);
                self.finish(token, &scope, Err(RefreshFailure::TimedOut));

                // Waiters are gone, but a late answer may still be news.
                match tokio::time::timeout(self.request_timeout, query).await {
                    Ok(Ok(response)) => {
                        if self.validate(&scope, &response).is_ok() {
                            let summary = self.merge(token, &scope, generation, response);
                            debug!(token, generation, ?summary, "merged late response");
                        }
                    }
                    Ok(Err(e)) => debug!(token, %e, "late refresh failed"),
                    Err(_) => debug!(token, "abandoned refresh"),
                }
            }
        }
    }

    /// Moves the request to [`RequestState::InFlight`] and assigns its
    /// generation.
    fn dispatch(&self, token: u64, scope: &RefreshScope) -> u64 {
        let mut pending = self.pending.lock();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(request) = pending.get_mut(scope).filter(|p| p.token == token) {
            request.state = RequestState::InFlight;
            request.generation = Some(generation);
            debug!(
                token,
                generation,
                ?scope,
                queued_ms = request.submitted_at.elapsed().as_millis() as u64,
                "dispatching refresh",
            );
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        generation
    }

    fn complete(
        &self,
        token: u64,
        scope: &RefreshScope,
        generation: u64,
        res: Result<TopologyResponse, TransportError>,
    ) {
        let failure = match res {
            Ok(response) => match self.validate(scope, &response) {
                Ok(()) => {
                    let throttle_time = response.throttle_time;
                    self.merge(token, scope, generation, response);
                    self.record_success(scope, throttle_time);
                    self.finish(token, scope, Ok(generation));
                    return;
                }
                Err(reason) => {
                    error!(token, ?scope, reason = reason.as_str(), "invalid metadata response");
                    RefreshFailure::InvalidResponse(reason)
                }
            },
            Err(e) => RefreshFailure::Transport(Arc::new(e)),
        };

        self.record_failure(scope, &failure);
        self.finish(token, scope, Err(failure));
    }

    fn merge(
        &self,
        token: u64,
        scope: &RefreshScope,
        generation: u64,
        response: TopologyResponse,
    ) -> crate::client::metadata_store::MergeSummary {
        // Any other pending refresh may still find topics this one considers
        // absent. One dispatched earlier can still land, as the deferred entry
        // keeps its generation.
        let resolving: Vec<RefreshScope> = self
            .pending
            .lock()
            .values()
            .filter(|p| p.token != token)
            .map(|p| p.scope.clone())
            .collect();

        self.store.merge_guarded(
            scope,
            generation,
            response.brokers,
            response.topics,
            &|topic| resolving.iter().any(|s| s.contains(topic)),
        )
    }

    /// Rejects responses whose partitions are led by brokers nobody knows
    /// about.
    ///
    /// The broker list of a full response replaces the cached one, so its
    /// leaders must be listed in it.
    fn validate(&self, scope: &RefreshScope, response: &TopologyResponse) -> Result<(), String> {
        let listed: Vec<i32> = response
            .brokers
            .iter()
            .flatten()
            .map(|b| b.id)
            .collect();
        let authoritative = scope.is_full() && response.brokers.is_some();
        let known = |id: i32| {
            listed.contains(&id) || (!authoritative && self.store.broker(id).is_some())
        };
        let any_known = !listed.is_empty() || self.store.has_data();

        for (name, topic) in &response.topics {
            let mut seen = BTreeSet::new();
            for partition in &topic.partitions {
                if !seen.insert(partition.id) {
                    return Err(format!(
                        "duplicate partition {} for topic '{}'",
                        partition.id, name
                    ));
                }
                if any_known && partition.has_leader() && !known(partition.leader) {
                    return Err(format!(
                        "partition {} of topic '{}' is led by unknown broker {}",
                        partition.id, name, partition.leader
                    ));
                }
            }
        }

        Ok(())
    }

    /// Removes the request from the pending table and releases its waiters.
    fn finish(&self, token: u64, scope: &RefreshScope, result: Result<u64, RefreshFailure>) {
        let request = {
            let mut pending = self.pending.lock();
            match pending.get(scope) {
                Some(request) if request.token == token => pending.remove(scope),
                _ => None,
            }
        };
        let Some(mut request) = request else {
            return;
        };

        request.state = match &result {
            Ok(_) => RequestState::Completed,
            Err(RefreshFailure::TimedOut) => RequestState::TimedOut,
            Err(_) => RequestState::Failed,
        };
        debug!(
            token,
            ?scope,
            state = ?request.state,
            generation = ?request.generation,
            waiters = request.waiters.len(),
            overdue = Instant::now() > request.deadline,
            "refresh finished",
        );

        let freshness = match &result {
            Ok(_) => Freshness::Refreshed,
            Err(failure) => Freshness::Stale(failure.clone()),
        };
        let outcome = RefreshOutcome {
            token,
            result,
            snapshot: Arc::new(
                self.store
                    .snapshot(scope.topic_names())
                    .with_freshness(freshness),
            ),
        };

        for waiter in request.waiters {
            // we don't care if the other side is gone
            waiter.send(outcome.clone()).ok();
        }
    }

    fn cached_outcome(
        &self,
        token: u64,
        scope: &RefreshScope,
        failure: RefreshFailure,
    ) -> RefreshOutcome {
        RefreshOutcome {
            token,
            snapshot: Arc::new(
                self.store
                    .snapshot(scope.topic_names())
                    .with_freshness(Freshness::Stale(failure.clone())),
            ),
            result: Err(failure),
        }
    }

    fn not_before(&self, scope: &RefreshScope) -> Option<Instant> {
        let now = Instant::now();
        self.gates
            .lock()
            .get(scope)
            .map(|gate| gate.not_before)
            .filter(|not_before| *not_before > now)
    }

    fn record_failure(&self, scope: &RefreshScope, failure: &RefreshFailure) {
        let now = Instant::now();
        let mut gates = self.gates.lock();
        let gate = gates.entry(scope.clone()).or_insert_with(|| ScopeGate {
            not_before: now,
            backoff: Backoff::new(&self.backoff_config),
            failures: 0,
        });
        let backoff = gate.backoff.next();
        gate.not_before = now + backoff;
        gate.failures += 1;

        warn!(
            e = %failure,
            ?scope,
            failures = gate.failures,
            backoff_ms = backoff.as_millis() as u64,
            "metadata refresh failed - backing off",
        );
    }

    fn record_success(&self, scope: &RefreshScope, throttle_time: Option<Duration>) {
        let mut gates = self.gates.lock();
        let previous = gates.remove(scope);
        if scope.is_full() {
            // the cluster answered for everything
            gates.clear();
        }

        if let Some(throttle_time) = throttle_time.filter(|t| !t.is_zero()) {
            debug!(?scope, throttle_ms = throttle_time.as_millis() as u64, "throttled by broker");
            let mut backoff = previous
                .map(|gate| gate.backoff)
                .unwrap_or_else(|| Backoff::new(&self.backoff_config));
            backoff.reset();
            gates.insert(
                scope.clone(),
                ScopeGate {
                    not_before: Instant::now() + throttle_time,
                    backoff,
                    failures: 0,
                },
            );
        }
    }
}
