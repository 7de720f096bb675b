//! Frontier coordination: freshness decisions, in-flight dedupe, and fetch batching.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::entity::{EntityState, Timestamp};
use crate::extract::EntityReference;
use crate::qid::Qid;
use crate::store::EnrichmentStore;

/// Default number of qids per fetch batch (the `wbgetentities` ceiling).
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Cache knowledge about one referenced qid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Cached and within policy; skip.
    KnownFresh,
    /// Cached but too old; refresh.
    KnownStale,
    /// Not cached; fetch.
    Unknown,
}

/// Time-to-live policy for cached entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessPolicy {
    stale_after: Option<chrono::Duration>,
}

impl FreshnessPolicy {
    /// Cached entities never go stale.
    pub fn never() -> Self {
        Self { stale_after: None }
    }

    /// Cached entities go stale once `ttl` has elapsed since their last update.
    pub fn after(ttl: Duration) -> Self {
        Self {
            stale_after: chrono::Duration::from_std(ttl).ok(),
        }
    }

    /// Configured TTL, if any.
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        self.stale_after
    }

    /// Classifies a qid given when it was last updated (`None` when uncached).
    pub fn classify(&self, last_updated: Option<Timestamp>, now: Timestamp) -> Freshness {
        match (last_updated, self.stale_after) {
            (None, _) => Freshness::Unknown,
            (Some(updated), Some(ttl)) if now.signed_duration_since(updated) >= ttl => {
                Freshness::KnownStale
            }
            (Some(_), _) => Freshness::KnownFresh,
        }
    }
}

/// How an outstanding fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Attributes were fetched and merged into the store.
    Fetched,
    /// The fetch failed; the qid may be admitted again later.
    Failed,
    /// The qid was queued but shutdown prevented its batch from starting.
    Abandoned,
}

/// Handle for a reference that joined an already outstanding fetch.
#[derive(Debug)]
pub struct Completion {
    rx: watch::Receiver<Option<Resolution>>,
}

impl Completion {
    /// Waits for the outstanding fetch to resolve.
    pub async fn wait(mut self) -> Resolution {
        loop {
            if let Some(resolution) = *self.rx.borrow_and_update() {
                return resolution;
            }
            if self.rx.changed().await.is_err() {
                return (*self.rx.borrow()).unwrap_or(Resolution::Abandoned);
            }
        }
    }
}

/// Frontier decision for one reference.
#[derive(Debug)]
pub enum Admission {
    /// Cache hit; nothing to do.
    Fresh,
    /// A fetch for this qid is already queued or running.
    Joined(Completion),
    /// The qid was queued for fetching. `ready` holds a full batch when this admission filled one.
    Queued {
        /// Why the qid needs fetching.
        freshness: Freshness,
        /// A full batch to hand to the client, if one is ready.
        ready: Option<Vec<Qid>>,
    },
    /// The frontier is shutting down and no longer admits work.
    Closed,
}

#[derive(Default)]
struct FrontierState {
    pending: VecDeque<Qid>,
    in_flight: HashMap<Qid, watch::Sender<Option<Resolution>>>,
    shutdown: bool,
}

/// Tracks outstanding fetches so each qid has at most one, and groups work into batches.
pub struct Frontier {
    store: Arc<EnrichmentStore>,
    policy: FreshnessPolicy,
    batch_size: usize,
    state: Mutex<FrontierState>,
}

impl Frontier {
    /// Constructs a frontier over `store`; `batch_size` is raised to at least one.
    pub fn new(store: Arc<EnrichmentStore>, policy: FreshnessPolicy, batch_size: usize) -> Self {
        Self {
            store,
            policy,
            batch_size: batch_size.max(1),
            state: Mutex::new(FrontierState::default()),
        }
    }

    /// Maximum qids per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Qids queued but not yet handed out in a batch.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Qids queued or being fetched.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Classifies `reference` and registers it for fetching when needed.
    ///
    /// Classification and registration happen under one lock, so concurrent admissions of the
    /// same qid yield exactly one `Queued` and `Joined` for the rest.
    pub fn admit(&self, reference: &EntityReference, now: Timestamp) -> Admission {
        let mut state = self.lock();
        if state.shutdown {
            return Admission::Closed;
        }
        let qid = reference.qid();
        if let Some(sender) = state.in_flight.get(qid) {
            return Admission::Joined(Completion {
                rx: sender.subscribe(),
            });
        }
        let freshness = self.policy.classify(self.store.last_updated(qid), now);
        if freshness == Freshness::KnownFresh {
            return Admission::Fresh;
        }
        let (sender, _) = watch::channel(None);
        state.in_flight.insert(qid.clone(), sender);
        state.pending.push_back(qid.clone());
        let ready = if state.pending.len() >= self.batch_size {
            Some(state.pending.drain(..self.batch_size).collect())
        } else {
            None
        };
        Admission::Queued { freshness, ready }
    }

    /// Hands out up to one batch of queued qids regardless of fill level.
    pub fn take_partial(&self) -> Option<Vec<Qid>> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return None;
        }
        let take = state.pending.len().min(self.batch_size);
        Some(state.pending.drain(..take).collect())
    }

    /// Clears the outstanding fetch for `qid` and wakes any joined references.
    ///
    /// Callers merge into the store before completing, so a later admission sees the new record.
    pub fn complete(&self, qid: &Qid, resolution: Resolution) {
        let sender = self.lock().in_flight.remove(qid);
        if let Some(sender) = sender {
            sender.send_replace(Some(resolution));
        }
    }

    /// Stops admissions and abandons queued qids whose batches never started.
    pub fn shutdown(&self) -> Vec<Qid> {
        let mut state = self.lock();
        state.shutdown = true;
        let abandoned: Vec<Qid> = state.pending.drain(..).collect();
        for qid in &abandoned {
            if let Some(sender) = state.in_flight.remove(qid) {
                sender.send_replace(Some(Resolution::Abandoned));
            }
        }
        abandoned
    }

    /// Whether [`Frontier::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Conceptual lifecycle state of `qid`.
    pub fn state_of(&self, qid: &Qid, now: Timestamp) -> EntityState {
        if self.lock().in_flight.contains_key(qid) {
            return EntityState::PendingFetch;
        }
        match self.policy.classify(self.store.last_updated(qid), now) {
            Freshness::Unknown => EntityState::Unseen,
            Freshness::KnownFresh => EntityState::Fetched,
            Freshness::KnownStale => EntityState::Stale,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityAttributes;
    use chrono::{TimeZone, Utc};

    fn qid(raw: &str) -> Qid {
        Qid::parse(raw).expect("test qid")
    }

    fn reference(raw: &str) -> EntityReference {
        EntityReference::direct(qid(raw))
    }

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn policy_classification() {
        let never = FreshnessPolicy::never();
        assert_eq!(never.classify(None, at(0)), Freshness::Unknown);
        assert_eq!(never.classify(Some(at(0)), at(1_000_000)), Freshness::KnownFresh);

        let hourly = FreshnessPolicy::after(Duration::from_secs(3600));
        assert_eq!(hourly.classify(Some(at(0)), at(3599)), Freshness::KnownFresh);
        assert_eq!(hourly.classify(Some(at(0)), at(3600)), Freshness::KnownStale);
    }

    #[test]
    fn duplicate_references_join_the_first() {
        let frontier = Frontier::new(
            Arc::new(EnrichmentStore::in_memory()),
            FreshnessPolicy::never(),
            4,
        );
        assert!(matches!(
            frontier.admit(&reference("Q100"), at(0)),
            Admission::Queued {
                freshness: Freshness::Unknown,
                ready: None
            }
        ));
        assert!(matches!(
            frontier.admit(&reference("Q100"), at(0)),
            Admission::Joined(_)
        ));
        assert_eq!(frontier.pending(), 1);
        assert_eq!(frontier.take_partial(), Some(vec![qid("Q100")]));
        assert!(matches!(
            frontier.admit(&reference("Q100"), at(0)),
            Admission::Joined(_)
        ));
    }

    #[test]
    fn full_batch_is_returned_by_the_filling_admission() {
        let frontier = Frontier::new(
            Arc::new(EnrichmentStore::in_memory()),
            FreshnessPolicy::never(),
            2,
        );
        frontier.admit(&reference("Q1"), at(0));
        match frontier.admit(&reference("Q2"), at(0)) {
            Admission::Queued { ready, .. } => {
                assert_eq!(ready, Some(vec![qid("Q1"), qid("Q2")]))
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert_eq!(frontier.pending(), 0);
        assert_eq!(frontier.in_flight(), 2);
    }

    #[test]
    fn cached_entities_skip_until_stale() {
        let store = Arc::new(EnrichmentStore::in_memory());
        store.merge(&qid("Q42"), EntityAttributes::default(), at(0));
        let frontier = Frontier::new(
            Arc::clone(&store),
            FreshnessPolicy::after(Duration::from_secs(60)),
            10,
        );
        assert!(matches!(
            frontier.admit(&reference("Q42"), at(30)),
            Admission::Fresh
        ));
        assert_eq!(frontier.state_of(&qid("Q42"), at(30)), EntityState::Fetched);
        assert_eq!(frontier.state_of(&qid("Q42"), at(61)), EntityState::Stale);
        assert!(matches!(
            frontier.admit(&reference("Q42"), at(61)),
            Admission::Queued {
                freshness: Freshness::KnownStale,
                ..
            }
        ));
        assert_eq!(
            frontier.state_of(&qid("Q42"), at(61)),
            EntityState::PendingFetch
        );
    }

    #[test]
    fn failed_fetch_is_not_remembered() {
        let frontier = Frontier::new(
            Arc::new(EnrichmentStore::in_memory()),
            FreshnessPolicy::never(),
            10,
        );
        frontier.admit(&reference("Q999"), at(0));
        frontier.take_partial();
        frontier.complete(&qid("Q999"), Resolution::Failed);
        assert_eq!(frontier.state_of(&qid("Q999"), at(0)), EntityState::Unseen);
        assert!(matches!(
            frontier.admit(&reference("Q999"), at(1)),
            Admission::Queued {
                freshness: Freshness::Unknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn joined_reference_waits_for_the_first_fetch() {
        let store = Arc::new(EnrichmentStore::in_memory());
        let frontier = Arc::new(Frontier::new(
            Arc::clone(&store),
            FreshnessPolicy::never(),
            10,
        ));
        frontier.admit(&reference("Q100"), at(0));
        let Admission::Joined(completion) = frontier.admit(&reference("Q100"), at(0)) else {
            panic!("second admission should join");
        };
        let waiter = tokio::spawn(completion.wait());
        tokio::task::yield_now().await;

        store.merge(&qid("Q100"), EntityAttributes::default(), at(1));
        frontier.complete(&qid("Q100"), Resolution::Fetched);

        assert_eq!(waiter.await.expect("waiter"), Resolution::Fetched);
        assert!(matches!(
            frontier.admit(&reference("Q100"), at(2)),
            Admission::Fresh
        ));
    }

    #[tokio::test]
    async fn shutdown_abandons_queued_qids() {
        let frontier = Frontier::new(
            Arc::new(EnrichmentStore::in_memory()),
            FreshnessPolicy::never(),
            10,
        );
        frontier.admit(&reference("Q1"), at(0));
        let Admission::Joined(completion) = frontier.admit(&reference("Q1"), at(0)) else {
            panic!("second admission should join");
        };
        assert_eq!(frontier.shutdown(), vec![qid("Q1")]);
        assert_eq!(completion.wait().await, Resolution::Abandoned);
        assert!(matches!(
            frontier.admit(&reference("Q2"), at(0)),
            Admission::Closed
        ));
        assert_eq!(frontier.in_flight(), 0);
    }
}
