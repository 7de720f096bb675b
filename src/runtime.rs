//! Pipeline coordinator driving events through extraction, the frontier, fetching, and merging.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{EnrichmentClient, EntityApi};
use crate::controls::EnrichmentControls;
use crate::error::{SourceError, StoreError};
use crate::extract::{extract_reference, hierarchy_references, EntityReference, Extraction};
use crate::frontier::{Admission, Freshness, Frontier, Resolution};
use crate::qid::Qid;
use crate::source::SourceRecord;
use crate::store::{EnrichmentStore, MergeOutcome};

/// Runs the enrichment pipeline against one store and client.
pub struct Pipeline<A> {
    controls: EnrichmentControls,
    store: Arc<EnrichmentStore>,
    client: Arc<EnrichmentClient<A>>,
}

impl<A: EntityApi + 'static> Pipeline<A> {
    /// Assembles a pipeline. The store is shared so overlapping runs can merge into one cache.
    pub fn new(
        controls: EnrichmentControls,
        store: Arc<EnrichmentStore>,
        client: EnrichmentClient<A>,
    ) -> Self {
        Self {
            controls,
            store,
            client: Arc::new(client),
        }
    }

    /// Cache the pipeline merges into.
    pub fn store(&self) -> &Arc<EnrichmentStore> {
        &self.store
    }

    /// Controls in effect.
    pub fn controls(&self) -> &EnrichmentControls {
        &self.controls
    }

    /// Consumes `events` until the stream ends or `shutdown` is cancelled, then drains and flushes.
    ///
    /// Per-entity fetch failures are counted, never returned; only a failed final flush of the
    /// store fails the run.
    pub async fn run<S>(
        &self,
        mut events: S,
        shutdown: CancellationToken,
    ) -> Result<RunReport, StoreError>
    where
        S: Stream<Item = Result<SourceRecord, SourceError>> + Unpin,
    {
        let started = Instant::now();
        let mut run = RunState::new(self, shutdown.clone());
        let mut stream_error = None;

        let linger = self.controls.batch_linger();
        let mut linger_tick = interval_at(Instant::now() + linger, linger);
        linger_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stream_open = true;
        while stream_open && !shutdown.is_cancelled() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                Some(joined) = run.tasks.join_next() => run.on_batch_finished(joined).await,
                _ = linger_tick.tick() => run.dispatch_partial(),
                next = events.next() => match next {
                    Some(Ok(record)) => run.on_record(record).await,
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "event stream failed; draining");
                        stream_error = Some(err.to_string());
                        stream_open = false;
                    }
                    None => stream_open = false,
                },
            }
        }

        while !shutdown.is_cancelled() {
            run.dispatch_all();
            if run.tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                Some(joined) = run.tasks.join_next() => run.on_batch_finished(joined).await,
            }
        }

        run.shut_down().await;
        self.store.flush()?;

        let report = run
            .metrics
            .report(started.elapsed(), self.store.len(), stream_error);
        tracing::info!(
            events = report.events_processed,
            fetched = report.fetch_successes,
            failed = report.fetch_failures,
            "enrichment run finished"
        );
        Ok(report)
    }
}

struct Slot {
    _permit: OwnedSemaphorePermit,
    hop: u8,
}

#[derive(Default)]
struct BatchResult {
    expansions: Vec<EntityReference>,
}

struct RunState<A> {
    frontier: Arc<Frontier>,
    store: Arc<EnrichmentStore>,
    client: Arc<EnrichmentClient<A>>,
    reference_slots: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    held: HashMap<Qid, Slot>,
    tasks: JoinSet<BatchResult>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    max_hops: u8,
    flush_every: usize,
    finished_batches: usize,
}

impl<A: EntityApi + 'static> RunState<A> {
    fn new(pipeline: &Pipeline<A>, shutdown: CancellationToken) -> Self {
        let controls = &pipeline.controls;
        Self {
            frontier: Arc::new(Frontier::new(
                Arc::clone(&pipeline.store),
                controls.freshness_policy(),
                controls.batch_size(),
            )),
            store: Arc::clone(&pipeline.store),
            client: Arc::clone(&pipeline.client),
            reference_slots: Arc::new(Semaphore::new(controls.max_queued_references())),
            workers: Arc::new(Semaphore::new(controls.worker_pool_size())),
            held: HashMap::new(),
            tasks: JoinSet::new(),
            metrics: Arc::new(Metrics::default()),
            shutdown,
            max_hops: controls.max_hops(),
            flush_every: controls.flush_every(),
            finished_batches: 0,
        }
    }

    async fn on_record(&mut self, record: SourceRecord) {
        let event = match record {
            SourceRecord::Event(event) => event,
            SourceRecord::Malformed { line, reason } => {
                tracing::debug!(line, %reason, "skipping malformed record");
                self.metrics.record(&self.metrics.skipped_malformed);
                return;
            }
        };
        self.metrics.record(&self.metrics.events_processed);
        match extract_reference(&event) {
            Extraction::Reference(reference) => {
                self.admit(reference).await;
            }
            Extraction::Missing => self.metrics.record(&self.metrics.skipped_no_reference),
            Extraction::Malformed(err) => {
                tracing::debug!(title = %event.title, error = %err, "skipping malformed entity id");
                self.metrics.record(&self.metrics.skipped_malformed);
            }
        }
    }

    /// Admits one reference, waiting for a backpressure slot first. Returns false when shutdown
    /// interrupted the wait.
    async fn admit(&mut self, reference: EntityReference) -> bool {
        let permit = match Arc::clone(&self.reference_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Slots free up only as batches finish, so make sure one is running.
                self.dispatch_partial();
                self.metrics.record(&self.metrics.backpressure_waits);
                let slots = Arc::clone(&self.reference_slots);
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return false,
                    permit = slots.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return false,
                    },
                }
            }
        };

        match self.frontier.admit(&reference, Utc::now()) {
            Admission::Fresh => self.metrics.record(&self.metrics.cache_hits),
            Admission::Joined(_) => self.metrics.record(&self.metrics.deduplicated),
            Admission::Closed => {}
            Admission::Queued { freshness, ready } => {
                if freshness == Freshness::KnownStale {
                    self.metrics.record(&self.metrics.stale_refreshes);
                }
                self.held.insert(
                    reference.qid().clone(),
                    Slot {
                        _permit: permit,
                        hop: reference.hop(),
                    },
                );
                if let Some(batch) = ready {
                    self.dispatch(batch);
                }
            }
        }
        true
    }

    fn dispatch_partial(&mut self) {
        if let Some(batch) = self.frontier.take_partial() {
            self.dispatch(batch);
        }
    }

    fn dispatch_all(&mut self) {
        while let Some(batch) = self.frontier.take_partial() {
            self.dispatch(batch);
        }
    }

    fn dispatch(&mut self, qids: Vec<Qid>) {
        if qids.is_empty() {
            return;
        }
        let mut slots = Vec::with_capacity(qids.len());
        let mut hops = Vec::with_capacity(qids.len());
        for qid in &qids {
            let slot = self.held.remove(qid);
            hops.push(slot.as_ref().map_or(0, |slot| slot.hop));
            slots.extend(slot);
        }
        self.metrics.record(&self.metrics.batches_dispatched);
        tracing::debug!(batch = qids.len(), "dispatching batch");

        let mut batch = BatchTask {
            frontier: Arc::clone(&self.frontier),
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            metrics: Arc::clone(&self.metrics),
            max_hops: self.max_hops,
            unresolved: qids.iter().cloned().collect(),
        };
        let workers = Arc::clone(&self.workers);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            // Slots are released only after every qid is merged and completed.
            let _slots = slots;
            let _worker = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return batch.abandon(&qids),
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return batch.abandon(&qids),
                },
            };
            batch.execute(qids, hops).await
        });
    }

    async fn on_batch_finished(&mut self, joined: Result<BatchResult, JoinError>) {
        let Some(result) = self.settle(joined) else {
            return;
        };
        self.flush_periodically().await;
        for reference in result.expansions {
            self.metrics.record(&self.metrics.hop_references);
            if !self.admit(reference).await {
                break;
            }
        }
    }

    fn settle(&mut self, joined: Result<BatchResult, JoinError>) -> Option<BatchResult> {
        match joined {
            Ok(result) => {
                self.finished_batches += 1;
                Some(result)
            }
            Err(err) => {
                tracing::error!(error = %err, "batch task failed");
                None
            }
        }
    }

    async fn flush_periodically(&self) {
        if self.flush_every == 0 || self.finished_batches % self.flush_every != 0 {
            return;
        }
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "periodic cache flush failed"),
            Err(err) => tracing::error!(error = %err, "periodic cache flush panicked"),
        }
    }

    /// Stops admissions, abandons undispatched qids, and waits for running batches to merge.
    async fn shut_down(&mut self) {
        let abandoned = self.frontier.shutdown();
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "abandoning queued references");
        }
        self.metrics
            .abandoned
            .fetch_add(abandoned.len(), Ordering::Relaxed);
        self.held.clear();
        while let Some(joined) = self.tasks.join_next().await {
            // Expansions are dropped; the frontier no longer admits work.
            self.settle(joined);
        }
    }
}

struct BatchTask<A> {
    frontier: Arc<Frontier>,
    store: Arc<EnrichmentStore>,
    client: Arc<EnrichmentClient<A>>,
    metrics: Arc<Metrics>,
    max_hops: u8,
    // Qids not yet completed in the frontier; whatever is left on drop is failed.
    unresolved: HashSet<Qid>,
}

impl<A> BatchTask<A> {
    fn resolve(&mut self, qid: &Qid, resolution: Resolution) {
        self.unresolved.remove(qid);
        self.frontier.complete(qid, resolution);
    }
}

// A panicking or aborted task drops its future mid-batch. Without this, its qids would stay in
// flight and every later reference would join a fetch that never completes.
impl<A> Drop for BatchTask<A> {
    fn drop(&mut self) {
        if self.unresolved.is_empty() {
            return;
        }
        tracing::error!(
            count = self.unresolved.len(),
            "batch ended before completing its qids; marking them failed"
        );
        for qid in self.unresolved.drain() {
            self.metrics.record(&self.metrics.fetch_failures);
            self.frontier.complete(&qid, Resolution::Failed);
        }
    }
}

impl<A: EntityApi> BatchTask<A> {
    async fn execute(mut self, qids: Vec<Qid>, hops: Vec<u8>) -> BatchResult {
        let outcome = self.client.fetch_batch(&qids).await;
        self.metrics
            .fetch_requests
            .fetch_add(outcome.attempts as usize, Ordering::Relaxed);

        let mut expansions = Vec::new();
        for ((qid, result), hop) in outcome.outcomes.into_iter().zip(hops) {
            match result {
                Ok(fetched) => {
                    let merge = self
                        .store
                        .merge(&qid, fetched.attributes, fetched.fetched_at);
                    self.metrics.record_merge(merge);
                    if hop < self.max_hops {
                        if let Some(entity) = self.store.get(&qid) {
                            expansions.extend(hierarchy_references(&entity, hop));
                        }
                    }
                    self.resolve(&qid, Resolution::Fetched);
                }
                Err(failure) => {
                    tracing::debug!(qid = %qid, %failure, "entity not enriched");
                    self.metrics.record(&self.metrics.fetch_failures);
                    self.resolve(&qid, Resolution::Failed);
                }
            }
        }
        BatchResult { expansions }
    }

    fn abandon(&mut self, qids: &[Qid]) -> BatchResult {
        for qid in qids {
            self.resolve(qid, Resolution::Abandoned);
        }
        self.metrics
            .abandoned
            .fetch_add(qids.len(), Ordering::Relaxed);
        BatchResult::default()
    }
}

#[derive(Default)]
struct Metrics {
    events_processed: AtomicUsize,
    skipped_no_reference: AtomicUsize,
    skipped_malformed: AtomicUsize,
    cache_hits: AtomicUsize,
    deduplicated: AtomicUsize,
    stale_refreshes: AtomicUsize,
    backpressure_waits: AtomicUsize,
    batches_dispatched: AtomicUsize,
    fetch_requests: AtomicUsize,
    fetch_successes: AtomicUsize,
    fetch_failures: AtomicUsize,
    merges_inserted: AtomicUsize,
    merges_updated: AtomicUsize,
    merges_unchanged: AtomicUsize,
    hop_references: AtomicUsize,
    abandoned: AtomicUsize,
}

impl Metrics {
    fn record(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_merge(&self, outcome: MergeOutcome) {
        self.record(&self.fetch_successes);
        match outcome {
            MergeOutcome::Inserted => self.record(&self.merges_inserted),
            MergeOutcome::Updated => self.record(&self.merges_updated),
            MergeOutcome::Unchanged => self.record(&self.merges_unchanged),
        }
    }

    fn report(
        &self,
        elapsed: Duration,
        cached_entities: usize,
        stream_error: Option<String>,
    ) -> RunReport {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        RunReport {
            events_processed: load(&self.events_processed),
            skipped_no_reference: load(&self.skipped_no_reference),
            skipped_malformed: load(&self.skipped_malformed),
            cache_hits: load(&self.cache_hits),
            deduplicated: load(&self.deduplicated),
            stale_refreshes: load(&self.stale_refreshes),
            backpressure_waits: load(&self.backpressure_waits),
            batches_dispatched: load(&self.batches_dispatched),
            fetch_requests: load(&self.fetch_requests),
            fetch_successes: load(&self.fetch_successes),
            fetch_failures: load(&self.fetch_failures),
            merges_inserted: load(&self.merges_inserted),
            merges_updated: load(&self.merges_updated),
            merges_unchanged: load(&self.merges_unchanged),
            hop_references: load(&self.hop_references),
            abandoned: load(&self.abandoned),
            cached_entities,
            elapsed,
            stream_error,
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Records decoded into edit events.
    pub events_processed: usize,
    /// Events without an entity id.
    pub skipped_no_reference: usize,
    /// Undecodable lines plus events with a malformed entity id.
    pub skipped_malformed: usize,
    /// References answered from a fresh cache record.
    pub cache_hits: usize,
    /// References that joined a fetch already queued or running.
    pub deduplicated: usize,
    /// References queued because their cache record was stale.
    pub stale_refreshes: usize,
    /// Times stream consumption paused for a reference slot.
    pub backpressure_waits: usize,
    /// Batches handed to the client.
    pub batches_dispatched: usize,
    /// API requests issued, retries included.
    pub fetch_requests: usize,
    /// Qids fetched and merged.
    pub fetch_successes: usize,
    /// Qids that produced no attributes this run.
    pub fetch_failures: usize,
    /// Merges that created a record.
    pub merges_inserted: usize,
    /// Merges that refreshed a record.
    pub merges_updated: usize,
    /// Merges that were not newer than the stored record.
    pub merges_unchanged: usize,
    /// References discovered through `instance_of`/`subclass_of`.
    pub hop_references: usize,
    /// Queued qids dropped by shutdown before their batch started.
    pub abandoned: usize,
    /// Records in the cache after the final flush.
    pub cached_entities: usize,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Why the event stream ended early, if it failed.
    pub stream_error: Option<String>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f32().max(f32::EPSILON);
        writeln!(f, "--- enrichment metrics ({secs:.2}s) ---")?;
        writeln!(f, "events processed: {}", self.events_processed)?;
        writeln!(f, "events/sec: {:.2}", self.events_processed as f32 / secs)?;
        writeln!(f, "skipped (no entity): {}", self.skipped_no_reference)?;
        writeln!(f, "skipped (malformed): {}", self.skipped_malformed)?;
        writeln!(f, "cache hits: {}", self.cache_hits)?;
        writeln!(f, "in-flight joins: {}", self.deduplicated)?;
        writeln!(f, "stale refreshes: {}", self.stale_refreshes)?;
        writeln!(f, "backpressure waits: {}", self.backpressure_waits)?;
        writeln!(
            f,
            "batches: {} (requests {})",
            self.batches_dispatched, self.fetch_requests
        )?;
        writeln!(f, "fetch successes: {}", self.fetch_successes)?;
        writeln!(f, "fetch failures: {}", self.fetch_failures)?;
        writeln!(
            f,
            "merges: {} inserted, {} updated, {} unchanged",
            self.merges_inserted, self.merges_updated, self.merges_unchanged
        )?;
        writeln!(f, "hop references: {}", self.hop_references)?;
        writeln!(f, "abandoned at shutdown: {}", self.abandoned)?;
        write!(f, "cached entities: {}", self.cached_entities)?;
        if let Some(err) = &self.stream_error {
            write!(f, "\nstream error: {err}")?;
        }
        Ok(())
    }
}
