//! Enrichment throttle and batching controls shared across binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::client::wikidata::{MAX_IDS_PER_REQUEST, WIKIDATA_API};
use crate::frontier::{FreshnessPolicy, DEFAULT_BATCH_SIZE};
use crate::limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::DEFAULT_CACHE_PATH;

/// Tunable knobs that bound pipeline behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentControls {
    batch_size: usize,
    requests_per_window: usize,
    rate_window: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    stale_after: Option<Duration>,
    max_queued_references: usize,
    worker_pool_size: usize,
    batch_linger: Duration,
    flush_every: usize,
    max_hops: u8,
}

impl EnrichmentControls {
    /// Sets the qids per fetch batch, clamped to `1..=50`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_IDS_PER_REQUEST);
        self
    }

    /// Sets how many requests may start within one `window`.
    pub fn with_rate_limit(mut self, requests: usize, window: Duration) -> Self {
        self.requests_per_window = requests.max(1);
        self.rate_window = window;
        self
    }

    /// Sets the retry budget and exponential backoff bounds.
    pub fn with_retry(mut self, max_attempts: u32, base: Duration, cap: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = base;
        self.backoff_cap = cap.max(base);
        self
    }

    /// Sets the staleness TTL; `None` means cached entities never go stale.
    pub fn with_stale_after(mut self, ttl: Option<Duration>) -> Self {
        self.stale_after = ttl;
        self
    }

    /// Sets the ceiling on admitted references not yet merged.
    pub fn with_max_queued_references(mut self, max: usize) -> Self {
        self.max_queued_references = max.max(1);
        self
    }

    /// Sets how many batches may be fetched concurrently.
    pub fn with_worker_pool_size(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers.max(1);
        self
    }

    /// Sets how long a partial batch may wait before dispatch.
    pub fn with_batch_linger(mut self, linger: Duration) -> Self {
        self.batch_linger = linger.max(Duration::from_millis(1));
        self
    }

    /// Sets the periodic flush interval in completed batches (0 = flush only at close).
    pub fn with_flush_every(mut self, batches: usize) -> Self {
        self.flush_every = batches;
        self
    }

    /// Sets how many hierarchy hops past the edited entity are enriched.
    pub fn with_max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    /// Qids per fetch batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Requests allowed per rate window.
    pub fn requests_per_window(&self) -> usize {
        self.requests_per_window
    }

    /// Length of the rate window.
    pub fn rate_window(&self) -> Duration {
        self.rate_window
    }

    /// Attempts per batch, first request included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Optional staleness TTL.
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after
    }

    /// Backpressure ceiling on unmerged references.
    pub fn max_queued_references(&self) -> usize {
        self.max_queued_references
    }

    /// Concurrent batch fetches.
    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size
    }

    /// Partial batch dispatch interval.
    pub fn batch_linger(&self) -> Duration {
        self.batch_linger
    }

    /// Completed batches between periodic flushes.
    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    /// Hierarchy hops enriched beyond the edited entity.
    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    /// Retry policy built from the configured attempts and backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_cap)
    }

    /// Freshness policy built from the configured TTL.
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        self.stale_after
            .map_or_else(FreshnessPolicy::never, FreshnessPolicy::after)
    }

    /// Fresh limiter for the configured request rate.
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_window, self.rate_window)
    }
}

impl Default for EnrichmentControls {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            requests_per_window: 5,
            rate_window: Duration::from_secs(1),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            stale_after: None,
            max_queued_references: 1024,
            worker_pool_size: 4,
            batch_linger: Duration::from_millis(500),
            flush_every: 16,
            max_hops: 0,
        }
    }
}

/// Command-line interface for the enrichment pipeline.
#[derive(Parser, Debug, Clone)]
#[command(name = "wikienrich", about = "Incremental Wikidata enrichment of edit streams")]
pub struct Cli {
    /// Edit events as JSONL or SSE lines (`-` reads stdin)
    #[arg(long, env = "WIKIENRICH_INPUT", default_value = "-")]
    pub input: String,

    /// Consume a live EventStream instead of `--input`
    #[arg(long, env = "WIKIENRICH_STREAM_URL")]
    pub stream_url: Option<Url>,

    /// Resolve page titles to entity ids for events that carry none
    #[arg(long, env = "WIKIENRICH_RESOLVE_TITLES", default_value_t = false)]
    pub resolve_titles: bool,

    /// Fixed page-props endpoint for title resolution (derived from each event's wiki when unset)
    #[arg(long, env = "WIKIENRICH_RESOLVER_ENDPOINT")]
    pub resolver_endpoint: Option<Url>,

    /// Enrichment cache file
    #[arg(long, env = "WIKIENRICH_CACHE", default_value = DEFAULT_CACHE_PATH)]
    pub cache: PathBuf,

    /// Seconds to run before requesting shutdown (runs until stream end when unset)
    #[arg(long, env = "WIKIENRICH_DURATION")]
    pub duration_secs: Option<u64>,

    /// Qids per fetch batch (at most 50)
    #[arg(long, env = "WIKIENRICH_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Requests allowed per rate window
    #[arg(long, env = "WIKIENRICH_RATE_LIMIT", default_value_t = 5)]
    pub rate_limit: usize,

    /// Rate window length in milliseconds
    #[arg(long, env = "WIKIENRICH_RATE_WINDOW_MS", default_value_t = 1000)]
    pub rate_window_ms: u64,

    /// Attempts per batch before giving up
    #[arg(long, env = "WIKIENRICH_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "WIKIENRICH_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Largest retry delay in milliseconds
    #[arg(long, env = "WIKIENRICH_BACKOFF_CAP_MS", default_value_t = 30_000)]
    pub backoff_cap_ms: u64,

    /// Refetch cached entities older than this many seconds (never when unset)
    #[arg(long, env = "WIKIENRICH_STALE_AFTER_SECS")]
    pub stale_after_secs: Option<u64>,

    /// Admitted references allowed before the stream is paused
    #[arg(long, env = "WIKIENRICH_MAX_QUEUED", default_value_t = 1024)]
    pub max_queued: usize,

    /// Concurrent batch fetches
    #[arg(long, env = "WIKIENRICH_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Milliseconds a partial batch waits before dispatch
    #[arg(long, env = "WIKIENRICH_LINGER_MS", default_value_t = 500)]
    pub linger_ms: u64,

    /// Completed batches between cache flushes (0 = only at shutdown)
    #[arg(long, env = "WIKIENRICH_FLUSH_EVERY", default_value_t = 16)]
    pub flush_every: usize,

    /// Hierarchy hops enriched beyond the edited entity
    #[arg(long, env = "WIKIENRICH_MAX_HOPS", default_value_t = 0)]
    pub max_hops: u8,

    /// Wikidata action API endpoint
    #[arg(long, env = "WIKIENRICH_API_ENDPOINT", default_value = WIKIDATA_API)]
    pub api_endpoint: Url,

    /// Language for labels and descriptions
    #[arg(long, env = "WIKIENRICH_LANGUAGE", default_value = "en")]
    pub language: String,

    /// Bearer token sent with API requests
    #[arg(long, env = "WIKIDATA_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "WIKIENRICH_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl Cli {
    /// Converts the parsed CLI into `EnrichmentControls`.
    pub fn build_controls(&self) -> EnrichmentControls {
        EnrichmentControls::default()
            .with_batch_size(self.batch_size)
            .with_rate_limit(self.rate_limit, Duration::from_millis(self.rate_window_ms))
            .with_retry(
                self.max_attempts,
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_cap_ms),
            )
            .with_stale_after(self.stale_after_secs.map(Duration::from_secs))
            .with_max_queued_references(self.max_queued)
            .with_worker_pool_size(self.workers)
            .with_batch_linger(Duration::from_millis(self.linger_ms))
            .with_flush_every(self.flush_every)
            .with_max_hops(self.max_hops)
    }

    /// Returns the requested run duration, if any.
    pub fn run_duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    /// Per-request timeout for the API client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
