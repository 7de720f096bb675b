#![warn(missing_docs)]
//! Core library entry points for the wikienrich pipeline.

pub mod client;
pub mod controls;
pub mod entity;
pub mod error;
pub mod event;
pub mod extract;
pub mod frontier;
pub mod limiter;
pub mod qid;
pub mod resolve;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod store;
pub mod telemetry;

pub use client::wikidata::WikidataApi;
pub use client::{BatchOutcome, EnrichmentClient, EntityApi, EntityPayload, FetchFailure};
pub use controls::{Cli, EnrichmentControls};
pub use entity::{EnrichedEntity, EntityAttributes, EntityState, Timestamp};
pub use error::{FetchError, QidError, SourceError, StoreError};
pub use event::EditEvent;
pub use extract::{extract_reference, EntityReference, Extraction};
pub use frontier::{Admission, Freshness, FreshnessPolicy, Frontier, Resolution};
pub use limiter::RateLimiter;
pub use qid::Qid;
pub use resolve::{resolve_titles, TitleResolver};
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use runtime::{Pipeline, RunReport};
pub use source::{read_events, SourceRecord};
pub use store::{EnrichmentStore, MergeOutcome};
