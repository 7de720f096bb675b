//! Enriched entity records persisted in the cache and read by downstream models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::qid::Qid;

/// Wall-clock instant used for fetch and lifecycle timestamps.
pub type Timestamp = DateTime<Utc>;

/// Attribute set returned by one successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAttributes {
    /// Label in the configured language, empty when the entity has none.
    pub label: String,
    /// Description in the configured language, empty when the entity has none.
    pub description: String,
    /// Targets of `instance of` claims in claim order.
    pub instance_of: Vec<Qid>,
    /// Targets of `subclass of` claims in claim order.
    pub subclass_of: Vec<Qid>,
}

/// Cached entity with its lifecycle timestamps. Field names are the downstream schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedEntity {
    /// Identity key.
    pub qid: Qid,
    /// Entity label.
    pub label: String,
    /// Entity description.
    pub description: String,
    /// `instance of` targets.
    pub instance_of: Vec<Qid>,
    /// `subclass of` targets.
    pub subclass_of: Vec<Qid>,
    /// Fetch time of the first committed merge; never changes afterwards.
    pub first_seen_ingestion: Timestamp,
    /// Fetch time of the most recent committed merge.
    pub last_updated: Timestamp,
}

impl EnrichedEntity {
    /// Creates a record from its first successful fetch.
    pub fn first_fetch(qid: Qid, attributes: EntityAttributes, fetched_at: Timestamp) -> Self {
        let EntityAttributes {
            label,
            description,
            instance_of,
            subclass_of,
        } = attributes;
        Self {
            qid,
            label,
            description,
            instance_of,
            subclass_of,
            first_seen_ingestion: fetched_at,
            last_updated: fetched_at,
        }
    }

    /// Replaces every attribute at once and advances `last_updated`.
    pub(crate) fn refresh(&mut self, attributes: EntityAttributes, fetched_at: Timestamp) {
        self.label = attributes.label;
        self.description = attributes.description;
        self.instance_of = attributes.instance_of;
        self.subclass_of = attributes.subclass_of;
        self.last_updated = fetched_at;
    }

    /// Copies the attribute portion out of the record.
    pub fn attributes(&self) -> EntityAttributes {
        EntityAttributes {
            label: self.label.clone(),
            description: self.description.clone(),
            instance_of: self.instance_of.clone(),
            subclass_of: self.subclass_of.clone(),
        }
    }
}

/// Conceptual per-entity state as seen by the frontier.
///
/// `unseen -> pending-fetch -> fetched -> stale -> pending-fetch`. A failed fetch returns the
/// entity to `Unseen`; failures are not remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// No cache record and no outstanding fetch.
    Unseen,
    /// Queued for, or waiting on, a fetch.
    PendingFetch,
    /// Cached and within the freshness policy.
    Fetched,
    /// Cached but older than the freshness policy allows.
    Stale,
}
