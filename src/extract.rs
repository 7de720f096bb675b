//! Entity reference extraction from edit events and enriched records.

use crate::entity::EnrichedEntity;
use crate::error::QidError;
use crate::event::EditEvent;
use crate::qid::Qid;

/// An entity id awaiting a freshness decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityReference {
    qid: Qid,
    hop: u8,
}

impl EntityReference {
    /// Reference taken directly from an edit event.
    pub fn direct(qid: Qid) -> Self {
        Self { qid, hop: 0 }
    }

    /// Reference discovered through another entity's type hierarchy.
    pub fn discovered(qid: Qid, hop: u8) -> Self {
        Self { qid, hop }
    }

    /// Referenced entity id.
    pub fn qid(&self) -> &Qid {
        &self.qid
    }

    /// Distance from the edit event that introduced the reference.
    pub fn hop(&self) -> u8 {
        self.hop
    }
}

/// Result of inspecting one edit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The event names a well-formed entity.
    Reference(EntityReference),
    /// The event carries no entity id at all.
    Missing,
    /// The event carries an id that is not well-formed.
    Malformed(QidError),
}

impl Extraction {
    /// The extracted reference, if any.
    pub fn into_reference(self) -> Option<EntityReference> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Missing | Self::Malformed(_) => None,
        }
    }
}

/// Extracts the event's entity reference. Pure and infallible; bad ids are reported, not raised.
pub fn extract_reference(event: &EditEvent) -> Extraction {
    match event.wikidata_id.as_deref() {
        None => Extraction::Missing,
        Some(raw) if raw.trim().is_empty() => Extraction::Missing,
        Some(raw) => match Qid::parse(raw) {
            Ok(qid) => Extraction::Reference(EntityReference::direct(qid)),
            Err(err) => Extraction::Malformed(err),
        },
    }
}

/// References to an entity's `instance_of` and `subclass_of` targets, one hop further out.
pub fn hierarchy_references(entity: &EnrichedEntity, parent_hop: u8) -> Vec<EntityReference> {
    let hop = parent_hop.saturating_add(1);
    entity
        .instance_of
        .iter()
        .chain(entity.subclass_of.iter())
        .filter(|target| **target != entity.qid)
        .map(|target| EntityReference::discovered(target.clone(), hop))
        .collect()
}
