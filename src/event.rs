//! Wikipedia edit events as they arrive from the stream.

use serde::{Deserialize, Serialize};

/// One Wikipedia edit. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEditEvent")]
pub struct EditEvent {
    /// Page title.
    pub title: String,
    /// Source wiki identifier (e.g. `enwiki`).
    pub wiki: String,
    /// Entity id attached to the page, when the producer resolved one.
    pub wikidata_id: Option<String>,
    /// Producer-supplied `instance_of` hints, passed through untouched.
    pub instance_of: Option<Vec<String>>,
    /// Producer-supplied `subclass_of` hints, passed through untouched.
    pub subclass_of: Option<Vec<String>>,
    /// Editor user name.
    pub user: String,
    /// Edit summary.
    pub comment: String,
    /// Whether the edit was flagged as made by a bot.
    pub bot: bool,
    /// Whether the edit was flagged as minor.
    pub minor: bool,
    /// Host name of the wiki (e.g. `en.wikipedia.org`).
    pub server_name: String,
    /// Page length after the edit, in bytes.
    pub length_new: Option<i64>,
    /// Page length before the edit, in bytes.
    pub length_old: Option<i64>,
    /// Edit time in epoch seconds.
    pub timestamp: i64,
}

impl EditEvent {
    /// Edit time in epoch microseconds, the unit the downstream models use.
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.saturating_mul(1_000_000)
    }
}

// Accepts both the flattened ingestion schema and the raw recent-change payload, which nests
// lengths under `length`.
#[derive(Deserialize)]
struct RawEditEvent {
    #[serde(default)]
    title: String,
    #[serde(default)]
    wiki: String,
    #[serde(default)]
    wikidata_id: Option<String>,
    #[serde(default)]
    instance_of: Option<Vec<String>>,
    #[serde(default)]
    subclass_of: Option<Vec<String>>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    bot: bool,
    #[serde(default)]
    minor: bool,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    length_new: Option<i64>,
    #[serde(default)]
    length_old: Option<i64>,
    #[serde(default)]
    length: Option<RawLength>,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Deserialize)]
struct RawLength {
    #[serde(default)]
    new: Option<i64>,
    #[serde(default)]
    old: Option<i64>,
}

impl From<RawEditEvent> for EditEvent {
    fn from(raw: RawEditEvent) -> Self {
        let (nested_new, nested_old) = raw
            .length
            .map(|length| (length.new, length.old))
            .unwrap_or_default();
        Self {
            title: raw.title,
            wiki: raw.wiki,
            wikidata_id: raw.wikidata_id,
            instance_of: raw.instance_of,
            subclass_of: raw.subclass_of,
            user: raw.user,
            comment: raw.comment,
            bot: raw.bot,
            minor: raw.minor,
            server_name: raw.server_name,
            length_new: raw.length_new.or(nested_new),
            length_old: raw.length_old.or(nested_old),
            timestamp: raw.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_flat_ingestion_record() {
        let event: EditEvent = serde_json::from_str(
            r#"{"title":"Douglas Adams","wiki":"enwiki","wikidata_id":"Q42","user":"Alice",
                "comment":"typo","bot":false,"minor":true,"server_name":"en.wikipedia.org",
                "length_new":120,"length_old":118,"timestamp":1700000000}"#,
        )
        .expect("flat record");
        assert_eq!(event.wikidata_id.as_deref(), Some("Q42"));
        assert_eq!(event.length_new, Some(120));
        assert_eq!(event.length_old, Some(118));
        assert!(event.minor);
        assert_eq!(event.timestamp_micros(), 1_700_000_000_000_000);
    }

    #[test]
    fn parses_raw_recent_change_with_nested_length() {
        let event: EditEvent = serde_json::from_str(
            r#"{"type":"edit","title":"Cat","wiki":"enwiki","user":"Bot","bot":true,
                "length":{"old":10,"new":12},"timestamp":5, "meta":{"id":"abc"}}"#,
        )
        .expect("raw record");
        assert_eq!(event.wikidata_id, None);
        assert_eq!(event.length_new, Some(12));
        assert_eq!(event.length_old, Some(10));
        assert_eq!(event.comment, "");
        assert!(event.bot);
    }
}
