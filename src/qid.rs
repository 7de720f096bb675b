//! Validated Wikidata entity identifiers.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::QidError;

/// Entity types served by `wbgetentities`: items, properties, and lexemes.
const ENTITY_PREFIXES: &[u8] = b"QPL";

/// A syntactically valid entity id: an entity-type letter followed by digits (`Q42`, `P31`, `L7`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Qid(String);

impl Qid {
    /// Parses and validates an entity id, trimming surrounding whitespace.
    pub fn parse(input: &str) -> Result<Self, QidError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QidError::Empty);
        }
        let bytes = trimmed.as_bytes();
        let digits = &bytes[1..];
        let well_formed = ENTITY_PREFIXES.contains(&bytes[0])
            && !digits.is_empty()
            && digits[0] != b'0'
            && digits.iter().all(u8::is_ascii_digit);
        if !well_formed {
            return Err(QidError::Malformed(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Qid {
    type Err = QidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Qid {
    type Error = QidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Qid> for String {
    fn from(value: Qid) -> Self {
        value.0
    }
}

impl AsRef<str> for Qid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Qid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_entity_type_followed_by_digits() {
        for input in ["Q42", "P31", "L7", " Q100 "] {
            let qid = Qid::parse(input).expect("valid id");
            assert_eq!(qid.as_str(), input.trim());
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(Qid::parse("   "), Err(QidError::Empty));
        for input in ["q42", "Q", "42", "Q04", "Q4x", "QQ1", "Q-1", "Ü1", "X5", "E1", "M12"] {
            assert!(
                matches!(Qid::parse(input), Err(QidError::Malformed(_))),
                "{input} should be malformed"
            );
        }
    }

    #[test]
    fn deserialization_validates() {
        let qid: Qid = serde_json::from_str("\"Q5\"").expect("valid json id");
        assert_eq!(qid.to_string(), "Q5");
        assert!(serde_json::from_str::<Qid>("\"not-an-id\"").is_err());
    }
}
