//! `wbgetentities` transport for the Wikidata action API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{EntityApi, EntityPayload};
use crate::error::FetchError;
use crate::qid::Qid;
use crate::retry::FailureKind;

/// Public Wikidata action API endpoint.
pub const WIKIDATA_API: &str = "https://www.wikidata.org/w/api.php";
/// Largest id list `wbgetentities` accepts for anonymous clients.
pub const MAX_IDS_PER_REQUEST: usize = 50;

pub(crate) const USER_AGENT: &str = concat!("wikienrich/", env!("CARGO_PKG_VERSION"));
const INSTANCE_OF: &str = "P31";
const SUBCLASS_OF: &str = "P279";

/// Fetches labels, descriptions, and type claims for batches of entities.
#[derive(Clone)]
pub struct WikidataApi {
    client: Client,
    endpoint: Url,
    language: String,
}

impl WikidataApi {
    /// Builds a client for `endpoint`, sending `token` as a bearer credential when present.
    pub fn new(
        endpoint: Url,
        language: impl Into<String>,
        timeout: Duration,
        token: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            } else {
                tracing::warn!("ignoring API token that is not a valid header value");
            }
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            language: language.into(),
        })
    }

    /// Language used for labels and descriptions.
    pub fn language(&self) -> &str {
        &self.language
    }
}

#[async_trait]
impl EntityApi for WikidataApi {
    async fn get_entities(&self, qids: &[Qid]) -> Result<HashMap<Qid, EntityPayload>, FetchError> {
        let ids = qids.iter().map(Qid::as_str).collect::<Vec<_>>().join("|");
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("action", "wbgetentities"),
                ("ids", ids.as_str()),
                ("props", "labels|descriptions|claims"),
                ("languages", self.language.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        check_status(status, retry_after)?;
        let body: GetEntitiesResponse = response.json().await.map_err(FetchError::from_reqwest)?;
        if let Some(error) = body.error {
            return Err(classify_api_error(&error.code, &error.info, retry_after));
        }
        Ok(parse_entities(body.entities, &self.language))
    }
}

/// Reads a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classifies a non-success HTTP status; 429 keeps the server's `Retry-After` hint.
pub(crate) fn check_status(
    status: StatusCode,
    retry_after: Option<Duration>,
) -> Result<(), FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::rate_limited(
            format!("status {status}"),
            retry_after,
        ));
    }
    if !status.is_success() {
        return Err(FetchError::new(
            FailureKind::from_status(status),
            format!("status {status}"),
        ));
    }
    Ok(())
}

/// Maps an action API `error.code`. Lag and throttling errors arrive with HTTP 200.
pub(crate) fn classify_api_error(
    code: &str,
    info: &str,
    retry_after: Option<Duration>,
) -> FetchError {
    let message = format!("{code}: {info}");
    match code {
        "maxlag" | "ratelimited" => FetchError::rate_limited(message, retry_after),
        _ => FetchError::new(FailureKind::Client, message),
    }
}

#[derive(Debug, Deserialize)]
struct GetEntitiesResponse {
    #[serde(default)]
    entities: HashMap<String, RawEntity>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(default)]
    missing: Option<serde_json::Value>,
    #[serde(default)]
    labels: HashMap<String, LanguageValue>,
    #[serde(default)]
    descriptions: HashMap<String, LanguageValue>,
    #[serde(default)]
    claims: HashMap<String, Vec<RawClaim>>,
}

#[derive(Debug, Deserialize)]
struct LanguageValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    #[serde(default)]
    mainsnak: Option<RawSnak>,
}

#[derive(Debug, Deserialize)]
struct RawSnak {
    #[serde(default)]
    datavalue: Option<RawDataValue>,
}

#[derive(Debug, Deserialize)]
struct RawDataValue {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
}

impl RawDataValue {
    fn entity_id(&self) -> Option<Qid> {
        if self.kind != "wikibase-entityid" {
            return None;
        }
        if let Some(id) = self.value.get("id").and_then(|id| id.as_str()) {
            return Qid::parse(id).ok();
        }
        let is_item = self
            .value
            .get("entity-type")
            .and_then(|kind| kind.as_str())
            .map_or(true, |kind| kind == "item");
        let numeric = self.value.get("numeric-id").and_then(|id| id.as_u64())?;
        if !is_item {
            return None;
        }
        Qid::parse(&format!("Q{numeric}")).ok()
    }
}

impl RawEntity {
    fn into_payload(mut self, language: &str) -> EntityPayload {
        EntityPayload {
            label: self.labels.remove(language).map(|label| label.value),
            description: self
                .descriptions
                .remove(language)
                .map(|description| description.value),
            instance_of: claim_targets(&self.claims, INSTANCE_OF),
            subclass_of: claim_targets(&self.claims, SUBCLASS_OF),
        }
    }
}

fn claim_targets(claims: &HashMap<String, Vec<RawClaim>>, property: &str) -> Vec<Qid> {
    claims
        .get(property)
        .into_iter()
        .flatten()
        .filter_map(|claim| claim.mainsnak.as_ref()?.datavalue.as_ref()?.entity_id())
        .collect()
}

fn parse_entities(entities: HashMap<String, RawEntity>, language: &str) -> HashMap<Qid, EntityPayload> {
    entities
        .into_iter()
        .filter(|(_, entity)| entity.missing.is_none())
        .filter_map(|(key, entity)| {
            let qid = Qid::parse(&key).ok()?;
            Some((qid, entity.into_payload(language)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
      "entities": {
        "Q42": {
          "type": "item", "id": "Q42",
          "labels": {"en": {"language": "en", "value": "Douglas Adams"}},
          "descriptions": {"en": {"language": "en", "value": "English writer and humorist"}},
          "claims": {
            "P31": [
              {"mainsnak": {"snaktype": "value", "property": "P31",
                "datavalue": {"value": {"entity-type": "item", "numeric-id": 5, "id": "Q5"},
                              "type": "wikibase-entityid"}}}
            ],
            "P569": [
              {"mainsnak": {"snaktype": "value", "datavalue": {"value": {"time": "+1952-03-11T00:00:00Z"}, "type": "time"}}}
            ]
          }
        },
        "Q5": {
          "id": "Q5",
          "labels": {"fr": {"language": "fr", "value": "être humain"}},
          "claims": {
            "P279": [
              {"mainsnak": {"snaktype": "value", "datavalue": {"value": {"entity-type": "item", "numeric-id": 154954}, "type": "wikibase-entityid"}}},
              {"mainsnak": {"snaktype": "novalue"}},
              {"mainsnak": {"snaktype": "value", "datavalue": {"value": {"id": "L1-S1"}, "type": "wikibase-entityid"}}},
              {"mainsnak": {"snaktype": "value", "datavalue": {"value": {"id": "Q215627"}, "type": "wikibase-entityid"}}}
            ]
          }
        },
        "Q999999999": {"id": "Q999999999", "missing": ""}
      },
      "success": 1
    }"#;

    fn qid(raw: &str) -> Qid {
        Qid::parse(raw).expect("test qid")
    }

    #[test]
    fn parses_labels_descriptions_and_type_claims() {
        let body: GetEntitiesResponse = serde_json::from_str(SAMPLE).expect("sample");
        let payloads = parse_entities(body.entities, "en");

        assert_eq!(payloads.len(), 2);
        assert_eq!(
            payloads[&qid("Q42")],
            EntityPayload {
                label: Some("Douglas Adams".into()),
                description: Some("English writer and humorist".into()),
                instance_of: vec![qid("Q5")],
                subclass_of: Vec::new(),
            }
        );
    }

    #[test]
    fn absent_language_and_odd_snaks_become_empty_fields() {
        let body: GetEntitiesResponse = serde_json::from_str(SAMPLE).expect("sample");
        let payloads = parse_entities(body.entities, "en");
        let human = &payloads[&qid("Q5")];
        assert_eq!(human.label, None);
        assert_eq!(human.description, None);
        assert!(human.instance_of.is_empty());
        assert_eq!(human.subclass_of, vec![qid("Q154954"), qid("Q215627")]);
    }

    #[test]
    fn missing_entities_are_absent() {
        let body: GetEntitiesResponse = serde_json::from_str(SAMPLE).expect("sample");
        let payloads = parse_entities(body.entities, "en");
        assert!(!payloads.contains_key(&qid("Q999999999")));
    }

    #[test]
    fn api_errors_deserialize() {
        let body: GetEntitiesResponse = serde_json::from_str(
            r#"{"error": {"code": "maxlag", "info": "Waiting for a database server"}}"#,
        )
        .expect("error body");
        assert!(body.entities.is_empty());
        assert_eq!(body.error.expect("error").code, "maxlag");
    }
}
