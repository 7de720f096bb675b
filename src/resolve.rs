//! Title to entity-id resolution through the wiki's `pageprops`.
//!
//! Recent-change events name pages, not entities. [`resolve_titles`] sits between the source and
//! the coordinator and fills `wikidata_id` for events that arrive without one, so
//! [`extract_reference`](crate::extract::extract_reference) stays a pure function of the event.
//! Titles are batched per wiki into `action=query&prop=pageprops` lookups that pass through their
//! own [`RateLimiter`] and the shared retry driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::client::wikidata::{check_status, classify_api_error, retry_after, USER_AGENT};
use crate::error::FetchError;
use crate::event::EditEvent;
use crate::limiter::RateLimiter;
use crate::retry::{retry, RetryPolicy};
use crate::source::{EventStream, SourceRecord};

/// Largest `titles=` list the action API accepts for anonymous clients.
pub const MAX_TITLES_PER_REQUEST: usize = 50;

/// Looks up the entity ids attached to wiki pages.
pub struct TitleResolver {
    client: Client,
    endpoint: Option<Url>,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl TitleResolver {
    /// Builds a resolver. With `endpoint` set every lookup goes there; otherwise the endpoint is
    /// derived from each event's wiki.
    pub fn new(
        timeout: Duration,
        endpoint: Option<Url>,
        limiter: RateLimiter,
        policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            limiter,
            policy,
        })
    }

    /// Action API endpoint answering for the wiki `event` came from.
    pub fn endpoint_for(&self, event: &EditEvent) -> Option<Url> {
        match &self.endpoint {
            Some(endpoint) => Some(endpoint.clone()),
            None => page_props_endpoint(event),
        }
    }

    /// Fills `wikidata_id` on events that lack one. Returns how many were resolved.
    ///
    /// Lookup failures are logged and leave the affected events untouched, so they count as
    /// skipped downstream instead of stopping the stream.
    pub async fn resolve(&self, mut events: Vec<&mut EditEvent>) -> usize {
        let mut groups: HashMap<Url, Vec<usize>> = HashMap::new();
        for (index, event) in events.iter().enumerate() {
            if !needs_resolution(event) {
                continue;
            }
            match self.endpoint_for(event) {
                Some(endpoint) => groups.entry(endpoint).or_default().push(index),
                None => tracing::debug!(wiki = %event.wiki, title = %event.title, "no page-props endpoint"),
            }
        }

        let mut resolved = 0;
        for (endpoint, indices) in groups {
            let mut seen = HashSet::new();
            let titles: Vec<String> = indices
                .iter()
                .map(|&index| events[index].title.clone())
                .filter(|title| seen.insert(title.clone()))
                .collect();
            let mut ids = HashMap::new();
            for chunk in titles.chunks(MAX_TITLES_PER_REQUEST) {
                match self.lookup_with_retry(&endpoint, chunk).await {
                    Ok(found) => ids.extend(found),
                    Err(err) => tracing::warn!(
                        %endpoint,
                        titles = chunk.len(),
                        error = %err,
                        "title lookup failed; events stay unresolved"
                    ),
                }
            }
            for index in indices {
                if let Some(qid) = ids.get(&events[index].title) {
                    events[index].wikidata_id = Some(qid.clone());
                    resolved += 1;
                }
            }
        }
        resolved
    }

    async fn lookup_with_retry(
        &self,
        endpoint: &Url,
        titles: &[String],
    ) -> Result<HashMap<String, String>, FetchError> {
        let limiter = &self.limiter;
        let resolver = self;
        retry(&self.policy, move |_| async move {
            limiter.acquire().await;
            resolver.lookup(endpoint, titles).await
        })
        .await
        .result
    }

    /// One `pageprops` request. Maps each requested title to its entity id; titles without a page
    /// or without an attached entity are absent.
    pub async fn lookup(
        &self,
        endpoint: &Url,
        titles: &[String],
    ) -> Result<HashMap<String, String>, FetchError> {
        let joined = titles.join("|");
        let response = self
            .client
            .get(endpoint.clone())
            .query(&[
                ("action", "query"),
                ("prop", "pageprops"),
                ("ppprop", "wikibase_item"),
                ("redirects", "1"),
                ("titles", joined.as_str()),
                ("format", "json"),
                ("formatversion", "2"),
            ])
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        check_status(status, retry_after)?;
        let body: PagePropsResponse = response.json().await.map_err(FetchError::from_reqwest)?;
        if let Some(error) = body.error {
            return Err(classify_api_error(&error.code, &error.info, retry_after));
        }
        Ok(body
            .query
            .map(|query| match_titles(titles, query))
            .unwrap_or_default())
    }
}

/// Wraps `events` so every edit event without an entity id is resolved by title first.
///
/// Records already buffered by the source are looked up together, at most
/// [`MAX_TITLES_PER_REQUEST`] per chunk. Order is preserved and stream errors pass through.
pub fn resolve_titles(events: EventStream, resolver: Arc<TitleResolver>) -> EventStream {
    events
        .ready_chunks(MAX_TITLES_PER_REQUEST)
        .then(move |mut chunk| {
            let resolver = Arc::clone(&resolver);
            async move {
                let unresolved: Vec<&mut EditEvent> = chunk
                    .iter_mut()
                    .filter_map(|record| match record {
                        Ok(SourceRecord::Event(event)) => Some(event),
                        _ => None,
                    })
                    .collect();
                let resolved = resolver.resolve(unresolved).await;
                if resolved > 0 {
                    tracing::debug!(resolved, records = chunk.len(), "resolved page titles");
                }
                stream::iter(chunk)
            }
        })
        .flatten()
        .boxed()
}

/// `https://<server_name>/w/api.php`, falling back to `<lang>.wikipedia.org` for `<lang>wiki`.
pub fn page_props_endpoint(event: &EditEvent) -> Option<Url> {
    let host = if event.server_name.trim().is_empty() {
        let language = event.wiki.strip_suffix("wiki").filter(|lang| !lang.is_empty())?;
        format!("{}.wikipedia.org", language.replace('_', "-"))
    } else {
        event.server_name.trim().to_string()
    };
    Url::parse(&format!("https://{host}/w/api.php")).ok()
}

fn needs_resolution(event: &EditEvent) -> bool {
    let missing = event
        .wikidata_id
        .as_deref()
        .map_or(true, |id| id.trim().is_empty());
    missing && !event.title.trim().is_empty()
}

// Follows `normalized` then `redirects` from each requested title to the page that answered.
fn match_titles(requested: &[String], query: PagePropsQuery) -> HashMap<String, String> {
    let normalized: HashMap<String, String> = query
        .normalized
        .into_iter()
        .map(|mapping| (mapping.from, mapping.to))
        .collect();
    let redirects: HashMap<String, String> = query
        .redirects
        .into_iter()
        .map(|mapping| (mapping.from, mapping.to))
        .collect();
    let items: HashMap<String, String> = query
        .pages
        .into_iter()
        .filter_map(|page| Some((page.title, page.pageprops?.wikibase_item?)))
        .collect();
    requested
        .iter()
        .filter_map(|title| {
            let canonical = normalized.get(title).unwrap_or(title);
            let target = redirects.get(canonical).unwrap_or(canonical);
            items.get(target).map(|qid| (title.clone(), qid.clone()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct PagePropsResponse {
    #[serde(default)]
    query: Option<PagePropsQuery>,
    #[serde(default)]
    error: Option<PagePropsError>,
}

#[derive(Debug, Deserialize)]
struct PagePropsError {
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Default, Deserialize)]
struct PagePropsQuery {
    #[serde(default)]
    normalized: Vec<TitleMapping>,
    #[serde(default)]
    redirects: Vec<TitleMapping>,
    #[serde(default)]
    pages: Vec<RawPage>,
}

#[derive(Debug, Deserialize)]
struct TitleMapping {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    title: String,
    #[serde(default)]
    pageprops: Option<RawPageProps>,
}

#[derive(Debug, Deserialize)]
struct RawPageProps {
    #[serde(default)]
    wikibase_item: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(fields: serde_json::Value) -> EditEvent {
        serde_json::from_value(fields).expect("event")
    }

    #[test]
    fn endpoint_follows_the_event_wiki() {
        let from_host = event(serde_json::json!({
            "title": "Douglas Adams", "wiki": "enwiki", "server_name": "en.wikipedia.org"
        }));
        assert_eq!(
            page_props_endpoint(&from_host).map(String::from),
            Some("https://en.wikipedia.org/w/api.php".to_string())
        );
        let from_wiki = event(serde_json::json!({"title": "Berlin", "wiki": "zh_min_nanwiki"}));
        assert_eq!(
            page_props_endpoint(&from_wiki).map(String::from),
            Some("https://zh-min-nan.wikipedia.org/w/api.php".to_string())
        );
        assert_eq!(page_props_endpoint(&event(serde_json::json!({"title": "x"}))), None);
    }

    #[test]
    fn only_titled_events_without_ids_need_resolution() {
        assert!(needs_resolution(&event(serde_json::json!({"title": "Berlin"}))));
        assert!(needs_resolution(&event(serde_json::json!({"title": "Berlin", "wikidata_id": " "}))));
        assert!(!needs_resolution(&event(serde_json::json!({"title": "Berlin", "wikidata_id": "Q64"}))));
        assert!(!needs_resolution(&event(serde_json::json!({"title": ""}))));
    }

    #[test]
    fn titles_follow_normalization_and_redirects() {
        let query: PagePropsQuery = serde_json::from_value(serde_json::json!({
            "normalized": [{"fromencoded": false, "from": "douglas adams", "to": "Douglas adams"}],
            "redirects": [{"from": "Douglas adams", "to": "Douglas Adams"}],
            "pages": [
                {"pageid": 8091, "ns": 0, "title": "Douglas Adams",
                 "pageprops": {"wikibase_item": "Q42"}},
                {"pageid": 1, "ns": 0, "title": "Sandbox", "pageprops": {}},
                {"ns": 0, "title": "Nowhere", "missing": true}
            ]
        }))
        .expect("query");
        let requested = ["douglas adams", "Douglas Adams", "Sandbox", "Nowhere"]
            .map(String::from)
            .to_vec();

        let ids = match_titles(&requested, query);

        assert_eq!(ids.len(), 2);
        assert_eq!(ids["douglas adams"], "Q42");
        assert_eq!(ids["Douglas Adams"], "Q42");
    }
}
