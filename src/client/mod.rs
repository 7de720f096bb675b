//! Batched, rate-limited enrichment client.
//!
//! [`EntityApi`] is a single request against the knowledge base; [`EnrichmentClient`] adds the
//! rate limiter, retry policy, and per-qid outcome accounting on top of it.

pub mod wikidata;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};

use crate::entity::{EntityAttributes, Timestamp};
use crate::error::FetchError;
use crate::limiter::RateLimiter;
use crate::qid::Qid;
use crate::retry::{retry, FailureKind, RetryPolicy};

/// Typed payload for one entity as returned by the API. Absent fields stay `None`/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPayload {
    /// Label, when the entity has one in the requested language.
    pub label: Option<String>,
    /// Description, when the entity has one in the requested language.
    pub description: Option<String>,
    /// `instance of` targets in claim order.
    pub instance_of: Vec<Qid>,
    /// `subclass of` targets in claim order.
    pub subclass_of: Vec<Qid>,
}

impl EntityPayload {
    /// Converts into cache attributes, recording absent text as empty.
    pub fn into_attributes(self) -> EntityAttributes {
        EntityAttributes {
            label: self.label.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            instance_of: self.instance_of,
            subclass_of: self.subclass_of,
        }
    }
}

/// One request for a batch of entities. Entities the API does not return are simply absent.
#[async_trait]
pub trait EntityApi: Send + Sync {
    /// Fetches payloads for `qids` in a single request.
    async fn get_entities(&self, qids: &[Qid]) -> Result<HashMap<Qid, EntityPayload>, FetchError>;
}

#[async_trait]
impl<T: EntityApi + ?Sized> EntityApi for std::sync::Arc<T> {
    async fn get_entities(&self, qids: &[Qid]) -> Result<HashMap<Qid, EntityPayload>, FetchError> {
        (**self).get_entities(qids).await
    }
}

/// Attributes for one qid and when they were fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Parsed attributes.
    pub attributes: EntityAttributes,
    /// Response time used as the merge timestamp.
    pub fetched_at: Timestamp,
}

/// Why a qid in a batch produced no attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The request succeeded but the qid was absent or marked missing.
    Missing,
    /// Transient failures persisted through every allowed attempt.
    Exhausted {
        /// Kind of the last failure.
        kind: FailureKind,
        /// Attempts made.
        attempts: u32,
        /// Detail of the last failure.
        message: String,
    },
    /// The API rejected the request permanently.
    Rejected {
        /// Kind of the failure.
        kind: FailureKind,
        /// Failure detail.
        message: String,
    },
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("entity missing from response"),
            Self::Exhausted {
                kind,
                attempts,
                message,
            } => write!(f, "{kind} failure after {attempts} attempts: {message}"),
            Self::Rejected { kind, message } => write!(f, "{kind} failure: {message}"),
        }
    }
}

/// Per-qid results for one batch, in input order. Every input qid appears exactly once.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Outcome for each requested qid.
    pub outcomes: Vec<(Qid, Result<Fetched, FetchFailure>)>,
    /// Requests issued for the batch, retries included.
    pub attempts: u32,
}

impl BatchOutcome {
    /// Looks up the outcome for `qid`.
    pub fn get(&self, qid: &Qid) -> Option<&Result<Fetched, FetchFailure>> {
        self.outcomes
            .iter()
            .find(|(candidate, _)| candidate == qid)
            .map(|(_, outcome)| outcome)
    }

    /// Number of qids with attributes.
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| outcome.is_ok()).count()
    }

    /// Number of qids without attributes.
    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }
}

/// Applies rate limiting and retries to an [`EntityApi`].
pub struct EnrichmentClient<A> {
    api: A,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl<A: EntityApi> EnrichmentClient<A> {
    /// Wraps `api` with the given limiter and retry policy.
    pub fn new(api: A, limiter: RateLimiter, policy: RetryPolicy) -> Self {
        Self {
            api,
            limiter,
            policy,
        }
    }

    /// Underlying transport.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetches a batch, never dropping a qid from the outcome.
    pub async fn fetch_batch(&self, qids: &[Qid]) -> BatchOutcome {
        let mut outcomes = Vec::with_capacity(qids.len());
        let attempts = self.fetch_group(qids, &mut outcomes).await;
        BatchOutcome { outcomes, attempts }
    }

    // A rejected multi-qid request is bisected so an id the API refuses only fails itself.
    fn fetch_group<'a>(
        &'a self,
        qids: &'a [Qid],
        outcomes: &'a mut Vec<(Qid, Result<Fetched, FetchFailure>)>,
    ) -> BoxFuture<'a, u32> {
        async move {
            if qids.is_empty() {
                return 0;
            }
            let limiter = &self.limiter;
            let api = &self.api;
            let attempted = retry(&self.policy, move |_| async move {
                limiter.acquire().await;
                let payloads = api.get_entities(qids).await?;
                Ok::<_, FetchError>((payloads, Utc::now()))
            })
            .await;
            let attempts = attempted.attempts;
            match attempted.result {
                Ok((mut payloads, fetched_at)) => {
                    outcomes.extend(qids.iter().map(|qid| {
                        let outcome = payloads
                            .remove(qid)
                            .map(|payload| Fetched {
                                attributes: payload.into_attributes(),
                                fetched_at,
                            })
                            .ok_or(FetchFailure::Missing);
                        (qid.clone(), outcome)
                    }));
                    attempts
                }
                Err(err) if err.kind() == FailureKind::Client && qids.len() > 1 => {
                    tracing::debug!(batch = qids.len(), error = %err, "batch rejected; splitting");
                    let (left, right) = qids.split_at(qids.len() / 2);
                    let left_attempts = self.fetch_group(left, outcomes).await;
                    let right_attempts = self.fetch_group(right, outcomes).await;
                    attempts + left_attempts + right_attempts
                }
                Err(err) => {
                    let failure = if err.kind().is_transient() {
                        FetchFailure::Exhausted {
                            kind: err.kind(),
                            attempts,
                            message: err.message().to_string(),
                        }
                    } else {
                        FetchFailure::Rejected {
                            kind: err.kind(),
                            message: err.message().to_string(),
                        }
                    };
                    tracing::warn!(batch = qids.len(), attempts, %failure, "batch fetch failed");
                    outcomes.extend(qids.iter().map(|qid| (qid.clone(), Err(failure.clone()))));
                    attempts
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    fn qid(raw: &str) -> Qid {
        Qid::parse(raw).expect("test qid")
    }

    /// Replays scripted responses and records every request.
    struct ScriptedApi {
        script: Mutex<VecDeque<Result<Vec<&'static str>, FetchError>>>,
        requests: Mutex<Vec<Vec<Qid>>>,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<Vec<&'static str>, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EntityApi for ScriptedApi {
        async fn get_entities(
            &self,
            qids: &[Qid],
        ) -> Result<HashMap<Qid, EntityPayload>, FetchError> {
            self.requests.lock().unwrap().push(qids.to_vec());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted response");
            next.map(|present| {
                present
                    .into_iter()
                    .map(|raw| {
                        let payload = EntityPayload {
                            label: Some(format!("label {raw}")),
                            ..EntityPayload::default()
                        };
                        (qid(raw), payload)
                    })
                    .collect()
            })
        }
    }

    fn client(api: ScriptedApi) -> EnrichmentClient<ScriptedApi> {
        EnrichmentClient::new(
            api,
            RateLimiter::new(100, Duration::from_secs(1)),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn partial_response_marks_missing_qids_failed() {
        let client = client(ScriptedApi::new(vec![Ok(vec!["Q1", "Q4"])]));
        let batch: Vec<_> = ["Q1", "Q2", "Q3", "Q4", "Q5"].map(qid).to_vec();
        let outcome = client.fetch_batch(&batch).await;

        assert_eq!(outcome.outcomes.len(), 5);
        assert_eq!(outcome.successes(), 2);
        assert_eq!(outcome.failures(), 3);
        assert_eq!(outcome.get(&qid("Q2")), Some(&Err(FetchFailure::Missing)));
        let fetched = outcome.get(&qid("Q4")).unwrap().as_ref().unwrap();
        assert_eq!(fetched.attributes.label, "label Q4");
        assert_eq!(fetched.attributes.description, "");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let client = client(ScriptedApi::new(vec![
            Err(FetchError::new(FailureKind::Server, "502")),
            Ok(vec!["Q1"]),
        ]));
        let outcome = client.fetch_batch(&[qid("Q1")]).await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.successes(), 1);
        assert_eq!(client.api().requests.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_every_qid() {
        let client = client(ScriptedApi::new(vec![
            Err(FetchError::rate_limited("429", None)),
            Err(FetchError::new(FailureKind::Network, "reset")),
            Err(FetchError::new(FailureKind::Server, "503")),
        ]));
        let outcome = client.fetch_batch(&[qid("Q1"), qid("Q2")]).await;
        assert_eq!(outcome.attempts, 3);
        for (_, result) in &outcome.outcomes {
            assert!(matches!(
                result,
                Err(FetchFailure::Exhausted {
                    kind: FailureKind::Server,
                    attempts: 3,
                    ..
                })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let client = client(ScriptedApi::new(vec![Err(FetchError::new(
            FailureKind::Client,
            "400 bad ids",
        ))]));
        let outcome = client.fetch_batch(&[qid("Q1")]).await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.get(&qid("Q1")),
            Some(Err(FetchFailure::Rejected { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_split_until_the_refused_id_stands_alone() {
        let rejected = || Err(FetchError::new(FailureKind::Client, "no-such-entity: Q3"));
        let client = client(ScriptedApi::new(vec![
            rejected(),
            Ok(vec!["Q1", "Q2"]),
            rejected(),
            rejected(),
            Ok(vec!["Q4", "Q5"]),
        ]));
        let batch: Vec<_> = ["Q1", "Q2", "Q3", "Q4", "Q5"].map(qid).to_vec();
        let outcome = client.fetch_batch(&batch).await;

        let order: Vec<_> = outcome.outcomes.iter().map(|(qid, _)| qid.clone()).collect();
        assert_eq!(order, batch);
        assert_eq!(outcome.successes(), 4);
        assert!(matches!(
            outcome.get(&qid("Q3")),
            Some(Err(FetchFailure::Rejected {
                kind: FailureKind::Client,
                ..
            }))
        ));
        assert_eq!(outcome.attempts, 5);
        let requests = client.api().requests.lock().unwrap().clone();
        assert_eq!(requests[1], vec![qid("Q1"), qid("Q2")]);
        assert_eq!(requests[2], vec![qid("Q3"), qid("Q4"), qid("Q5")]);
        assert_eq!(requests[3], vec![qid("Q3")]);
        assert_eq!(requests[4], vec![qid("Q4"), qid("Q5")]);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_batch_is_not_split() {
        let client = client(ScriptedApi::new(vec![Err(FetchError::new(
            FailureKind::Decode,
            "expected value",
        ))]));
        let outcome = client.fetch_batch(&[qid("Q1"), qid("Q2")]).await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_passes_the_rate_limiter() {
        let api = ScriptedApi::new(vec![Ok(vec!["Q1"]), Ok(vec!["Q2"]), Ok(vec!["Q3"])]);
        let client = EnrichmentClient::new(
            api,
            RateLimiter::new(1, Duration::from_secs(1)),
            RetryPolicy::default(),
        );
        let start = tokio::time::Instant::now();
        for raw in ["Q1", "Q2", "Q3"] {
            client.fetch_batch(&[qid(raw)]).await;
        }
        assert!(tokio::time::Instant::now().duration_since(start) >= Duration::from_secs(2));
    }
}
