//! Per-document fetch with bounded retries.
//!
//! A transport error, a rendered error marker, or an extraction that comes
//! back without content all count as a failed attempt and are retried with
//! backoff. An adapter error is final: the document will not parse no matter
//! how often it is fetched. A browser session error propagates and ends the
//! run.

use advstage_adapters::{find_error_marker, AdapterError, VendorAdapter};
use advstage_core::{CandidateIdentity, FetchClassification, FetchOutcome, StructuredRecord};
use advstage_storage::{FetchError, PageFetcher, RetryPolicy};
use tracing::{debug, warn};

#[derive(Debug)]
pub enum DocumentOutcome {
    /// Extracted record, already merged over the discovery metadata.
    Extracted {
        record: StructuredRecord,
        attempts: u32,
    },
    ExtractFailed {
        error: AdapterError,
        attempts: u32,
    },
    FetchFailed(FetchOutcome),
}

enum Verdict<T> {
    Accept(T),
    Retry(FetchClassification),
}

enum Attempted<T> {
    Accepted { value: T, attempts: u32 },
    Exhausted { classification: FetchClassification, attempts: u32 },
}

pub struct FetchExecutor<'a> {
    adapter: &'a dyn VendorAdapter,
    fetcher: &'a dyn PageFetcher,
    retry: RetryPolicy,
}

impl<'a> FetchExecutor<'a> {
    pub fn new(adapter: &'a dyn VendorAdapter, fetcher: &'a dyn PageFetcher, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            fetcher,
            retry,
        }
    }

    /// Raw content only. Exhausted attempts come back as a failed outcome.
    pub async fn fetch(&self, identity: &CandidateIdentity) -> Result<FetchOutcome, FetchError> {
        let attempted = self.attempt_loop(identity, Verdict::Accept).await?;
        Ok(match attempted {
            Attempted::Accepted { value, attempts } => FetchOutcome {
                identity: identity.clone(),
                content: Some(value),
                classification: FetchClassification::Success,
                attempts,
            },
            Attempted::Exhausted {
                classification,
                attempts,
            } => FetchOutcome {
                identity: identity.clone(),
                content: None,
                classification,
                attempts,
            },
        })
    }

    pub async fn fetch_and_extract(
        &self,
        identity: &CandidateIdentity,
    ) -> Result<DocumentOutcome, FetchError> {
        let adapter = self.adapter;
        let attempted = self
            .attempt_loop(identity, |body| match adapter.extract(&body, identity) {
                Ok(record) if record.has_content() => Verdict::Accept(Ok(record)),
                Ok(_) => Verdict::Retry(FetchClassification::ContentAnomaly {
                    message: "extraction produced no content".to_string(),
                }),
                Err(err) => Verdict::Accept(Err(err)),
            })
            .await?;

        Ok(match attempted {
            Attempted::Accepted {
                value: Ok(record),
                attempts,
            } => DocumentOutcome::Extracted {
                record: record.merged_over(&identity.metadata),
                attempts,
            },
            Attempted::Accepted {
                value: Err(error),
                attempts,
            } => {
                warn!(url = identity.url.as_str(), error = %error, "extraction failed");
                DocumentOutcome::ExtractFailed { error, attempts }
            }
            Attempted::Exhausted {
                classification,
                attempts,
            } => DocumentOutcome::FetchFailed(FetchOutcome {
                identity: identity.clone(),
                content: None,
                classification,
                attempts,
            }),
        })
    }

    async fn attempt_loop<T, F>(
        &self,
        identity: &CandidateIdentity,
        mut accept: F,
    ) -> Result<Attempted<T>, FetchError>
    where
        F: FnMut(String) -> Verdict<T>,
    {
        let target = identity.fetch_target();
        let max_attempts = self.retry.max_attempts();
        let mut classification = FetchClassification::Transport {
            message: "not attempted".to_string(),
        };

        for attempt in 1..=max_attempts {
            classification = match self.fetcher.fetch_page(target).await {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => FetchClassification::Transport {
                    message: err.to_string(),
                },
                Ok(body) => match find_error_marker(self.adapter, &body) {
                    Some(marker) => FetchClassification::ContentAnomaly {
                        message: format!("page rendered error marker `{marker}`"),
                    },
                    None => match accept(body) {
                        Verdict::Accept(value) => {
                            debug!(url = target, attempt, "document fetched");
                            return Ok(Attempted::Accepted { value, attempts: attempt });
                        }
                        Verdict::Retry(classification) => classification,
                    },
                },
            };

            warn!(
                url = target,
                attempt,
                max_attempts,
                failure = ?classification,
                "fetch attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }
        }

        Ok(Attempted::Exhausted {
            classification,
            attempts: max_attempts,
        })
    }
}
