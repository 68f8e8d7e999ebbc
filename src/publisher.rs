//! Delegated-routing publisher.
//!
//! Signed IPNS records are PUT to `{base}/routing/v1/ipns/{name}` as raw
//! record bytes. The routing layer rate limits aggressively, so 429s honor
//! `Retry-After` and a run of nothing-but-429s is reported as rate limiting
//! rather than a generic failure (the operator remedy differs).

use std::{future::Future, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::PublishError;

const CONTENT_TYPE_IPNS_RECORD: &str = "application/vnd.ipfs.ipns-record";

/// Base delay for the exponential retry backoff.
const RETRY_BASE_SECS: u64 = 1;

/// Seam for the scheduler; the real implementation is [`RoutingPublisher`].
pub trait RecordPublisher {
    fn publish(
        &self,
        ipns_name: &str,
        signed_record_b64: &str,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Outcome of a single PUT attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    RateLimited { retry_after: Option<u64> },
    Failed { reason: String },
}

/// Delay before the retry following attempt `attempt` (0-based). A 429 with
/// `Retry-After` sleeps exactly that; everything else backs off `1s × 2ⁿ`.
fn retry_delay(outcome: &Attempt, attempt: usize) -> Duration {
    let backoff = RETRY_BASE_SECS.saturating_mul(1u64 << attempt.min(63) as u32);
    match outcome {
        Attempt::RateLimited {
            retry_after: Some(secs),
        } => Duration::from_secs(*secs),
        _ => Duration::from_secs(backoff),
    }
}

/// Collapse the attempt history into the surfaced error: only-429s means the
/// record never got a real verdict, which is `RateLimited`.
fn final_error(attempts: Vec<Attempt>) -> PublishError {
    let total = attempts.len();
    if attempts
        .iter()
        .all(|a| matches!(a, Attempt::RateLimited { .. }))
    {
        return PublishError::RateLimited { attempts: total };
    }
    let last = attempts
        .into_iter()
        .last()
        .map(|a| match a {
            Attempt::RateLimited { .. } => "HTTP 429".to_string(),
            Attempt::Failed { reason } => reason,
        })
        .unwrap_or_else(|| "no attempts made".to_string());
    PublishError::Failed {
        attempts: total,
        last_error: last,
    }
}

#[derive(Debug, Clone)]
pub struct RoutingPublisher {
    base_url: String,
    max_attempts: usize,
    http: reqwest::Client,
}

impl RoutingPublisher {
    pub fn new(
        base_url: &str,
        max_attempts: usize,
        request_timeout: Duration,
    ) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PublishError::Failed {
                attempts: 0,
                last_error: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            max_attempts: max_attempts.max(1),
            http,
        })
    }

    fn record_url(&self, ipns_name: &str) -> String {
        format!("{}/routing/v1/ipns/{}", self.base_url, ipns_name)
    }

    async fn put_once(&self, url: &str, record: Vec<u8>) -> Result<(), Attempt> {
        let resp = match self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_IPNS_RECORD)
            .body(record)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                return Err(Attempt::Failed {
                    reason: err.to_string(),
                })
            }
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(Attempt::RateLimited { retry_after });
        }
        Err(Attempt::Failed {
            reason: format!("HTTP {} from routing endpoint", status.as_u16()),
        })
    }
}

impl RecordPublisher for RoutingPublisher {
    async fn publish(&self, ipns_name: &str, signed_record_b64: &str) -> Result<(), PublishError> {
        let record = BASE64
            .decode(signed_record_b64)
            .map_err(|e| PublishError::BadRecord(e.to_string()))?;
        let url = self.record_url(ipns_name);

        let mut attempts: Vec<Attempt> = Vec::with_capacity(self.max_attempts);
        for attempt in 0..self.max_attempts {
            match self.put_once(&url, record.clone()).await {
                Ok(()) => return Ok(()),
                Err(outcome) => {
                    let last_attempt = attempt + 1 == self.max_attempts;
                    if !last_attempt {
                        let delay = retry_delay(&outcome, attempt);
                        tracing::debug!(
                            ipns_name,
                            attempt = attempt + 1,
                            delay_s = delay.as_secs(),
                            outcome = ?outcome,
                            "publish attempt failed; retrying"
                        );
                        attempts.push(outcome);
                        tokio::time::sleep(delay).await;
                    } else {
                        attempts.push(outcome);
                    }
                }
            }
        }
        Err(final_error(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limited(retry_after: Option<u64>) -> Attempt {
        Attempt::RateLimited { retry_after }
    }

    fn failed(reason: &str) -> Attempt {
        Attempt::Failed {
            reason: reason.into(),
        }
    }

    #[test]
    fn all_429s_surface_as_rate_limited() {
        let err = final_error(vec![rate_limited(None), rate_limited(Some(2)), rate_limited(None)]);
        assert!(matches!(err, PublishError::RateLimited { attempts: 3 }));
    }

    #[test]
    fn mixed_failures_surface_the_last_error() {
        let err = final_error(vec![
            rate_limited(None),
            failed("HTTP 500 from routing endpoint"),
        ]);
        match err {
            PublishError::Failed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("HTTP 500"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn trailing_429_still_reports_the_real_failure_kind() {
        // A 500 anywhere in the run means this was not pure rate limiting.
        let err = final_error(vec![failed("connection reset"), rate_limited(None)]);
        assert!(matches!(err, PublishError::Failed { .. }));
    }

    #[test]
    fn retry_after_takes_precedence_over_backoff() {
        assert_eq!(
            retry_delay(&rate_limited(Some(7)), 0),
            Duration::from_secs(7)
        );
        assert_eq!(retry_delay(&rate_limited(None), 0), Duration::from_secs(1));
        assert_eq!(retry_delay(&rate_limited(None), 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&failed("x"), 2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn rejects_records_that_are_not_base64() {
        let publisher =
            RoutingPublisher::new("https://delegated-ipfs.dev", 3, Duration::from_secs(30))
                .unwrap();
        let err = publisher
            .publish("k51example", "not base64!!!")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::BadRecord(_)));
    }

    #[test]
    fn record_urls_join_cleanly() {
        let publisher =
            RoutingPublisher::new("https://delegated-ipfs.dev/", 3, Duration::from_secs(30))
                .unwrap();
        assert_eq!(
            publisher.record_url("k51example"),
            "https://delegated-ipfs.dev/routing/v1/ipns/k51example"
        );
    }
}
