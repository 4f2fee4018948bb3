use anyhow::Result;
use engram_types::MemoryBatch;
use std::time::Duration;
use tracing::debug;

/// Phrases in a failure body that indicate throttling even without a 429.
const RATE_LIMIT_PHRASES: [&str; 3] = ["rate limit", "too many requests", "quota exceeded"];

/// Terminal classification of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 200/202: the sink accepted the batch.
    Accepted,
    /// 429 or rate-limit phrasing in the body: retry after escalating the
    /// run-global delay.
    RateLimited,
    /// 5xx: retry at the current delay.
    ServerError(String),
    /// Non-429 4xx: not retried; the batch and its file are marked failed.
    ClientError(String),
    /// Timeout or connection failure: retried up to the attempt budget.
    Transient(String),
}

/// Downstream knowledge store, consumed as an opaque HTTP sink. Trait seam so
/// the pipeline can be driven against a scripted sink in tests.
#[allow(async_fn_in_trait)]
pub trait MemorySink {
    async fn submit(&self, batch: &MemoryBatch) -> SubmitOutcome;
}

pub struct HttpSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

impl MemorySink for HttpSink {
    async fn submit(&self, batch: &MemoryBatch) -> SubmitOutcome {
        // A malformed payload would come back as a 4xx anyway; rejecting it
        // here keeps the wire clean and the failure reason precise.
        if let Err(e) = batch.validate() {
            return SubmitOutcome::ClientError(format!("payload rejected before dispatch: {e}"));
        }

        let res = match self.http.post(&self.endpoint).json(batch).send().await {
            Ok(res) => res,
            Err(e) if e.is_timeout() => return SubmitOutcome::Transient(format!("timeout: {e}")),
            Err(e) => return SubmitOutcome::Transient(e.to_string()),
        };

        let status = res.status();
        debug!(status = status.as_u16(), group = %batch.group_id, "sink responded");

        if status.is_success() {
            return SubmitOutcome::Accepted;
        }

        let body = res.text().await.unwrap_or_default();
        classify_failure(status.as_u16(), &body)
    }
}

fn classify_failure(status: u16, body: &str) -> SubmitOutcome {
    if status == 429 || looks_rate_limited(body) {
        return SubmitOutcome::RateLimited;
    }
    let detail = format!("{status}: {}", snippet(body));
    if (500..600).contains(&status) {
        SubmitOutcome::ServerError(detail)
    } else {
        SubmitOutcome::ClientError(detail)
    }
}

fn looks_rate_limited(body: &str) -> bool {
    let lowered = body.to_lowercase();
    RATE_LIMIT_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .take_while(|(i, _)| *i < 200)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &body[..end]
}
