use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::model::TickStatus;

const USER_AGENT: &str = "Echo-Monitor/1.0";

/// What came back from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered with this status code.
    Response(u16),
    /// Connection failure, TLS failure or timeout.
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    /// Wall-clock time of the attempt, measured whatever the outcome.
    pub elapsed_ms: i64,
}

impl ProbeResult {
    pub fn status(&self) -> TickStatus {
        classify(self.outcome)
    }
}

/// Map a probe outcome to a tick status.
///
/// `200..=403` is up, `500..=599` and no answer at all are down, anything
/// else (redirects, 404, ...) is unknown.
pub fn classify(outcome: ProbeOutcome) -> TickStatus {
    match outcome {
        ProbeOutcome::Response(200..=403) => TickStatus::Up,
        ProbeOutcome::Response(500..=599) => TickStatus::Down,
        ProbeOutcome::Response(_) => TickStatus::Unknown,
        ProbeOutcome::Unreachable => TickStatus::Down,
    }
}

/// Performs one availability check against a URL. Never fails: an
/// unreachable target is a valid observation.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeResult;
}

/// HEAD-request prober with a bounded timeout. Redirects are not followed so
/// a `3xx` is reported as-is.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> ProbeResult {
        let start = Instant::now();

        let outcome = match self.client.head(url).send().await {
            Ok(response) => ProbeOutcome::Response(response.status().as_u16()),
            Err(e) => {
                debug!(%url, error = %e, "probe failed");
                ProbeOutcome::Unreachable
            }
        };

        ProbeResult {
            outcome,
            elapsed_ms: start.elapsed().as_millis() as i64,
        }
    }
}
