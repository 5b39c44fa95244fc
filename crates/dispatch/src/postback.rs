//! Automatic HTTP delivery of results for deferred requests.

use crate::registry::RequestRegistry;
use ocr_core::OcrResult;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// User agent stamped on every postback.
pub const POSTBACK_USER_AGENT: &str = concat!("open-ocr/", env!("CARGO_PKG_VERSION"));

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Slack past the request deadline so the registry's synthetic timeout
/// result wins the race and gets posted like any other terminal result.
const TAKE_GRACE: Duration = Duration::from_secs(1);

/// Waits out one deferred request and POSTs its terminal result to the
/// caller-supplied URL.
///
/// An attempt counts as delivered as soon as the transport produces any
/// HTTP response, whatever the status code; only transport failures
/// (refused connection, DNS, TLS, read timeout) are retried. After the
/// attempts are exhausted the result is dropped with an error log -- the
/// caller already holds the `processing` acknowledgement and can still
/// poll.
pub struct PostbackDriver {
  registry: RequestRegistry,
  request_id: String,
  reply_to: String,
  deadline: Duration,
  client: reqwest::Client,
  max_attempts: u32,
  retry_delay: Duration,
}

impl PostbackDriver {
  pub fn new(registry: RequestRegistry, request_id: &str, reply_to: &str, deadline: Duration) -> Self {
    Self {
      registry,
      request_id: request_id.to_string(),
      reply_to: reply_to.to_string(),
      deadline,
      client: reqwest::Client::new(),
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      retry_delay: DEFAULT_RETRY_DELAY,
    }
  }

  /// Shorten the retry pause (for tests).
  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn with_max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = attempts.max(1);
    self
  }

  /// Drive the request to completion: await the terminal result, deliver
  /// it, clean up the registry entry.
  pub async fn run(self) {
    let outcome = self
      .registry
      .blocking_take(&self.request_id, self.deadline + TAKE_GRACE)
      .await;

    match outcome {
      Ok(result) => {
        self.post_with_retries(&result).await;
      }
      Err(err) => {
        warn!(request_id = %self.request_id, error = %err, "no result to post back");
      }
    }

    self.registry.cleanup(&self.request_id, "postback driver exit").await;
  }

  async fn post_with_retries(&self, result: &OcrResult) -> bool {
    for attempt in 1..=self.max_attempts {
      match self.post_once(result).await {
        Ok(status) => {
          info!(
            request_id = %self.request_id,
            reply_to = %self.reply_to,
            attempt,
            status = status.as_u16(),
            "result posted back"
          );
          return true;
        }
        Err(err) => {
          warn!(
            request_id = %self.request_id,
            reply_to = %self.reply_to,
            attempt,
            error = %err,
            "postback attempt failed"
          );
          if attempt < self.max_attempts {
            sleep(self.retry_delay).await;
          }
        }
      }
    }

    error!(
      request_id = %self.request_id,
      reply_to = %self.reply_to,
      attempts = self.max_attempts,
      "postback abandoned, dropping result"
    );
    false
  }

  async fn post_once(&self, result: &OcrResult) -> Result<reqwest::StatusCode, reqwest::Error> {
    let response = self
      .client
      .post(&self.reply_to)
      .timeout(HTTP_TIMEOUT)
      .header(reqwest::header::USER_AGENT, POSTBACK_USER_AGENT)
      .header(reqwest::header::CONNECTION, "close")
      .header("X-Custom-Header", "automated reply")
      .json(result)
      .send()
      .await?;
    Ok(response.status())
  }
}
