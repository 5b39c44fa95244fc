//! Per-request reply consumer.
//!
//! A router is spawned for each published request, attached to that
//! request's reply queue. A reply queue carries exactly one reply, so the
//! router delivers the first matching payload and terminates.

use crate::broker::ReplyDelivery;
use crate::registry::RequestRegistry;
use futures::{Stream, StreamExt};
use ocr_core::OcrResult;
use tracing::{debug, warn};

pub struct ReplyRouter {
  registry: RequestRegistry,
  request_id: String,
}

impl ReplyRouter {
  pub fn new(registry: RequestRegistry, request_id: &str) -> Self {
    Self {
      registry,
      request_id: request_id.to_string(),
    }
  }

  /// Consume deliveries until the matching reply arrives or the stream
  /// closes.
  ///
  /// The router is authoritative for the request ID: whatever `id` the
  /// worker wrote into the payload is overwritten with the correlation ID
  /// the router was spawned for. An exclusive queue never yields foreign
  /// correlation IDs from a well-behaved broker, but mismatches are
  /// tolerated and skipped.
  pub async fn run<S>(self, mut deliveries: S)
  where
    S: Stream<Item = ReplyDelivery> + Unpin,
  {
    while let Some(delivery) = deliveries.next().await {
      if delivery.correlation_id != self.request_id {
        debug!(
          request_id = %self.request_id,
          correlation_id = %delivery.correlation_id,
          "ignoring delivery with foreign correlation id"
        );
        continue;
      }

      let mut result = match serde_json::from_slice::<OcrResult>(&delivery.body) {
        Ok(result) => result,
        Err(err) => {
          warn!(request_id = %self.request_id, error = %err, "reply body is not valid json");
          OcrResult::error(&self.request_id, &format!("invalid reply body: {err}"))
        }
      };
      result.id = self.request_id.clone();

      self.registry.deliver(&self.request_id, result).await;
      return;
    }

    // Stream closed before any matching delivery. The registry deadline
    // would catch this too, but explicit propagation unblocks waiters
    // sooner.
    debug!(request_id = %self.request_id, "reply stream closed without a delivery");
    self
      .registry
      .deliver(&self.request_id, OcrResult::error(&self.request_id, "broker closed"))
      .await;
  }
}
