//! Composition point of the dispatch core.
//!
//! Normalizes an inbound request, publishes it through a per-request broker
//! session, and drives one of three completion paths: wait inline, hand out
//! a ticket for polling, or spawn a postback driver. The session's lifetime
//! is tied to the request lifecycle -- it closes when the synchronous path
//! returns, when the poll watchdog expires, or when the postback driver
//! exits -- never inside a reply handler.

use crate::admission::{AdmissionController, AdmissionHandle};
use crate::broker::{BrokerError, BrokerSession};
use crate::image;
use crate::postback::PostbackDriver;
use crate::registry::{RegistryError, RequestRegistry};
use crate::router::ReplyRouter;
use ocr_core::{DispatchError, OcrRequest, OcrResult, RabbitConfig};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use url::Url;

/// Entry point for the fronting HTTP layer.
pub struct Dispatcher {
  config: RabbitConfig,
  registry: RequestRegistry,
  admission: AdmissionHandle,
  http_client: reqwest::Client,
}

impl Dispatcher {
  pub fn new(config: RabbitConfig) -> Self {
    Self {
      config,
      registry: RequestRegistry::new(),
      admission: AdmissionHandle::new(),
      http_client: reqwest::Client::new(),
    }
  }

  pub fn registry(&self) -> &RequestRegistry {
    &self.registry
  }

  pub fn admission(&self) -> &AdmissionHandle {
    &self.admission
  }

  /// Start the admission controller against this dispatcher's config.
  pub fn spawn_admission(&self) -> JoinHandle<()> {
    AdmissionController::new(self.config.clone(), self.admission.clone()).spawn()
  }

  /// Current `(accepting, technical_error)` pair.
  pub fn accept_state(&self) -> (bool, bool) {
    self.admission.accept_state()
  }

  /// Ask the admission controller to stop; the accept flag drops to false.
  pub fn request_stop(&self) {
    self.admission.request_stop();
  }

  /// Dispatch one OCR request.
  ///
  /// `request_id` is generated by the caller and treated as opaque; it
  /// doubles as the AMQP correlation ID and the reply queue name. The HTTP
  /// status for the caller is 200 on `Ok`, `err.http_status()` otherwise,
  /// with `err.to_result(request_id)` as the body.
  pub async fn dispatch(&self, mut request: OcrRequest, request_id: &str) -> Result<OcrResult, DispatchError> {
    info!(
      request_id,
      deferred = request.deferred,
      doc_type = %request.doc_type,
      engine = ?request.engine,
      page_number = request.page_number,
      timeout = request.time_out,
      "incoming request"
    );

    // A postback URL implies the caller is not waiting inline.
    if !request.reply_to.is_empty() {
      request.reply_to = validate_reply_to(&request.reply_to)?;
      request.deferred = true;
      debug!(request_id, reply_to = %request.reply_to, "automated response requested");
    }

    let priority = self.config.priority_for(&request.doc_type);
    request.time_out = self.config.clamp_timeout(request.time_out);
    let timeout = Duration::from_secs(request.time_out);

    image::materialize(&mut request, &self.http_client).await?;

    let routing_key = request.next_routing_key(&self.config.routing_key);
    debug!(request_id, routing_key = %routing_key, priority, "publishing request");

    let session = BrokerSession::open(&self.config).await.map_err(broker_to_dispatch)?;
    let reply_queue = match session.declare_reply_queue(request_id).await {
      Ok(name) => name,
      Err(err) => {
        session.close().await;
        return Err(broker_to_dispatch(err));
      }
    };
    let deliveries = match session.consume(&reply_queue).await {
      Ok(stream) => stream,
      Err(err) => {
        session.close().await;
        return Err(broker_to_dispatch(err));
      }
    };

    let postback_url = (!request.reply_to.is_empty()).then(|| request.reply_to.clone());
    if let Err(err) = self
      .registry
      .register(request_id, request.deferred, postback_url.clone(), request.time_out)
      .await
    {
      session.close().await;
      return Err(DispatchError::Internal(err.to_string()));
    }

    let body = serde_json::to_vec(&request)?;
    if let Err(err) = session
      .publish(&routing_key, request_id, &reply_queue, priority, &body)
      .await
    {
      self.registry.cleanup(request_id, "publish failed").await;
      session.close().await;
      return Err(broker_to_dispatch(err));
    }

    let router = ReplyRouter::new(self.registry.clone(), request_id);
    let router_handle = tokio::spawn(router.run(deliveries));

    if !request.deferred {
      return self.wait_inline(session, router_handle, request_id, timeout).await;
    }

    if let Some(reply_to) = postback_url {
      self.spawn_postback(session, router_handle, request_id, &reply_to, timeout);
    } else {
      self.spawn_poll_watchdog(session, router_handle, request_id, timeout);
    }

    Ok(OcrResult::processing(request_id))
  }

  /// Wrap [`RequestRegistry::poll`] for the fronting layer.
  pub async fn poll(&self, request_id: &str) -> Result<OcrResult, DispatchError> {
    self.registry.poll(request_id).await.ok_or(DispatchError::UnknownRequest)
  }

  /// Synchronous path: block on the ticket until the reply or the deadline.
  async fn wait_inline(
    &self,
    session: BrokerSession,
    router_handle: JoinHandle<()>,
    request_id: &str,
    timeout: Duration,
  ) -> Result<OcrResult, DispatchError> {
    let outcome = self.registry.blocking_take(request_id, timeout).await;
    session.close().await;
    router_handle.abort();

    match outcome {
      Ok(result) if result.is_timeout() => Err(DispatchError::Timeout),
      Ok(result) => Ok(result),
      Err(RegistryError::Timeout) => Err(DispatchError::Timeout),
      Err(err) => Err(DispatchError::Internal(err.to_string())),
    }
  }

  /// Deferred-with-postback path: the driver owns the tail of the request
  /// lifecycle and the session closes when it exits.
  fn spawn_postback(
    &self,
    session: BrokerSession,
    router_handle: JoinHandle<()>,
    request_id: &str,
    reply_to: &str,
    timeout: Duration,
  ) {
    info!(request_id, "asynchronous request accepted, postback armed");
    let driver = PostbackDriver::new(self.registry.clone(), request_id, reply_to, timeout);
    tokio::spawn(async move {
      driver.run().await;
      session.close().await;
      router_handle.abort();
    });
  }

  /// Deferred-poll path: keep the session open until the reply is consumed
  /// or the deadline passes, then drop whatever the poller left behind.
  fn spawn_poll_watchdog(
    &self,
    session: BrokerSession,
    mut router_handle: JoinHandle<()>,
    request_id: &str,
    timeout: Duration,
  ) {
    info!(request_id, "asynchronous request accepted, caller will poll");
    let registry = self.registry.clone();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
      let started = Instant::now();
      tokio::select! {
        _ = &mut router_handle => {
          // reply consumed; the session is no longer needed but the poll
          // window stays open until the deadline
          session.close().await;
          let remaining = timeout.saturating_sub(started.elapsed());
          if !remaining.is_zero() {
            sleep(remaining).await;
          }
        }
        _ = sleep(timeout) => {
          session.close().await;
          router_handle.abort();
        }
      }
      registry.cleanup(&request_id, "poll window expired").await;
    });
  }
}

/// Validate a caller-supplied postback URL.
fn validate_reply_to(raw: &str) -> Result<String, DispatchError> {
  let url = Url::parse(raw).map_err(|err| DispatchError::BadPostbackUrl(format!("{raw}: {err}")))?;
  match url.scheme() {
    "http" | "https" => Ok(url.to_string()),
    scheme => Err(DispatchError::BadPostbackUrl(format!(
      "unsupported scheme {scheme} in {raw}"
    ))),
  }
}

fn broker_to_dispatch(err: BrokerError) -> DispatchError {
  match err {
    BrokerError::Unreachable(inner) => DispatchError::BrokerUnreachable(inner.to_string()),
    other => DispatchError::PublishFailed(other.to_string()),
  }
}
