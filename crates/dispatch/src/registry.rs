//! In-memory bookkeeping for in-flight OCR requests.
//!
//! Every published request owns a ticket: a single-slot result channel plus
//! an armed deadline timer. The map of tickets and the timers live behind
//! one mutex, and that lock is never held across a channel await; takers
//! move the receiver out under the lock and wait on it afterwards.

use ocr_core::OcrResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("request {0} is already registered")]
  DuplicateId(String),

  #[error("request {0} is not registered")]
  Unknown(String),

  #[error("deadline elapsed before a result arrived")]
  Timeout,
}

/// State for one in-flight request.
///
/// The receiver is an `Option` so a blocking taker can move it out of the
/// map and wait without the lock; a `None` receiver means someone is
/// already waiting on the channel.
struct Ticket {
  tx: Sender<OcrResult>,
  rx: Option<Receiver<OcrResult>>,
  timer: JoinHandle<()>,
  deferred: bool,
  postback_url: Option<String>,
  created_at: Instant,
}

/// Shared registry of in-flight requests.
///
/// Cheap to clone; all clones see the same state.
#[derive(Clone, Default)]
pub struct RequestRegistry {
  tickets: Arc<Mutex<HashMap<String, Ticket>>>,
}

impl RequestRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Install a ticket for `request_id` and arm its deadline timer.
  ///
  /// When the timer fires it delivers the synthetic timeout result and
  /// removes the ticket, so every waiter unblocks within `timeout` seconds.
  pub async fn register(
    &self,
    request_id: &str,
    deferred: bool,
    postback_url: Option<String>,
    timeout_secs: u64,
  ) -> Result<(), RegistryError> {
    let mut tickets = self.tickets.lock().await;
    if tickets.contains_key(request_id) {
      return Err(RegistryError::DuplicateId(request_id.to_string()));
    }

    let (tx, rx) = mpsc::channel(1);
    let timer = {
      let registry = self.clone();
      let id = request_id.to_string();
      tokio::spawn(async move {
        sleep(Duration::from_secs(timeout_secs)).await;
        registry.expire(&id).await;
      })
    };

    tickets.insert(
      request_id.to_string(),
      Ticket {
        tx,
        rx: Some(rx),
        timer,
        deferred,
        postback_url,
        created_at: Instant::now(),
      },
    );
    debug!(request_id, deferred, timeout_secs, "request registered");
    Ok(())
  }

  /// Deliver a terminal result into the ticket's slot and disarm the timer.
  ///
  /// The router delivers at most once per correlation ID; a full slot means
  /// the deadline already won the race, and the later write is dropped.
  pub async fn deliver(&self, request_id: &str, result: OcrResult) {
    let tickets = self.tickets.lock().await;
    let Some(ticket) = tickets.get(request_id) else {
      debug!(request_id, "dropping result for unknown request");
      return;
    };

    match ticket.tx.try_send(result) {
      Ok(()) => {
        ticket.timer.abort();
        debug!(request_id, "result delivered");
      }
      Err(TrySendError::Full(_)) => {
        warn!(request_id, "result slot already occupied, dropping later result");
      }
      Err(TrySendError::Closed(_)) => {
        warn!(request_id, "result channel closed before delivery");
      }
    }
  }

  /// Non-blocking status check.
  ///
  /// Returns `None` for unknown IDs. A pending request yields a
  /// `processing` placeholder; a terminal result is consumed and its ticket
  /// removed in the same critical section, so a second poll for the same ID
  /// reports unknown.
  pub async fn poll(&self, request_id: &str) -> Option<OcrResult> {
    let mut tickets = self.tickets.lock().await;
    let ticket = tickets.get_mut(request_id)?;

    let ready = match ticket.rx.as_mut() {
      // receiver loaned to a blocking taker; that taker owns consumption
      None => None,
      Some(rx) => match rx.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
      },
    };

    match ready {
      Some(result) => {
        if let Some(ticket) = tickets.remove(request_id) {
          ticket.timer.abort();
        }
        debug!(request_id, "terminal result consumed by poll");
        Some(result)
      }
      None => Some(OcrResult::processing(request_id)),
    }
  }

  /// Wait for the request's terminal result, up to `deadline`.
  ///
  /// The ticket is removed whichever way this resolves. If the deadline
  /// timer fires first the synthetic timeout result comes back as a normal
  /// terminal result.
  pub async fn blocking_take(&self, request_id: &str, deadline: Duration) -> Result<OcrResult, RegistryError> {
    let mut rx = {
      let mut tickets = self.tickets.lock().await;
      let ticket = tickets
        .get_mut(request_id)
        .ok_or_else(|| RegistryError::Unknown(request_id.to_string()))?;
      ticket
        .rx
        .take()
        .ok_or_else(|| RegistryError::Unknown(request_id.to_string()))?
    };

    let outcome = timeout(deadline, rx.recv()).await;
    self.cleanup(request_id, "blocking take finished").await;

    match outcome {
      Ok(Some(result)) => Ok(result),
      // channel closed without a result, or the deadline elapsed
      Ok(None) => Err(RegistryError::Timeout),
      Err(_) => Err(RegistryError::Timeout),
    }
  }

  /// Remove the ticket and disarm its timer. Safe to call repeatedly and
  /// for IDs that were never registered.
  pub async fn cleanup(&self, request_id: &str, reason: &str) {
    let mut tickets = self.tickets.lock().await;
    if let Some(ticket) = tickets.remove(request_id) {
      ticket.timer.abort();
      debug!(
        request_id,
        reason,
        age_ms = ticket.created_at.elapsed().as_millis() as u64,
        "request cleaned up"
      );
    }
  }

  /// Number of in-flight requests.
  pub async fn len(&self) -> usize {
    self.tickets.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.tickets.lock().await.is_empty()
  }

  /// Postback URL recorded for a deferred request, if any.
  pub async fn postback_url(&self, request_id: &str) -> Option<String> {
    let tickets = self.tickets.lock().await;
    tickets.get(request_id).and_then(|t| t.postback_url.clone())
  }

  /// Whether the request was registered as deferred.
  pub async fn is_deferred(&self, request_id: &str) -> Option<bool> {
    let tickets = self.tickets.lock().await;
    tickets.get(request_id).map(|t| t.deferred)
  }

  /// Deadline expiry: push the synthetic timeout result for any waiter
  /// still holding the receiver, then drop the ticket.
  async fn expire(&self, request_id: &str) {
    let mut tickets = self.tickets.lock().await;
    if let Some(ticket) = tickets.remove(request_id) {
      let _ = ticket.tx.try_send(OcrResult::timed_out(request_id));
      warn!(request_id, "request deadline fired");
    }
  }
}
