//! Admission control from broker health.
//!
//! A background loop samples the broker management API and opens or closes
//! the front door: requests are admitted only while the work queue is
//! keeping up with its consumers and the broker nodes have memory headroom.

use ocr_core::RabbitConfig;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// If broker memory usage exceeds this percentage of the limit, no more
/// requests are admitted.
const MEMORY_THRESHOLD_PERCENT: u64 = 95;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(4);

/// Queue stats as served by the management API.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct QueueStats {
  #[serde(default)]
  pub messages: u64,
  #[serde(default)]
  pub consumers: u64,
  #[serde(default)]
  pub message_bytes: u64,
}

/// Per-node memory stats as served by the management API.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct NodeStats {
  #[serde(default)]
  pub mem_limit: u64,
  #[serde(default)]
  pub mem_used: u64,
}

/// One admission sample. Recomputed each poll, never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionSnapshot {
  pub messages: u64,
  pub consumers: u64,
  pub message_bytes: u64,
  pub mem_limit_total: u64,
  pub mem_used_total: u64,
}

impl AdmissionSnapshot {
  pub fn from_stats(queue: QueueStats, nodes: &[NodeStats]) -> Self {
    Self {
      messages: queue.messages,
      consumers: queue.consumers,
      message_bytes: queue.message_bytes,
      mem_limit_total: nodes.iter().map(|n| n.mem_limit).sum(),
      mem_used_total: nodes.iter().map(|n| n.mem_used).sum(),
    }
  }

  pub fn queue_ok(&self, factor: u64) -> bool {
    queue_ok(self.messages, self.consumers, factor)
  }

  pub fn memory_ok(&self) -> bool {
    memory_ok(self.mem_used_total, self.mem_limit_total)
  }
}

/// Queue keeps up while `messages < consumers * factor`. With no consumers
/// connected nothing drains the queue, so nothing is admitted.
pub fn queue_ok(messages: u64, consumers: u64, factor: u64) -> bool {
  if consumers == 0 {
    return false;
  }
  messages < consumers.saturating_mul(factor)
}

/// Total used memory must stay under the threshold share of the total limit.
pub fn memory_ok(mem_used_total: u64, mem_limit_total: u64) -> bool {
  mem_used_total < mem_limit_total.saturating_mul(MEMORY_THRESHOLD_PERCENT) / 100
}

#[derive(Debug, Clone, Copy, Default)]
struct AcceptState {
  accepting: bool,
  technical_error: bool,
}

/// Shared output of the admission controller plus its stop channel.
///
/// Cheap to clone; the fronting HTTP layer reads the flags on every inbound
/// request.
#[derive(Clone)]
pub struct AdmissionHandle {
  state: Arc<Mutex<AcceptState>>,
  stop_tx: broadcast::Sender<()>,
}

impl Default for AdmissionHandle {
  fn default() -> Self {
    Self::new()
  }
}

impl AdmissionHandle {
  pub fn new() -> Self {
    let (stop_tx, _) = broadcast::channel(1);
    Self {
      state: Arc::new(Mutex::new(AcceptState::default())),
      stop_tx,
    }
  }

  /// Current `(accepting, technical_error)` pair.
  pub fn accept_state(&self) -> (bool, bool) {
    let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    (state.accepting, state.technical_error)
  }

  /// Signal the controller to stop; it flips the accept flag to false on
  /// the way out.
  pub fn request_stop(&self) {
    let _ = self.stop_tx.send(());
  }

  fn set(&self, accepting: bool, technical_error: bool) {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    state.accepting = accepting;
    state.technical_error = technical_error;
  }

  fn subscribe_stop(&self) -> broadcast::Receiver<()> {
    self.stop_tx.subscribe()
  }
}

#[derive(Debug, thiserror::Error)]
enum AdmissionError {
  #[error("management api request failed: {0}")]
  Fetch(#[from] reqwest::Error),
}

/// Background loop publishing the admission decision into an
/// [`AdmissionHandle`].
pub struct AdmissionController {
  config: RabbitConfig,
  handle: AdmissionHandle,
  client: reqwest::Client,
  poll_interval: Duration,
}

impl AdmissionController {
  pub fn new(config: RabbitConfig, handle: AdmissionHandle) -> Self {
    Self {
      config,
      handle,
      client: reqwest::Client::new(),
      poll_interval: POLL_INTERVAL,
    }
  }

  /// Shorten the polling interval (for tests).
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Spawn the controller as a background task subscribed to the handle's
  /// stop channel.
  pub fn spawn(self) -> JoinHandle<()> {
    let stop_rx = self.handle.subscribe_stop();
    tokio::spawn(self.run(stop_rx))
  }

  async fn run(self, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(self.poll_interval);
    let mut accepting = false;
    info!(interval_secs = self.poll_interval.as_secs(), "admission controller started");

    loop {
      tokio::select! {
        _ = interval.tick() => {
          let (next, technical_error) = match self.fetch_snapshot().await {
            Ok(snapshot) => {
              let ok = snapshot.queue_ok(self.config.factor_for_message_accept) && snapshot.memory_ok();
              (ok, false)
            }
            Err(err) => {
              error!(error = %err, "failed to sample broker stats");
              (false, true)
            }
          };

          if next != accepting {
            info!(accepting = next, "admission state changed");
          }
          accepting = next;
          self.handle.set(next, technical_error);
        }
        _ = stop_rx.recv() => {
          info!("admission controller stopping");
          self.handle.set(false, false);
          break;
        }
      }
    }
  }

  async fn fetch_snapshot(&self) -> Result<AdmissionSnapshot, AdmissionError> {
    let queue: QueueStats = self
      .client
      .get(self.config.queue_stats_url())
      .timeout(FETCH_TIMEOUT)
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;

    let nodes: Vec<NodeStats> = self
      .client
      .get(self.config.node_stats_url())
      .timeout(FETCH_TIMEOUT)
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;

    Ok(AdmissionSnapshot::from_stats(queue, &nodes))
  }
}
