//! Recognition results as they travel over the wire and back to callers.

use serde::{Deserialize, Serialize};

/// Message text of the synthetic result delivered when a request's deadline
/// fires before a worker reply arrives.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// Processing state of a request as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
  #[default]
  Processing,
  Done,
  Error,
}

/// Outcome of an OCR request.
///
/// Workers publish this as JSON on the reply queue; the same shape is
/// returned to synchronous callers, pollers, and postback targets. The `id`
/// field is always stamped by the dispatch side from the correlation ID --
/// whatever the worker put there is overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
  #[serde(default)]
  pub text: String,
  #[serde(default)]
  pub status: OcrStatus,
  #[serde(default)]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl OcrResult {
  /// Acknowledgement returned while a request is still in flight.
  pub fn processing(id: &str) -> Self {
    Self {
      text: String::new(),
      status: OcrStatus::Processing,
      id: id.to_string(),
      error: None,
    }
  }

  /// Terminal error result.
  pub fn error(id: &str, message: &str) -> Self {
    Self {
      text: message.to_string(),
      status: OcrStatus::Error,
      id: id.to_string(),
      error: Some(message.to_string()),
    }
  }

  /// Synthetic terminal result delivered when the request deadline fires.
  pub fn timed_out(id: &str) -> Self {
    Self::error(id, TIMEOUT_MESSAGE)
  }

  /// A terminal result ends the request lifecycle; its registry entry must
  /// be removed once a caller has observed it.
  pub fn is_terminal(&self) -> bool {
    self.status != OcrStatus::Processing
  }

  /// Whether this is the synthetic deadline result.
  pub fn is_timeout(&self) -> bool {
    self.status == OcrStatus::Error && self.text == TIMEOUT_MESSAGE
  }
}
