use crate::result::OcrResult;
use thiserror::Error;

/// Error taxonomy of the dispatch core.
///
/// Every variant maps to an HTTP status for the fronting layer. Errors
/// raised before publication are returned synchronously; errors after
/// publication become terminal [`OcrResult`]s delivered through the
/// registry so polling and postback callers observe uniform behavior.
#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("reply-to url is invalid: {0}")]
  BadPostbackUrl(String),

  #[error("message broker is not reachable: {0}")]
  BrokerUnreachable(String),

  #[error("image could not be loaded: {0}")]
  ImageFetchFailed(String),

  #[error("publish to broker failed: {0}")]
  PublishFailed(String),

  #[error("request timed out before a reply arrived")]
  Timeout,

  #[error("no such request")]
  UnknownRequest,

  #[error("service is not accepting requests")]
  ServiceBusy,

  #[error("internal error: {0}")]
  Internal(String),
}

impl DispatchError {
  pub fn http_status(&self) -> u16 {
    match self {
      DispatchError::BadPostbackUrl(_) => 400,
      DispatchError::UnknownRequest => 404,
      DispatchError::ServiceBusy => 503,
      DispatchError::BrokerUnreachable(_)
      | DispatchError::ImageFetchFailed(_)
      | DispatchError::PublishFailed(_)
      | DispatchError::Timeout
      | DispatchError::Internal(_) => 500,
    }
  }

  /// Render the error as a terminal result body for the caller.
  pub fn to_result(&self, request_id: &str) -> OcrResult {
    match self {
      DispatchError::Timeout => OcrResult::timed_out(request_id),
      other => OcrResult::error(request_id, &other.to_string()),
    }
  }
}

impl From<serde_json::Error> for DispatchError {
  fn from(err: serde_json::Error) -> Self {
    DispatchError::Internal(err.to_string())
  }
}
