//! Image materialization before publication.
//!
//! The worker pool only understands raw bytes, so a request arriving with a
//! base64 payload or an image URL is resolved here. Failures never reach
//! the broker; the request is rejected synchronously.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ocr_core::{DispatchError, OcrRequest};
use std::time::Duration;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Ensure `img_bytes` is populated, decoding base64 or fetching the URL as
/// needed. Base64 wins over a URL when both are present, matching the
/// cheaper transformation.
pub async fn materialize(request: &mut OcrRequest, client: &reqwest::Client) -> Result<(), DispatchError> {
  if !request.img_bytes.is_empty() {
    return Ok(());
  }

  if request.has_base64() {
    let bytes = STANDARD
      .decode(request.img_base64.as_bytes())
      .map_err(|err| DispatchError::ImageFetchFailed(format!("base64 decode: {err}")))?;
    debug!(size = bytes.len(), "image decoded from base64");
    request.img_bytes = bytes;
    request.img_base64.clear();
    return Ok(());
  }

  if !request.img_url.is_empty() {
    let response = client
      .get(&request.img_url)
      .timeout(FETCH_TIMEOUT)
      .send()
      .await
      .map_err(|err| DispatchError::ImageFetchFailed(format!("fetch {}: {err}", request.img_url)))?
      .error_for_status()
      .map_err(|err| DispatchError::ImageFetchFailed(format!("fetch {}: {err}", request.img_url)))?;
    let bytes = response
      .bytes()
      .await
      .map_err(|err| DispatchError::ImageFetchFailed(format!("read body: {err}")))?;
    debug!(size = bytes.len(), url = %request.img_url, "image downloaded");
    request.img_bytes = bytes.to_vec();
    return Ok(());
  }

  Err(DispatchError::ImageFetchFailed("no image source provided".to_string()))
}
