//! Postback delivery tests against a local recording HTTP fixture.

mod common;

use common::{spawn_recording_server, Behavior};
use dispatch::postback::{PostbackDriver, POSTBACK_USER_AGENT};
use dispatch::RequestRegistry;
use ocr_core::{OcrResult, OcrStatus};
use std::time::Duration;

fn done_result(id: &str, text: &str) -> OcrResult {
  let mut result = OcrResult::processing(id);
  result.status = OcrStatus::Done;
  result.text = text.to_string();
  result
}

#[tokio::test]
async fn test_postback_posts_result_with_expected_headers() {
  let registry = RequestRegistry::new();
  let (url, mut requests) = spawn_recording_server(vec![Behavior::Respond(200, "{}")]).await;

  registry.register("r1", true, Some(url.clone()), 10).await.unwrap();
  let driver = PostbackDriver::new(registry.clone(), "r1", &url, Duration::from_secs(10));
  let driver_task = tokio::spawn(driver.run());

  registry.deliver("r1", done_result("r1", "hello")).await;
  tokio::time::timeout(Duration::from_secs(5), driver_task)
    .await
    .expect("driver should finish")
    .expect("driver task should not panic");

  let recorded = requests.recv().await.expect("one postback request");
  assert_eq!(recorded.method, "POST");
  assert_eq!(recorded.headers.get("content-type").map(String::as_str), Some("application/json"));
  assert_eq!(
    recorded.headers.get("user-agent").map(String::as_str),
    Some(POSTBACK_USER_AGENT)
  );
  assert_eq!(
    recorded.headers.get("x-custom-header").map(String::as_str),
    Some("automated reply")
  );

  let body: OcrResult = serde_json::from_slice(&recorded.body).expect("json body");
  assert_eq!(body.id, "r1");
  assert_eq!(body.text, "hello");
  assert_eq!(body.status, OcrStatus::Done);

  // the driver cleans its registry entry on exit
  assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_postback_retries_transport_errors_then_succeeds() {
  let registry = RequestRegistry::new();
  let (url, mut requests) =
    spawn_recording_server(vec![Behavior::Hangup, Behavior::Hangup, Behavior::Respond(200, "{}")]).await;

  registry.register("r2", true, Some(url.clone()), 10).await.unwrap();
  let driver = PostbackDriver::new(registry.clone(), "r2", &url, Duration::from_secs(10))
    .with_retry_delay(Duration::from_millis(50));
  let driver_task = tokio::spawn(driver.run());

  registry.deliver("r2", done_result("r2", "retry me")).await;
  tokio::time::timeout(Duration::from_secs(5), driver_task)
    .await
    .expect("driver should finish")
    .expect("driver task should not panic");

  // exactly three attempts were observed
  let mut attempts = 0;
  while requests.try_recv().is_ok() {
    attempts += 1;
  }
  assert_eq!(attempts, 3);
  assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_postback_treats_server_error_as_delivered() {
  let registry = RequestRegistry::new();
  let (url, mut requests) = spawn_recording_server(vec![Behavior::Respond(500, "oops")]).await;

  registry.register("r3", true, Some(url.clone()), 10).await.unwrap();
  let driver = PostbackDriver::new(registry.clone(), "r3", &url, Duration::from_secs(10))
    .with_retry_delay(Duration::from_millis(50));
  let driver_task = tokio::spawn(driver.run());

  registry.deliver("r3", done_result("r3", "whatever")).await;
  tokio::time::timeout(Duration::from_secs(5), driver_task)
    .await
    .expect("driver should finish")
    .expect("driver task should not panic");

  // any HTTP response counts as delivered: one attempt, no retries
  assert!(requests.recv().await.is_some());
  assert!(requests.try_recv().is_err());
  assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_postback_posts_timeout_result_when_no_reply_arrives() {
  let registry = RequestRegistry::new();
  let (url, mut requests) = spawn_recording_server(vec![Behavior::Respond(200, "{}")]).await;

  // one-second deadline, no delivery: the registry's synthetic timeout
  // result is what gets posted
  registry.register("r4", true, Some(url.clone()), 1).await.unwrap();
  let driver = PostbackDriver::new(registry.clone(), "r4", &url, Duration::from_secs(1));
  tokio::time::timeout(Duration::from_secs(5), tokio::spawn(driver.run()))
    .await
    .expect("driver should finish")
    .expect("driver task should not panic");

  let recorded = requests.recv().await.expect("one postback request");
  let body: OcrResult = serde_json::from_slice(&recorded.body).expect("json body");
  assert!(body.is_timeout());
  assert_eq!(body.id, "r4");
  assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_postback_gives_up_after_max_attempts() {
  let registry = RequestRegistry::new();
  let (url, mut requests) =
    spawn_recording_server(vec![Behavior::Hangup, Behavior::Hangup, Behavior::Hangup]).await;

  registry.register("r5", true, Some(url.clone()), 10).await.unwrap();
  let driver = PostbackDriver::new(registry.clone(), "r5", &url, Duration::from_secs(10))
    .with_retry_delay(Duration::from_millis(50));
  let driver_task = tokio::spawn(driver.run());

  registry.deliver("r5", done_result("r5", "lost")).await;
  tokio::time::timeout(Duration::from_secs(5), driver_task)
    .await
    .expect("driver should finish")
    .expect("driver task should not panic");

  let mut attempts = 0;
  while requests.try_recv().is_ok() {
    attempts += 1;
  }
  assert_eq!(attempts, 3);
  // the result is dropped but the registry entry is still cleaned
  assert!(registry.is_empty().await);
}
