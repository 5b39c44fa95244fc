//! Common fixtures for dispatch integration tests.
//!
//! The HTTP fixtures are plain `TcpListener` loops speaking just enough
//! HTTP/1.1 for reqwest, so postback and admission behavior can be observed
//! without an external server.

use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One request as seen by a fixture server. Header names are lowercased.
#[allow(dead_code)]
pub struct RecordedRequest {
  pub method: String,
  pub path: String,
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
}

/// What a recording server does with one accepted connection.
#[allow(dead_code)]
pub enum Behavior {
  /// Read the request, answer with this status and body.
  Respond(u16, &'static str),
  /// Read the request, then drop the connection without answering. reqwest
  /// surfaces this as a transport error.
  Hangup,
}

/// Serve the given behaviors one connection at a time, recording every
/// parsed request. The task ends after the last behavior.
#[allow(dead_code)]
pub async fn spawn_recording_server(behaviors: Vec<Behavior>) -> (String, mpsc::UnboundedReceiver<RecordedRequest>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture listener");
  let addr = listener.local_addr().expect("fixture local addr");
  let (tx, rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    for behavior in behaviors {
      let Ok((mut stream, _)) = listener.accept().await else {
        return;
      };
      let Some(request) = read_request(&mut stream).await else {
        continue;
      };
      let _ = tx.send(request);

      match behavior {
        Behavior::Hangup => drop(stream),
        Behavior::Respond(status, body) => {
          let response = format!(
            "HTTP/1.1 {status} Fixture\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
          );
          let _ = stream.write_all(response.as_bytes()).await;
          let _ = stream.shutdown().await;
        }
      }
    }
  });

  (format!("http://{addr}"), rx)
}

/// Serve broker management stats forever: paths containing `/nodes` get the
/// node payload, everything else the queue payload. Dies with the test
/// runtime.
#[allow(dead_code)]
pub async fn spawn_stats_server(queue_json: &'static str, nodes_json: &'static str) -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture listener");
  let addr = listener.local_addr().expect("fixture local addr");

  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        return;
      };
      let Some(request) = read_request(&mut stream).await else {
        continue;
      };
      let body = if request.path.contains("/nodes") {
        nodes_json
      } else {
        queue_json
      };
      let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
      );
      let _ = stream.write_all(response.as_bytes()).await;
      let _ = stream.shutdown().await;
    }
  });

  format!("http://{addr}")
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];

  let header_end = loop {
    let n = stream.read(&mut chunk).await.ok()?;
    if n == 0 {
      return None;
    }
    buf.extend_from_slice(&chunk[..n]);
    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
      break pos + 4;
    }
    if buf.len() > 64 * 1024 {
      return None;
    }
  };

  let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
  let mut lines = head.lines();
  let request_line = lines.next()?;
  let mut parts = request_line.split_whitespace();
  let method = parts.next()?.to_string();
  let path = parts.next()?.to_string();

  let mut headers = HashMap::new();
  for line in lines {
    if let Some((name, value)) = line.split_once(':') {
      headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
  }

  let content_length: usize = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
  let mut body = buf[header_end..].to_vec();
  while body.len() < content_length {
    let n = stream.read(&mut chunk).await.ok()?;
    if n == 0 {
      break;
    }
    body.extend_from_slice(&chunk[..n]);
  }

  Some(RecordedRequest {
    method,
    path,
    headers,
    body,
  })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}
