//! Inbound OCR request as published to the worker pool.

use serde::{Deserialize, Serialize};

/// OCR engine selector. The tag doubles as the engine's direct routing key;
/// `dummy` is the no-op test engine and routes to the configured base key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
  #[default]
  Tesseract,
  Sandwich,
  Dummy,
}

impl EngineType {
  /// Routing key used when the preprocessor chain is exhausted.
  pub fn routing_key<'a>(&self, base: &'a str) -> &'a str {
    match self {
      EngineType::Tesseract => "tesseract",
      EngineType::Sandwich => "sandwich",
      EngineType::Dummy => base,
    }
  }
}

/// An image recognition request.
///
/// Exactly one of `img_bytes`, `img_base64`, `img_url` must be populated by
/// the time the message is published; the dispatcher materializes the other
/// two forms into `img_bytes` first. The struct is serialized verbatim as
/// the broker message body, so field names here are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OcrRequest {
  /// Raw image bytes, base64-encoded on the wire.
  #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
  pub img_bytes: Vec<u8>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub img_url: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub img_base64: String,
  #[serde(default)]
  pub engine: EngineType,
  /// Engine options, opaque to the dispatch layer.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub engine_args: serde_json::Value,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub doc_type: String,
  #[serde(default)]
  pub page_number: u16,
  /// Per-request timeout in seconds; clamped by the dispatcher.
  #[serde(rename = "timeout", default)]
  pub time_out: u64,
  #[serde(default)]
  pub inplace_decode: bool,
  #[serde(default)]
  pub deferred: bool,
  /// Postback URL. Setting it forces `deferred`.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub reply_to: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub reference_id: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub user_agent: String,
  /// Ordered chain of preprocessor tags still to be traversed.
  #[serde(rename = "preprocessors", default, skip_serializing_if = "Vec::is_empty")]
  pub preprocessor_chain: Vec<String>,
}

impl OcrRequest {
  /// Whether any image source is populated.
  pub fn has_image_source(&self) -> bool {
    !self.img_bytes.is_empty() || !self.img_base64.is_empty() || !self.img_url.is_empty()
  }

  pub fn has_base64(&self) -> bool {
    !self.img_base64.is_empty()
  }

  /// Select the routing key for publication.
  ///
  /// The first preprocessor tag wins and is consumed, so the published
  /// message carries only the remainder of the chain; each preprocessor
  /// re-publishes with the next tag until the engine is reached.
  pub fn next_routing_key(&mut self, base: &str) -> String {
    if self.preprocessor_chain.is_empty() {
      self.engine.routing_key(base).to_string()
    } else {
      self.preprocessor_chain.remove(0)
    }
  }
}

/// Serde helper encoding `Vec<u8>` as a base64 string, matching the wire
/// format the worker pool expects for `img_bytes`.
mod base64_bytes {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
  }
}
