//! Per-request AMQP session.
//!
//! Each dispatched request opens its own connection and channel; the
//! session lives exactly as long as the request lifecycle and is closed by
//! whichever path finishes it (synchronous completion, poll watchdog,
//! postback driver). Sharing one long-lived connection across requests is
//! what broke deferred polling in earlier revisions of this service.

use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::options::{
  BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
  QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use ocr_core::RabbitConfig;
use tracing::{debug, info, warn};

/// Priority ceiling announced on reply queues.
const REPLY_QUEUE_MAX_PRIORITY: u8 = 10;
const CONSUMER_TAG: &str = "ocr-dispatch";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
  #[error("broker dial failed: {0}")]
  Unreachable(#[source] lapin::Error),

  #[error("broker operation failed: {0}")]
  Protocol(#[from] lapin::Error),

  #[error("publish was nacked by the broker")]
  Nacked,
}

/// One reply envelope as consumed off a reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDelivery {
  pub correlation_id: String,
  pub body: Vec<u8>,
  pub delivery_tag: u64,
}

/// Wraps a single AMQP connection and channel for one request.
pub struct BrokerSession {
  connection: Connection,
  channel: Channel,
  exchange: String,
  reliable: bool,
}

impl BrokerSession {
  /// Dial the broker, open a channel and declare the configured exchange
  /// (durable, non-auto-deleted, non-internal). Arms publisher confirms
  /// when the config asks for reliable publishing.
  pub async fn open(config: &RabbitConfig) -> Result<Self, BrokerError> {
    debug!(uri = %config.amqp_uri, "dialing broker");
    let connection = Connection::connect(&config.amqp_uri, ConnectionProperties::default())
      .await
      .map_err(BrokerError::Unreachable)?;
    let channel = connection.create_channel().await?;

    let kind = match config.exchange_type.as_str() {
      "topic" => ExchangeKind::Topic,
      "direct" => ExchangeKind::Direct,
      other => ExchangeKind::Custom(other.to_string()),
    };
    channel
      .exchange_declare(
        &config.exchange,
        kind,
        ExchangeDeclareOptions {
          durable: true,
          auto_delete: false,
          internal: false,
          ..Default::default()
        },
        FieldTable::default(),
      )
      .await?;

    if config.reliable {
      channel.confirm_select(ConfirmSelectOptions::default()).await?;
    }

    Ok(Self {
      connection,
      channel,
      exchange: config.exchange.clone(),
      reliable: config.reliable,
    })
  }

  /// Declare the reply queue for a request and bind it to the exchange on
  /// its own name. The queue is exclusive, auto-deleted and non-durable; it
  /// carries exactly one reply and dies with this session.
  pub async fn declare_reply_queue(&self, request_id: &str) -> Result<String, BrokerError> {
    let mut args = FieldTable::default();
    args.insert(
      ShortString::from("x-max-priority"),
      AMQPValue::ShortShortUInt(REPLY_QUEUE_MAX_PRIORITY),
    );

    let queue = self
      .channel
      .queue_declare(
        request_id,
        QueueDeclareOptions {
          durable: false,
          exclusive: true,
          auto_delete: true,
          ..Default::default()
        },
        args.clone(),
      )
      .await?;
    let name = queue.name().as_str().to_string();

    self
      .channel
      .queue_bind(&name, &self.exchange, &name, QueueBindOptions::default(), args)
      .await?;

    debug!(reply_queue = %name, "reply queue declared");
    Ok(name)
  }

  /// Start consuming reply deliveries with auto-ack.
  ///
  /// The stream ends when the channel closes. Consumer errors are logged
  /// and skipped rather than surfaced; the request deadline bounds the
  /// lifetime of anyone waiting on this stream.
  pub async fn consume(&self, queue: &str) -> Result<BoxStream<'static, ReplyDelivery>, BrokerError> {
    let consumer = self
      .channel
      .basic_consume(
        queue,
        CONSUMER_TAG,
        BasicConsumeOptions {
          no_ack: true,
          ..Default::default()
        },
        FieldTable::default(),
      )
      .await?;

    let deliveries = consumer
      .filter_map(|delivery| async move {
        match delivery {
          Ok(delivery) => Some(ReplyDelivery {
            correlation_id: delivery
              .properties
              .correlation_id()
              .as_ref()
              .map(|id| id.as_str().to_string())
              .unwrap_or_default(),
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
          }),
          Err(err) => {
            warn!(error = %err, "reply consumer error, skipping delivery");
            None
          }
        }
      })
      .boxed();

    Ok(deliveries)
  }

  /// Publish a transient JSON message to the exchange.
  ///
  /// When the session is reliable this blocks until the broker acks or
  /// nacks the publish.
  pub async fn publish(
    &self,
    routing_key: &str,
    correlation_id: &str,
    reply_to: &str,
    priority: u8,
    body: &[u8],
  ) -> Result<(), BrokerError> {
    let properties = BasicProperties::default()
      .with_content_type("application/json".into())
      .with_content_encoding("".into())
      .with_delivery_mode(1)
      .with_priority(priority.min(9))
      .with_correlation_id(correlation_id.into())
      .with_reply_to(reply_to.into());

    let confirm = self
      .channel
      .basic_publish(&self.exchange, routing_key, BasicPublishOptions::default(), body, properties)
      .await?;

    if self.reliable {
      let confirmation = confirm.await?;
      if matches!(confirmation, Confirmation::Nack(_)) {
        return Err(BrokerError::Nacked);
      }
    }

    info!(routing_key, correlation_id, size = body.len(), "message published");
    Ok(())
  }

  /// Close channel and connection.
  ///
  /// Must not run while a reply is still expected; callers tie this to the
  /// end of the request lifecycle.
  pub async fn close(self) {
    if let Err(err) = self.channel.close(200, "request finished").await {
      debug!(error = %err, "channel close failed");
    }
    if let Err(err) = self.connection.close(200, "request finished").await {
      debug!(error = %err, "connection close failed");
    }
  }
}
