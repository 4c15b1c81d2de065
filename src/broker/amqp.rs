//! AMQP 0-9-1 broker backend (RabbitMQ)
//!
//! Each session is one lapin connection with a single channel. Errors lapin
//! reports on either of them cancel the session's `closed()` token, which is
//! what the consumer's connection monitor waits on. A channel exception
//! leaves the connection up but the session unusable.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::BrokerConfig;

use super::backend::{Acknowledger, Broker, BrokerSession, Delivery, DeliveryStream, QueueSpec};
use super::error::{BrokerError, BrokerResult};

const CONSUMER_TAG: &str = "fleetpulse-consumer";

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    uri: String,
    address: String,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.uri(),
            address: config.address.clone(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self), fields(broker = %self.address))]
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerSession>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let closed = CancellationToken::new();
        let notify = closed.clone();
        connection.on_error(move |err| {
            warn!("broker connection closed: {err}");
            notify.cancel();
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("failed to open channel: {e}")))?;

        let notify = closed.clone();
        channel.on_error(move |err| {
            warn!("broker channel closed: {err}");
            notify.cancel();
        });

        debug!("AMQP connection and channel open");

        Ok(Box::new(AmqpSession {
            connection,
            channel,
            closed,
        }))
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: CancellationToken,
}

impl AmqpSession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()> {
        self.ensure_open()?;

        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::DeclareFailed(e.to_string()))?;

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        self.ensure_open()?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        // The returned confirm is not awaited: confirms are not enabled
        let _confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| {
                if self.channel.status().connected() {
                    BrokerError::PublishFailed(e.to_string())
                } else {
                    warn!("publish failed on a closed channel: {e}");
                    self.closed.cancel();
                    BrokerError::ConnectionClosed
                }
            })?;

        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::SubscribeFailed(format!("failed to set QoS: {e}")))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    let lapin::message::Delivery {
                        data,
                        redelivered,
                        acker,
                        ..
                    } = delivery;
                    Delivery::new(data, redelivered, Box::new(AmqpAcker { acker }))
                })
                .map_err(|e| BrokerError::Protocol(e.to_string()))
        });

        Ok(stream.boxed())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        let was_connected = self.connection.status().connected();
        self.closed.cancel();

        if !was_connected {
            return Ok(());
        }

        if let Err(e) = self.channel.close(200, "closing").await {
            debug!("channel close failed: {e}");
        }

        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }
}
