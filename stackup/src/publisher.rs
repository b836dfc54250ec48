//! Publishing admin events to the broker from the test process.

use std::fmt;

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{info, instrument, warn};

use crate::errors::PublishError;
use crate::event::{RoutingKey, TOPIC_EXCHANGE};
use crate::retry::{retry_until_deadline, Exhausted, PollPolicy};
use crate::types::Credentials;

const DEFAULT_VHOST: &str = "/";

/// Where the test process reaches the broker's AMQP listener.
#[derive(Clone, PartialEq, Eq)]
pub struct AmqpTarget {
    host: String,
    port: u16,
    credentials: Credentials,
    vhost: String,
}

impl AmqpTarget {
    /// Target on the default virtual host.
    pub fn new(host: &str, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.to_string(),
            port,
            credentials,
            vhost: DEFAULT_VHOST.to_string(),
        }
    }

    /// Same target on another virtual host.
    #[must_use]
    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_string();
        self
    }

    /// Broker host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Mapped AMQP port.
    pub const fn port(&self) -> u16 {
        self.port
    }

    fn uri(&self) -> String {
        let vhost = if self.vhost == DEFAULT_VHOST {
            "%2f"
        } else {
            self.vhost.as_str()
        };
        format!(
            "amqp://{}:{}@{}:{}/{vhost}",
            self.credentials.username(),
            self.credentials.password(),
            self.host,
            self.port
        )
    }
}

impl fmt::Debug for AmqpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// One message to publish, with the binding that should route it.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Exchange to publish to.
    pub exchange: String,
    /// Routing key used both for the binding and the message.
    pub routing_key: RoutingKey,
    /// Queue declared and bound before publishing.
    pub queue: String,
    /// Message body.
    pub payload: Vec<u8>,
}

impl PublishRequest {
    /// Request against the broker's built-in topic exchange.
    pub fn topic(routing_key: RoutingKey, queue: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            exchange: TOPIC_EXCHANGE.to_string(),
            routing_key,
            queue: queue.into(),
            payload,
        }
    }
}

/// What the broker did with a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Routed to at least one queue.
    Routed,
    /// Mandatory message matched no binding and came back.
    Returned {
        /// AMQP reply code, 312 for `NO_ROUTE`.
        reply_code: u16,
        /// Broker explanation.
        reply_text: String,
    },
}

/// A confirm-mode AMQP channel.
pub struct EventPublisher {
    connection: Connection,
    channel: Channel,
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("connected", &self.connection.status().connected())
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    /// Open a connection and a channel with publisher confirms enabled.
    #[instrument(name = "publisher.connect", skip(target), fields(host = %target.host, port = target.port))]
    pub async fn connect(target: &AmqpTarget) -> Result<Self, PublishError> {
        let connection = Connection::connect(&target.uri(), ConnectionProperties::default())
            .await
            .map_err(|source| PublishError::Connection {
                host: target.host.clone(),
                port: target.port,
                source,
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(channel_error("create_channel"))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error("confirm_select"))?;

        info!("[publisher.connect] connected with publisher confirms");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declare and bind `request.queue`, publish as mandatory, and wait for the
    /// broker's confirmation.
    #[instrument(
        name = "publisher.publish",
        skip(self, request),
        fields(exchange = %request.exchange, routing_key = %request.routing_key, queue = %request.queue)
    )]
    pub async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishError> {
        let _queue = self
            .channel
            .queue_declare(
                &request.queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error("queue_declare"))?;

        self.channel
            .queue_bind(
                &request.queue,
                &request.exchange,
                request.routing_key.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error("queue_bind"))?;

        let confirmation = self
            .channel
            .basic_publish(
                &request.exchange,
                request.routing_key.as_str(),
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &request.payload,
                BasicProperties::default(),
            )
            .await
            .map_err(channel_error("basic_publish"))?
            .await
            .map_err(channel_error("publisher_confirm"))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => {
                info!(
                    bytes = request.payload.len(),
                    "[publisher.publish] message routed"
                );
                Ok(PublishOutcome::Routed)
            }
            Confirmation::Ack(Some(returned)) => {
                let reply_text = returned.reply_text.as_str().to_string();
                warn!(
                    reply_code = returned.reply_code,
                    reply_text = %reply_text,
                    "[publisher.publish] mandatory message was returned unroutable"
                );
                Ok(PublishOutcome::Returned {
                    reply_code: returned.reply_code,
                    reply_text,
                })
            }
            Confirmation::Nack(_) => {
                warn!("[publisher.publish] broker rejected message");
                Err(PublishError::Rejected {
                    exchange: request.exchange.clone(),
                    routing_key: request.routing_key.to_string(),
                })
            }
        }
    }

    /// Wait until `queue` exists with at least one consumer; returns the
    /// consumer count.
    ///
    /// Each attempt uses a throwaway channel, since a passive declare of a
    /// missing queue closes the channel it ran on.
    #[instrument(name = "publisher.wait_for_consumers", skip(self, policy))]
    pub async fn wait_for_consumers(
        &self,
        queue: &str,
        policy: &PollPolicy,
    ) -> Result<u32, PublishError> {
        let outcome = retry_until_deadline(policy, "queue has consumers", || async {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|error| error.to_string())?;
            let declared = channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|error| error.to_string())?;
            let _ = channel.close(200, "passive declare done").await;

            match declared.consumer_count() {
                0 => Err(format!("queue {queue} has no consumers")),
                consumers => Ok(consumers),
            }
        })
        .await;

        match outcome {
            Ok(consumers) => {
                info!(consumers, "[publisher.wait_for_consumers] consumer attached");
                Ok(consumers)
            }
            Err(exhausted) => Err(no_consumer(queue, &exhausted)),
        }
    }

    /// Close channel and connection.
    pub async fn close(self) -> Result<(), PublishError> {
        self.channel
            .close(200, "done")
            .await
            .map_err(channel_error("channel_close"))?;
        self.connection
            .close(200, "done")
            .await
            .map_err(channel_error("connection_close"))
    }
}

fn no_consumer(queue: &str, exhausted: &Exhausted<String>) -> PublishError {
    warn!(
        queue,
        attempts = exhausted.attempts,
        last_error = %exhausted.last_error,
        "[publisher.wait_for_consumers] gave up waiting for a consumer"
    );
    PublishError::NoConsumer {
        queue: queue.to_string(),
        waited: exhausted.waited,
    }
}

fn channel_error(operation: &'static str) -> impl Fn(lapin::Error) -> PublishError {
    move |source| PublishError::Channel { operation, source }
}
