use crate::model::FormattedMessage;
use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use thiserror::Error;
use tracing::debug;

/// AMQP delivery mode that makes the broker write the message to disk.
const PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode formatted message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker error while publishing: {0}")]
    Broker(#[from] lapin::Error),
    #[error("broker refused message for {exchange}/{routing_key}")]
    Nacked {
        exchange: String,
        routing_key: String,
    },
}

/// Hands formatted messages to the downstream webhook sender.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// # Errors
    /// Fails when the message could not be handed to the broker. No retry is
    /// attempted here.
    async fn publish(&self, message: &FormattedMessage) -> Result<(), PublishError>;
}

/// Publishes JSON bodies to a fixed exchange and routing key.
///
/// The channel is expected to be in confirm mode; a broker nack is reported as
/// [`PublishError::Nacked`].
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl AmqpPublisher {
    pub fn new(
        channel: Channel,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, message: &FormattedMessage) -> Result<(), PublishError> {
        let body = serde_json::to_vec(message)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked {
                exchange: self.exchange.clone(),
                routing_key: self.routing_key.clone(),
            });
        }

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            bytes = body.len(),
            "Published formatted message"
        );
        Ok(())
    }
}
