use crate::model::{ConsumedEnvelope, StructuralError};
use crate::publish::{PublishError, Publisher};
use crate::transform::{ImageLinkBuilder, KillmailTransformer};
use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("publish failed for killmail {kill_id}: {source}")]
    Publish {
        kill_id: u64,
        #[source]
        source: PublishError,
    },
    #[error("failed to acknowledge killmail {kill_id}: {source}")]
    Ack {
        kill_id: u64,
        #[source]
        source: lapin::Error,
    },
}

impl PipelineError {
    /// Failures that say nothing about the message itself and mean the broker
    /// session should be reopened.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Publish {
                source: PublishError::Broker(_),
                ..
            } | PipelineError::Ack { .. }
        )
    }
}

/// Settles an inbound delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;

    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
        Acker::nack(
            self,
            BasicNackOptions {
                requeue,
                multiple: false,
            },
        )
        .await
    }
}

/// Decodes, formats and republishes a single delivery, acknowledging it only
/// after the formatted message has been handed to the broker.
///
/// Returns the kill id of the processed killmail. On any error the delivery is
/// left unacknowledged; settling it is up to the caller.
///
/// # Errors
/// See [`PipelineError`].
pub async fn process_delivery<I, P, A>(
    body: &[u8],
    transformer: &KillmailTransformer<I>,
    publisher: &P,
    acker: &A,
) -> Result<u64, PipelineError>
where
    I: ImageLinkBuilder,
    P: Publisher + ?Sized,
    A: Acknowledger + ?Sized,
{
    let envelope: ConsumedEnvelope = serde_json::from_slice(body)?;
    let kill_id = envelope.zkb_data.kill_id;

    let formatted = transformer.transform(&envelope)?;
    info!(
        event = "killmail_formatted",
        kill_id,
        kill = envelope.kill,
        "Formatted a Slack message for killmail"
    );

    publisher
        .publish(&formatted)
        .await
        .map_err(|source| PipelineError::Publish { kill_id, source })?;

    acker
        .ack()
        .await
        .map_err(|source| PipelineError::Ack { kill_id, source })?;

    Ok(kill_id)
}
