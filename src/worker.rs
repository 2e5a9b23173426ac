use crate::conf::{Config, FailurePolicy, redact_credentials};
use crate::health::{HealthStatus, SharedHealthState, set_status};
use crate::pipeline::{Acknowledger, PipelineError, process_delivery};
use crate::publish::AmqpPublisher;
use crate::transform::{EveImageServer, KillmailTransformer};
use anyhow::{Context, anyhow};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

/// At most one unacknowledged delivery is handed to this worker at a time.
const PREFETCH: u16 = 1;

/// One broker connection and the single channel used for both consuming and
/// publishing.
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    /// Connects with exponential backoff (10 attempts, 1s doubling up to 30s), then
    /// opens a channel in confirm mode with a prefetch of one.
    ///
    /// # Errors
    /// Fails when no connection could be established or the channel could not be
    /// configured.
    pub async fn open(uri: &str) -> anyhow::Result<Self> {
        let connection = connect_with_retry(uri).await?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Closes the channel and connection. Unacknowledged deliveries go back to
    /// the queue.
    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            warn!(event = "channel_close_failed", error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            warn!(event = "connection_close_failed", error = %e, "Failed to close connection");
        }
        info!(event = "session_closed", "Broker session closed");
    }
}

async fn connect_with_retry(uri: &str) -> anyhow::Result<Connection> {
    const MAX_RETRIES: u8 = 10;
    const INITIAL_DELAY: Duration = Duration::from_secs(1);
    const MAX_DELAY: Duration = Duration::from_secs(30);

    let sanitized_uri = redact_credentials(uri);
    let mut delay = INITIAL_DELAY;

    for attempt in 1..=MAX_RETRIES {
        info!(
            event = "broker_connecting",
            attempt,
            max_attempts = MAX_RETRIES,
            uri = %sanitized_uri,
            "Connecting to RabbitMQ"
        );

        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(connection) => {
                info!(event = "broker_connected", attempt, "Connected to RabbitMQ");
                return Ok(connection);
            }
            Err(e) if attempt < MAX_RETRIES => {
                warn!(
                    event = "broker_connect_failed",
                    attempt,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Connection attempt failed"
                );
                time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_DELAY);
            }
            Err(e) => {
                error!(event = "broker_connect_gave_up", error = %e, "Giving up on RabbitMQ");
                return Err(e).context(format!(
                    "Failed to connect to {sanitized_uri} after {MAX_RETRIES} attempts"
                ));
            }
        }
    }
    Err(anyhow!("Exhausted all connection retries"))
}

/// Resolves once `true` has been sent on the shutdown channel, or the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Consumes killmail envelopes, republishes them as Slack messages and
/// acknowledges each delivery once its formatted message is with the broker.
pub struct KillmailWorker {
    session: BrokerSession,
    publisher: AmqpPublisher,
    transformer: KillmailTransformer<EveImageServer>,
    config: Config,
    health_state: SharedHealthState,
}

impl KillmailWorker {
    /// # Errors
    /// Fails when the broker session cannot be opened.
    pub async fn connect(config: Config, health_state: SharedHealthState) -> anyhow::Result<Self> {
        set_status(&health_state, HealthStatus::Starting).await;

        info!(
            event = "worker_starting",
            queue = %config.queue,
            exchange = %config.exchange,
            routing_key = %config.publish_routing_key,
            failure_policy = ?config.failure_policy,
            "Starting killmail formatter"
        );

        let session = BrokerSession::open(&config.amqp_url)
            .await
            .context("RabbitMQ session failed")?;
        let publisher = AmqpPublisher::new(
            session.channel().clone(),
            config.exchange.clone(),
            config.publish_routing_key.clone(),
        );
        let transformer = KillmailTransformer::new(
            EveImageServer::new(config.image_server_url.clone()),
            config.killboard_url.clone(),
        );

        set_status(&health_state, HealthStatus::Healthy).await;

        Ok(Self {
            session,
            publisher,
            transformer,
            config,
            health_state,
        })
    }

    /// Runs until shutdown is requested, the consumer stream ends or the broker
    /// session breaks. The session is closed on every path.
    ///
    /// A delivery already being processed is finished before shutdown is honored.
    ///
    /// # Errors
    /// Returns an error describing why consumption stopped, unless it stopped
    /// because of shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let result = self.consume_all(&mut shutdown).await;
        set_status(&self.health_state, HealthStatus::Unhealthy).await;
        self.session.close().await;
        result
    }

    async fn consume_all(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut consumer = self
            .session
            .channel()
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming")?;

        info!(
            event = "consumer_started",
            queue = %self.config.queue,
            "Waiting for killmails"
        );

        loop {
            let delivery = tokio::select! {
                delivery = consumer.next() => delivery,
                () = wait_for_shutdown(shutdown) => {
                    info!(event = "consumer_stopping", "Shutdown requested, stopping consumer");
                    return Ok(());
                }
            };

            let Some(delivery) = delivery else {
                warn!(event = "consumer_ended", "Consumer stream ended");
                return Err(anyhow!("Consumer stream ended unexpectedly"));
            };

            if !self.session.is_connected() {
                error!(event = "connection_lost", "Connection lost, stopping consumer loop");
                return Err(anyhow!("Connection lost during message processing"));
            }

            let delivery = delivery.context("Consumer error")?;
            self.handle(&delivery).await?;
        }
    }

    /// Processes one delivery. Returns an error only when the session is no
    /// longer usable.
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let outcome = process_delivery(
            &delivery.data,
            &self.transformer,
            &self.publisher,
            &delivery.acker,
        )
        .await;

        match outcome {
            Ok(kill_id) => {
                self.health_state.write().await.record_formatted(kill_id);
                Ok(())
            }
            Err(e) => {
                self.health_state.write().await.record_failure();
                settle_failure(
                    self.config.failure_policy,
                    &delivery.acker,
                    delivery.delivery_tag,
                    delivery.redelivered,
                    e,
                )
                .await
            }
        }
    }
}

/// Whether a failed delivery goes back on the queue.
pub fn requeue_on_failure(policy: FailurePolicy) -> bool {
    match policy {
        FailurePolicy::Redeliver => true,
        FailurePolicy::Reject => false,
    }
}

/// Settles a delivery whose processing failed.
///
/// Connection failures are not settled: the error is returned so the caller
/// tears the session down and the broker requeues the delivery.
///
/// # Errors
/// Returns an error for connection failures or when the nack itself fails.
pub async fn settle_failure<A>(
    policy: FailurePolicy,
    acker: &A,
    delivery_tag: u64,
    redelivered: bool,
    e: PipelineError,
) -> anyhow::Result<()>
where
    A: Acknowledger + ?Sized,
{
    error!(
        event = "killmail_failed",
        delivery_tag,
        redelivered,
        error = %e,
        "Failed to process delivery"
    );

    if e.is_connection_failure() {
        return Err(anyhow::Error::new(e).context("Broker session broken"));
    }

    let requeue = requeue_on_failure(policy);
    if requeue && redelivered {
        warn!(
            event = "poison_message",
            delivery_tag,
            error = %e,
            "Delivery failed again after redelivery and will be requeued"
        );
    }

    acker
        .nack(requeue)
        .await
        .with_context(|| format!("Failed to nack delivery {delivery_tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StructuralError;
    use crate::publish::PublishError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingAcker {
        acks: Mutex<usize>,
        nacks: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), lapin::Error> {
            *self.acks.lock().unwrap() += 1;
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
            self.nacks.lock().unwrap().push(requeue);
            Ok(())
        }
    }

    fn unformattable() -> PipelineError {
        PipelineError::Structural(StructuralError::NoAttackers { kill_id: 7 })
    }

    fn broker_nacked() -> PipelineError {
        PipelineError::Publish {
            kill_id: 7,
            source: PublishError::Nacked {
                exchange: "regner".into(),
                routing_key: "slack.send.webhook".into(),
            },
        }
    }

    #[test]
    fn policy_decides_requeue() {
        assert!(requeue_on_failure(FailurePolicy::Redeliver));
        assert!(!requeue_on_failure(FailurePolicy::Reject));
    }

    #[tokio::test]
    async fn redeliver_nacks_with_requeue() {
        let acker = RecordingAcker::default();

        settle_failure(FailurePolicy::Redeliver, &acker, 1, false, unformattable())
            .await
            .unwrap();
        settle_failure(FailurePolicy::Redeliver, &acker, 2, true, broker_nacked())
            .await
            .unwrap();

        assert_eq!(*acker.nacks.lock().unwrap(), [true, true]);
        assert_eq!(*acker.acks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn reject_nacks_without_requeue() {
        let acker = RecordingAcker::default();

        settle_failure(FailurePolicy::Reject, &acker, 1, true, unformattable())
            .await
            .unwrap();

        assert_eq!(*acker.nacks.lock().unwrap(), [false]);
        assert_eq!(*acker.acks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn connection_failures_are_left_unsettled() {
        let acker = RecordingAcker::default();

        for policy in [FailurePolicy::Redeliver, FailurePolicy::Reject] {
            for e in [
                PipelineError::Publish {
                    kill_id: 7,
                    source: PublishError::Broker(lapin::Error::ChannelsLimitReached),
                },
                PipelineError::Ack {
                    kill_id: 7,
                    source: lapin::Error::ChannelsLimitReached,
                },
            ] {
                assert!(e.is_connection_failure());
                let err = settle_failure(policy, &acker, 1, false, e).await.unwrap_err();
                assert!(format!("{err:#}").contains("Broker session broken"));
            }
        }

        assert!(acker.nacks.lock().unwrap().is_empty());
        assert_eq!(*acker.acks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_wait_resolves_on_signal_or_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown should be observed")
            .unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .expect("dropped sender counts as shutdown");
    }
}
