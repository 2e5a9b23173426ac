pub mod conf;
pub mod health;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod transform;
pub mod worker;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

pub use crate::conf::{Config, FailurePolicy};
pub use crate::health::{HealthState, HealthStatus, SharedHealthState, run_health_server};
pub use crate::logging::{LogFormat, init_logging};
pub use crate::model::{ChatAttachmentPayload, ConsumedEnvelope, FormattedMessage, KillmailEvent};
pub use crate::pipeline::{Acknowledger, PipelineError, process_delivery};
pub use crate::publish::{AmqpPublisher, PublishError, Publisher};
pub use crate::transform::{EveImageServer, ImageLinkBuilder, KillmailTransformer};
pub use crate::worker::{BrokerSession, KillmailWorker, wait_for_shutdown};

/// Run the worker until shutdown, reopening the broker session whenever it breaks.
///
/// # Errors
/// Never returns an error under normal operation; the signature allows composing
/// it with other fallible tasks.
pub async fn run_with_recovery(
    config: Config,
    health_state: SharedHealthState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            connected = KillmailWorker::connect(config.clone(), health_state.clone()) => connected,
            () = wait_for_shutdown(&mut shutdown) => break,
        };

        match connected {
            Ok(worker) => {
                info!(event = "worker_created", "Worker connected, processing killmails");

                match worker.run(shutdown.clone()).await {
                    Ok(()) => info!(event = "worker_stopped", "Worker stopped"),
                    Err(e) => error!(
                        event = "worker_error",
                        error = ?e,
                        "Worker stopped with an error"
                    ),
                }
            }
            Err(e) => {
                error!(
                    event = "worker_creation_failed",
                    error = ?e,
                    "Failed to connect worker"
                );
                health::set_status(&health_state, HealthStatus::Unhealthy).await;
            }
        }

        if *shutdown.borrow() {
            break;
        }

        info!(
            event = "worker_reconnecting",
            delay_secs = RECONNECT_DELAY.as_secs(),
            "Reconnecting after delay"
        );
        tokio::select! {
            () = time::sleep(RECONNECT_DELAY) => {}
            () = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    Ok(())
}

/// Run the worker and the health server until `shutdown` completes.
///
/// On shutdown the worker is asked to stop and awaited, so the broker session is
/// closed before this returns.
///
/// # Errors
/// Returns an error if the health server fails to bind or serve.
pub async fn run_until<S>(config: Config, health_state: SharedHealthState, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    info!(
        event = "config_loaded",
        amqp_url = %conf::redact_credentials(&config.amqp_url),
        queue = %config.queue,
        exchange = %config.exchange,
        publish_routing_key = %config.publish_routing_key,
        health_port = config.health_port,
        "Configuration loaded"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let health_server = run_health_server(config.health_port, health_state.clone());
    let worker = run_with_recovery(config, health_state, stop_rx);

    tokio::pin!(health_server);
    tokio::pin!(worker);
    tokio::pin!(shutdown);

    let health_result = tokio::select! {
        result = &mut health_server => {
            error!(event = "health_server_failed", error = ?result, "Health server failed");
            result.context("Health server failed")
        }
        result = &mut worker => {
            error!(event = "worker_failed", error = ?result, "Worker loop exited");
            return result.context("Worker loop failed");
        }
        () = &mut shutdown => {
            info!(event = "shutdown_signal", "Received shutdown signal, stopping worker");
            Ok(())
        }
    };

    let _ = stop_tx.send(true);
    if let Err(e) = worker.await {
        error!(event = "worker_failed", error = ?e, "Worker loop failed during shutdown");
    }

    info!(event = "application_stopped", "Shutdown complete");
    health_result
}
/// Runs until Ctrl-C.
///
/// # Errors
/// Propagates errors from [`run_until`].
pub async fn run_with_ctrl_c(config: Config, health_state: SharedHealthState) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(event = "signal_error", error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    run_until(config, health_state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_broker() -> Config {
        Config {
            amqp_url: "amqp://127.0.0.1:1/%2f".to_string(),
            exchange: "regner".to_string(),
            queue: "slack-format-zkillboard".to_string(),
            publish_routing_key: "slack.send.webhook".to_string(),
            consumer_tag: "test".to_string(),
            failure_policy: FailurePolicy::Redeliver,
            image_server_url: transform::DEFAULT_IMAGE_SERVER_URL.to_string(),
            killboard_url: transform::DEFAULT_KILLBOARD_URL.to_string(),
            health_port: 0,
        }
    }

    #[tokio::test]
    async fn recovery_loop_returns_once_shutdown_is_signalled() {
        let (tx, rx) = watch::channel(false);
        let recovery = run_with_recovery(unreachable_broker(), SharedHealthState::default(), rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(recovery, stop)
        })
        .await
        .expect("recovery loop should stop on shutdown");
        result.unwrap();
    }

    #[tokio::test]
    async fn run_until_waits_for_worker_then_returns() {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_until(
                unreachable_broker(),
                SharedHealthState::default(),
                std::future::ready(()),
            ),
        )
        .await
        .expect("run_until should stop on shutdown");

        assert!(result.is_ok());
    }
}
