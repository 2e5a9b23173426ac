use crate::transform::{DEFAULT_IMAGE_SERVER_URL, DEFAULT_KILLBOARD_URL};
use anyhow::{Context, bail};
use std::str::FromStr;

const DEFAULT_BROKER: &str = "rabbitmq-alpha";

/// What to do with a delivery that could not be formatted or published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Negatively acknowledge with requeue so the broker redelivers it. A message
    /// that can never be formatted keeps coming back.
    Redeliver,
    /// Negatively acknowledge without requeue so the broker drops or dead-letters it.
    Reject,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "redeliver" => Ok(FailurePolicy::Redeliver),
            "reject" => Ok(FailurePolicy::Reject),
            other => bail!("unknown failure policy '{other}', expected 'redeliver' or 'reject'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub amqp_url: String,
    pub exchange: String,
    pub queue: String,
    pub publish_routing_key: String,
    pub consumer_tag: String,
    pub failure_policy: FailurePolicy,
    pub image_server_url: String,
    pub killboard_url: String,
    pub health_port: u16,
}

impl Config {
    /// Build a configuration from environment variables.
    ///
    /// All variables are optional: `RABBITMQ_SERVER`, `AMQP_EXCHANGE`, `AMQP_QUEUE`,
    /// `PUBLISH_ROUTING_KEY`, `CONSUMER_TAG`, `FAILURE_POLICY`, `IMAGE_SERVER_URL`,
    /// `KILLBOARD_URL`, `HEALTH_PORT`.
    ///
    /// # Errors
    /// Returns an error if `FAILURE_POLICY` or `HEALTH_PORT` is set to an
    /// unparseable value.
    pub fn from_env() -> anyhow::Result<Self> {
        let failure_policy = match std::env::var("FAILURE_POLICY") {
            Ok(value) => value
                .parse::<FailurePolicy>()
                .context("Invalid FAILURE_POLICY")?,
            Err(_) => FailurePolicy::Redeliver,
        };
        let health_port = match std::env::var("HEALTH_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("Invalid HEALTH_PORT '{value}'"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            amqp_url: normalize_amqp_url(
                &std::env::var("RABBITMQ_SERVER").unwrap_or_else(|_| DEFAULT_BROKER.to_string()),
            ),
            exchange: env_or("AMQP_EXCHANGE", "regner"),
            queue: env_or("AMQP_QUEUE", "slack-format-zkillboard"),
            publish_routing_key: env_or("PUBLISH_ROUTING_KEY", "slack.send.webhook"),
            consumer_tag: env_or("CONSUMER_TAG", "slack-format-zkillboard"),
            failure_policy,
            image_server_url: env_or("IMAGE_SERVER_URL", DEFAULT_IMAGE_SERVER_URL),
            killboard_url: env_or("KILLBOARD_URL", DEFAULT_KILLBOARD_URL),
            health_port,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Accepts either a full AMQP URI or a bare host name.
pub fn normalize_amqp_url(server: &str) -> String {
    let server = server.trim();
    if server.contains("://") {
        server.to_string()
    } else {
        format!("amqp://{server}:5672/%2f")
    }
}

/// Replaces the password in an AMQP URI so it can be logged.
pub fn redact_credentials(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://").map(|i| i + 3) else {
        return uri.to_string();
    };
    let Some(at) = uri[scheme_end..].find('@').map(|i| i + scheme_end) else {
        return uri.to_string();
    };
    match uri[scheme_end..at].split_once(':') {
        Some((user, _)) => format!("{}{user}:***{}", &uri[..scheme_end], &uri[at..]),
        None => uri.to_string(),
    }
}
