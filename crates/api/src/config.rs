//! Server configuration read from the environment at startup.

use conveyor_core::config::{env_or, env_var};
use conveyor_events::DEFAULT_MAX_RETRIES;
use conveyor_events::SubscribeOptions;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Registry keys of the brokers to run; each one becomes a `{service}`
    /// path segment of the publish endpoint.
    pub broker_backends: Vec<String>,
    /// Exchange/stream used when a publish request names none.
    pub default_destination: String,
    pub default_max_retries: u32,
    /// `memory` or `redis`.
    pub job_tracker: String,
    /// `destination:routing_key` pairs consumed with the logging handler.
    pub subscriptions: Vec<SubscribeOptions>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            broker_backends: vec!["redis".to_string()],
            default_destination: "navigator".to_string(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            job_tracker: "memory".to_string(),
            subscriptions: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_var("BIND_ADDR").unwrap_or(d.bind_addr),
            broker_backends: env_var("BROKER_BACKEND")
                .map(|raw| split_list(&raw))
                .unwrap_or(d.broker_backends),
            default_destination: env_var("BROKER_DEFAULT_DESTINATION").unwrap_or(d.default_destination),
            default_max_retries: env_or("BROKER_MAX_RETRIES", d.default_max_retries),
            job_tracker: env_var("JOB_TRACKER").unwrap_or(d.job_tracker),
            subscriptions: env_var("BROKER_SUBSCRIPTIONS")
                .map(|raw| parse_subscriptions(&raw))
                .unwrap_or_default(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_subscriptions(raw: &str) -> Vec<SubscribeOptions> {
    raw.split(',')
        .filter_map(|pair| {
            let (destination, routing_key) = pair.trim().split_once(':')?;
            let destination = destination.trim();
            (!destination.is_empty()).then(|| SubscribeOptions::new(destination, routing_key.trim()))
        })
        .collect()
}
