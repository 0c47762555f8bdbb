use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::poll::PollOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Docker Engine endpoint; the local socket is used when unset
    #[serde(default)]
    pub docker_host: Option<String>,

    #[serde(default = "default_network_name")]
    pub network_name: String,

    #[serde(default = "default_image_repository")]
    pub image_repository: String,

    #[serde(default = "default_mgmt_port")]
    pub mgmt_port: u16,

    #[serde(default = "default_query_port")]
    pub query_port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,

    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_removal_poll_ms")]
    pub removal_poll_ms: u64,

    #[serde(default = "default_removal_timeout_secs")]
    pub removal_timeout_secs: u64,

    #[serde(default = "default_expiry_minutes")]
    pub default_expiry_minutes: u64,

    #[serde(default)]
    pub creator: Option<String>,
}

fn default_network_name() -> String {
    "dynocluster".to_string()
}

fn default_image_repository() -> String {
    "couchbase/server".to_string()
}

fn default_mgmt_port() -> u16 {
    8091
}

fn default_query_port() -> u16 {
    8093
}

fn default_username() -> String {
    "Administrator".to_string()
}

fn default_password() -> String {
    "password".to_string()
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

fn default_readiness_timeout_secs() -> u64 {
    300
}

fn default_removal_poll_ms() -> u64 {
    100
}

fn default_removal_timeout_secs() -> u64 {
    120
}

fn default_expiry_minutes() -> u64 {
    60
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DYNOCLUSTER").try_parsing(true))
            .build()?;

        let settings: Config = config
            .try_deserialize()
            .unwrap_or_else(|_| Config::default());

        Ok(settings)
    }

    pub fn readiness_poll(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_millis(self.readiness_interval_ms),
            Duration::from_secs(self.readiness_timeout_secs),
        )
    }

    pub fn removal_poll(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_millis(self.removal_poll_ms),
            Duration::from_secs(self.removal_timeout_secs),
        )
    }

    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry_minutes * 60)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_host: None,
            network_name: default_network_name(),
            image_repository: default_image_repository(),
            mgmt_port: default_mgmt_port(),
            query_port: default_query_port(),
            username: default_username(),
            password: default_password(),
            readiness_interval_ms: default_readiness_interval_ms(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            removal_poll_ms: default_removal_poll_ms(),
            removal_timeout_secs: default_removal_timeout_secs(),
            default_expiry_minutes: default_expiry_minutes(),
            creator: None,
        }
    }
}
