use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::adapters::WsConfig;
use crate::core::{ChatConfig, RelayError};

/// Settings for one relay worker.
///
/// Sources, later ones winning: built-in defaults, an optional `config/default.*` file,
/// `CHAT_*` environment variables, and a bare `PORT` variable.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// sqlx connection string for the message store.
    pub database_url: String,
    pub delete_code: String,
    /// Per-connection outbox size and fanout bus capacity.
    pub channel_capacity: usize,
    /// Seconds a dropped session stays resumable.
    pub recovery_window_secs: u64,
    pub max_db_connections: u32,
}

impl RelayConfig {
    pub fn load() -> Result<Self, RelayError> {
        let config = Self::builder(std::env::var("PORT").ok())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("CHAT"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn builder(port: Option<String>) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 3000)?
            .set_default("database_url", "sqlite://chat.db")?
            .set_default("delete_code", "bestspark")?
            .set_default("channel_capacity", 1024)?
            .set_default("recovery_window_secs", 120)?
            .set_default("max_db_connections", 5)?
            .set_override_option("port", port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn chat(&self) -> ChatConfig {
        ChatConfig {
            delete_code: self.delete_code.clone(),
        }
    }

    pub fn ws(&self) -> WsConfig {
        WsConfig {
            channel_capacity: self.channel_capacity,
            recovery_window: Duration::from_secs(self.recovery_window_secs),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: "sqlite://chat.db".to_string(),
            delete_code: "bestspark".to_string(),
            channel_capacity: 1024,
            recovery_window_secs: 120,
            max_db_connections: 5,
        }
    }
}
