use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::hub::{DispatcherConfig, ExceptTokenMode};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Deadline for one dispatch in seconds, from scheduling
    #[serde(default = "default_dispatch_deadline")]
    pub dispatch_deadline_secs: u64,
    /// What "send to all except a token" does
    #[serde(default)]
    pub except_token_mode: ExceptTokenMode,
    /// Cookie carrying the client credential on connect
    #[serde(default = "default_credential_cookie")]
    pub credential_cookie: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Outbound buffer per connection
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// How long a send may wait for buffer space before timing out (ms)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

/// Token to identity table for the static resolver.
/// Empty means no resolver is installed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub mappings: HashMap<String, Uuid>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_dispatch_deadline() -> u64 {
    15
}

fn default_credential_cookie() -> String {
    "X-Token".to_string()
}

fn default_channel_buffer_size() -> usize {
    32
}

fn default_send_timeout() -> u64 {
    5000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("relay.dispatch_deadline_secs", 15)?
            .set_default("relay.except_token_mode", "disabled")?
            .set_default("relay.credential_cookie", "X-Token")?
            .set_default("websocket.channel_buffer_size", 32)?
            .set_default("websocket.send_timeout_ms", 5000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER__PORT, RELAY__DISPATCH_DEADLINE_SECS, API__KEY, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            deadline: Duration::from_secs(self.relay.dispatch_deadline_secs),
            except_token_mode: self.relay.except_token_mode,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.websocket.send_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_deadline_secs: default_dispatch_deadline(),
            except_token_mode: ExceptTokenMode::default(),
            credential_cookie: default_credential_cookie(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_channel_buffer_size(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8081);
        assert_eq!(settings.relay.credential_cookie, "X-Token");
        assert_eq!(settings.relay.except_token_mode, ExceptTokenMode::Disabled);
        assert!(settings.identity.mappings.is_empty());
    }

    #[test]
    fn test_dispatcher_config_uses_fifteen_second_deadline() {
        let config = Settings::default().dispatcher_config();
        assert_eq!(config.deadline, Duration::from_secs(15));
        assert_eq!(config.except_token_mode, ExceptTokenMode::Disabled);
    }

    #[test]
    fn test_except_token_mode_parses_from_config() {
        let relay: RelayConfig = Config::builder()
            .set_override("except_token_mode", "exclude_token")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(relay.except_token_mode, ExceptTokenMode::ExcludeToken);
        assert_eq!(relay.dispatch_deadline_secs, 15);
    }
}
