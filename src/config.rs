use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default location of the INI configuration file, matching the layout the
/// deployment scripts expect.
pub const DEFAULT_CONFIG_PATH: &str = "data/.mcp-endpoint-server.cfg";

/// Server configuration, read from an INI file with `server`, `websocket`,
/// `security` and `logging` sections. A missing file yields pure defaults;
/// a malformed file is a startup error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared static key guarding the health endpoint.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Seconds before an unanswered fan-out correlation is abandoned.
    pub pending_timeout: u64,
    /// Seconds of inactivity before a connection is closed. `0` disables the
    /// idle sweeper.
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Comma-separated origin list, or `*`.
    pub allowed_origins: String,
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for the rolling log file. Empty disables file logging.
    pub log_dir: String,
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8004,
                key: String::new(),
            },
            websocket: WebSocketConfig {
                pending_timeout: 60,
                idle_timeout: 300,
            },
            security: SecurityConfig {
                allowed_origins: "*".to_string(),
                enable_cors: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_dir: String::new(),
                log_file: "mcp-endpoint-server.log".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from an INI file, filling every unset field with
    /// its default.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8004)?
            .set_default("server.key", "")?
            .set_default("websocket.pending_timeout", 60)?
            .set_default("websocket.idle_timeout", 300)?
            .set_default("security.allowed_origins", "*")?
            .set_default("security.enable_cors", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.log_dir", "")?
            .set_default("logging.log_file", "mcp-endpoint-server.log")?
            .add_source(config::File::new(path, config::FileFormat::Ini).required(false))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
