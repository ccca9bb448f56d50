use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Base directory for location databases (default: ./quire_data)
    pub data_dir: PathBuf,
    /// Keepalive probe interval (default: 30s)
    pub ping_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir =
            PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./quire_data".to_string()));

        let ping_interval_secs: u64 = env::var("PING_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPingInterval)?;
        if ping_interval_secs == 0 {
            return Err(ConfigError::InvalidPingInterval);
        }

        Ok(Config {
            host,
            port,
            data_dir,
            ping_interval: Duration::from_secs(ping_interval_secs),
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidPingInterval,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidPingInterval => {
                write!(f, "Invalid PING_INTERVAL_SECS environment variable")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
