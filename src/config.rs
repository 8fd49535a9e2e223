//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Seconds to wait for in-flight requests once shutdown begins
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (created if missing)
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: u64,
    /// PBKDF2 rounds for newly hashed passwords
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"[REDACTED]")
            .field("token_expiry_secs", &self.token_expiry_secs)
            .field("hash_iterations", &self.hash_iterations)
            .finish()
    }
}

/// Post ingestion pipeline settings. Fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Max posts queued ahead of the batch worker before submissions are rejected
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
    /// Posts per commit before a forced flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Timer period bounding how long a post waits in a partial batch (0 disables the timer)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    8
}

fn default_token_expiry_secs() -> u64 {
    24 * 3600
}

fn default_hash_iterations() -> u32 {
    100_000
}

fn default_intake_capacity() -> usize {
    200
}

fn default_max_batch_size() -> usize {
    300
}

fn default_flush_interval_ms() -> u64 {
    50
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("WARBLER").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // Both or neither must be set
        let has_cert = !self.server.tls_cert.is_empty();
        let has_key = !self.server.tls_key.is_empty();
        if has_cert != has_key {
            anyhow::bail!("TLS configuration incomplete: both tls_cert and tls_key must be set, or neither");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.auth.jwt_secret.len() < 32 {
            anyhow::bail!("auth.jwt_secret must be at least 32 bytes");
        }
        if self.auth.token_expiry_secs == 0 {
            anyhow::bail!("auth.token_expiry_secs must be positive");
        }
        if self.auth.hash_iterations == 0 {
            anyhow::bail!("auth.hash_iterations must be positive");
        }

        if self.ingest.intake_capacity == 0 {
            anyhow::bail!("ingest.intake_capacity must be at least 1");
        }
        if self.ingest.max_batch_size == 0 {
            anyhow::bail!("ingest.max_batch_size must be at least 1");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                tls_cert: String::new(),
                tls_key: String::new(),
                shutdown_grace_secs: 10,
            },
            database: DatabaseConfig {
                url: "warbler.db".to_string(),
                max_connections: 4,
            },
            auth: AuthConfig {
                jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
                token_expiry_secs: 3600,
                hash_iterations: 1000,
            },
            ingest: IngestConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }

    #[test]
    fn sample_config_is_valid() {
        assert!(sample().validate().is_ok());
        assert!(!sample().tls_enabled());
    }

    #[test]
    fn rejects_short_jwt_secret() {
        let mut config = sample();
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_half_configured_tls() {
        let mut config = sample();
        config.server.tls_cert = "cert.pem".to_string();
        assert!(config.validate().is_err());

        config.server.tls_key = "key.pem".to_string();
        assert!(config.validate().is_ok());
        assert!(config.tls_enabled());
    }

    #[test]
    fn rejects_zero_sized_pipeline() {
        let mut config = sample();
        config.ingest.intake_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.ingest.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ingest_defaults() {
        let ingest = IngestConfig::default();
        assert_eq!(ingest.intake_capacity, 200);
        assert_eq!(ingest.max_batch_size, 300);
        assert_eq!(ingest.flush_interval(), Duration::from_millis(50));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = sample();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
