//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or `DARKROOM_CONFIG` environment variable.
//!
//! Sources are merged in order (later overrides earlier):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `DARKROOM_`
//! 3. **DATABASE_URL** - Special case: overrides `database_url` if set
//!
//! For nested values, use double underscores in environment variables:
//! `DARKROOM_WORKERS__GENERATION__CONCURRENCY=8` sets
//! `workers.generation.concurrency`.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DARKROOM_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// PostgreSQL connection string
    pub database_url: String,
    /// Credits granted to a newly created account
    pub initial_account_balance: Decimal,
    /// Maximum number of assets a single generation request may create
    pub max_assets_per_request: u32,
    /// Worker daemon settings for both pipeline stages
    pub workers: WorkersConfig,
    /// Blob storage backend for materialized outputs
    pub blob: BlobConfig,
    /// Provider adapter credentials; unset providers are not registered
    pub providers: ProvidersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: "postgresql://localhost/darkroom".to_string(),
            initial_account_balance: Decimal::ZERO,
            max_assets_per_request: 8,
            workers: WorkersConfig::default(),
            blob: BlobConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment.
    pub fn load(args: &Args) -> Result<Self, Error> {
        let mut figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("DARKROOM_").split("__"));

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            figment = figment.merge(("database_url", database_url));
        }

        let config: Config = figment
            .extract()
            .map_err(|e| Error::BadRequest {
                message: format!("Invalid configuration: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_assets_per_request == 0 {
            return Err(Error::BadRequest {
                message: "max_assets_per_request must be at least 1".to_string(),
            });
        }
        if self.workers.generation.max_attempts == 0
            || self.workers.materialization.max_attempts == 0
        {
            return Err(Error::BadRequest {
                message: "worker max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-stage daemon settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    /// Jobs processed concurrently by this stage's daemon
    pub concurrency: usize,
    /// Maximum jobs claimed per iteration
    pub claim_batch_size: usize,
    /// Sleep between claim iterations when the queue is idle (ms)
    pub claim_interval_ms: u64,
    /// Attempt budget for this stage (authoritative for generation: the
    /// asset row's counter is compared against this)
    pub max_attempts: u32,
    /// Base retry backoff (ms), grown exponentially
    pub backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_factor: u64,
    /// Backoff ceiling (ms)
    pub max_backoff_ms: u64,
    /// Claims older than this are treated as orphaned by a crashed worker (ms)
    pub stale_claim_after_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            claim_batch_size: 20,
            claim_interval_ms: 1000,
            max_attempts: 3,
            backoff_ms: 2000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            stale_claim_after_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    pub generation: StageConfig,
    pub materialization: StageConfig,
    /// Outputs smaller than this many bytes are rejected as upstream
    /// errors during materialization
    pub min_output_bytes: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            generation: StageConfig::default(),
            materialization: StageConfig {
                // I/O-bound and cheap; drain faster than generation
                concurrency: 10,
                ..StageConfig::default()
            },
            min_output_bytes: 64,
        }
    }
}

/// Blob storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BlobConfig {
    /// S3-compatible object storage (S3, R2, minio)
    S3 {
        bucket: String,
        /// Public base URL the bucket is served from
        public_base_url: String,
        /// Custom endpoint for R2/minio; omit for AWS
        endpoint: Option<String>,
    },
    /// Local filesystem, for development
    Local {
        directory: std::path::PathBuf,
        public_base_url: String,
    },
}

impl Default for BlobConfig {
    fn default() -> Self {
        BlobConfig::Local {
            directory: std::path::PathBuf::from("./blobs"),
            public_base_url: "http://localhost:3000/files".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    pub openai: Option<OpenAiConfig>,
    pub fal: Option<FalConfig>,
    /// Register the offline dummy provider (development only)
    pub dummy_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FalConfig {
    pub api_key: String,
    #[serde(default = "default_fal_base_url")]
    pub base_url: String,
    /// Publicly reachable base URL of this service, for webhook delivery
    pub webhook_base_url: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_fal_base_url() -> String {
    "https://queue.fal.run".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    300_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers.generation.concurrency, 5);
        assert_eq!(config.workers.materialization.concurrency, 10);
    }

    #[test]
    fn yaml_and_env_are_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
                port: 8080
                workers:
                  generation:
                    concurrency: 2
                providers:
                  dummy_enabled: true
                "#,
            )?;
            jail.set_env("DARKROOM_HOST", "127.0.0.1");
            jail.set_env("DARKROOM_WORKERS__GENERATION__MAX_ATTEMPTS", "5");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).expect("config should load");

            assert_eq!(config.port, 8080);
            assert_eq!(config.host, "127.0.0.1");
            assert_eq!(config.workers.generation.concurrency, 2);
            assert_eq!(config.workers.generation.max_attempts, 5);
            assert!(config.providers.dummy_enabled);
            Ok(())
        });
    }
}
