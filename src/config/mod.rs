use crate::s3::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// S3 profile: endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// S3 endpoint URL (path-style addressing)
    pub endpoint: String,

    /// AWS access key ID
    pub access_key: String,

    /// AWS secret access key
    pub secret_key: String,

    /// Session token for temporary credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// AWS region (default: us-east-1)
    #[serde(default = "default_region")]
    pub region: String,

    /// Optional default bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Profile {
    /// Credentials described by this profile
    pub fn credentials(&self) -> Credentials {
        match &self.session_token {
            Some(token) => Credentials::temporary(&self.access_key, &self.secret_key, token, None),
            None => Credentials::permanent(&self.access_key, &self.secret_key),
        }
    }
}

/// Transfer engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Objects up to this size go in a single request
    #[serde(default = "default_part_size")]
    pub multipart_threshold: u64,

    /// Size of each multipart part
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Most parts a single object may be split into
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Parts in flight per task
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries per request after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Deadline of a single request, body included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum gap between progress samples of one task
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// How long finished tasks stay queryable
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,

    /// Disable SSL certificate verification
    #[serde(default)]
    pub insecure_tls: bool,
}

fn default_part_size() -> u64 {
    64 * MIB
}

fn default_max_parts() -> u32 {
    crate::transfer::planner::DEFAULT_MAX_PARTS
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_task_ttl_secs() -> u64 {
    600
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_part_size(),
            part_size: default_part_size(),
            max_parts: default_max_parts(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            progress_interval_ms: default_progress_interval_ms(),
            task_ttl_secs: default_task_ttl_secs(),
            insecure_tls: false,
        }
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    /// Apply `S3XFER_*` environment overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        fn read<T: std::str::FromStr>(name: &str, target: &mut T) {
            if let Ok(raw) = std::env::var(name) {
                match raw.trim().parse() {
                    Ok(value) => *target = value,
                    Err(_) => tracing::warn!(name, value = %raw, "ignoring unparseable override"),
                }
            }
        }

        read("S3XFER_MULTIPART_THRESHOLD", &mut self.multipart_threshold);
        read("S3XFER_PART_SIZE", &mut self.part_size);
        read("S3XFER_MAX_PARTS", &mut self.max_parts);
        read("S3XFER_CONCURRENCY", &mut self.concurrency);
        read("S3XFER_MAX_RETRIES", &mut self.max_retries);
        read("S3XFER_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms);
        read("S3XFER_RETRY_MAX_DELAY_MS", &mut self.retry_max_delay_ms);
        read("S3XFER_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        read("S3XFER_PROGRESS_INTERVAL_MS", &mut self.progress_interval_ms);
        read("S3XFER_TASK_TTL_SECS", &mut self.task_ttl_secs);
        read("S3XFER_INSECURE_TLS", &mut self.insecure_tls);
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            anyhow::bail!("part_size must be greater than zero");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than zero");
        }
        if self.max_parts == 0 {
            anyhow::bail!("max_parts must be greater than zero");
        }
        Ok(())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named profiles for different S3 configurations
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Transfer engine settings
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.transfer.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// - S3_ENDPOINT
/// - AWS_ACCESS_KEY_ID
/// - AWS_SECRET_ACCESS_KEY
/// - AWS_SESSION_TOKEN (optional)
/// - AWS_REGION (optional, defaults to us-east-1)
/// - S3_BUCKET (optional)
/// - S3XFER_* transfer overrides (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let endpoint = std::env::var("S3_ENDPOINT")
        .context("S3_ENDPOINT environment variable not set")?;
    if endpoint.trim().is_empty() {
        anyhow::bail!("S3_ENDPOINT is empty");
    }

    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .context("AWS_ACCESS_KEY_ID environment variable not set")?;

    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;

    let session_token = std::env::var("AWS_SESSION_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());

    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| default_region());

    let bucket = std::env::var("S3_BUCKET").ok();

    let profile = Profile {
        endpoint: endpoint.trim().to_string(),
        access_key,
        secret_key,
        session_token,
        region,
        bucket,
    };

    let mut config = Config::new();
    config.profiles.insert("default".to_string(), profile);
    config.default_profile = Some("default".to_string());
    config.transfer.apply_env_overrides();
    config.transfer.validate()?;

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file first, then falls back to environment variables if
/// no file is specified. `S3XFER_*` overrides apply in both cases.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        // If a specific profile is requested, make it the default
        if let Some(name) = profile_name {
            if !config.profiles.contains_key(name) {
                anyhow::bail!("Profile '{}' not found in config file", name);
            }
            config.default_profile = Some(name.to_string());
        }

        config.transfer.apply_env_overrides();
        config.transfer.validate()?;
        Ok(config)
    } else {
        load_from_env()
    }
}
