use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use assistants_client::{
    AssistantsClientConfig, DEFAULT_BASE_URL, DEFAULT_RATE_LIMIT_BASE_DELAY_MS,
    DEFAULT_RATE_LIMIT_MAX_DELAY_MS, DEFAULT_RATE_LIMIT_MAX_RETRIES,
    DEFAULT_RATE_LIMIT_MULTIPLIER, DEFAULT_REQUEST_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS,
    DEFAULT_TIMEOUT_MS, RetryPolicy,
};
use thiserror::Error;

use crate::orchestrator::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_MS, PollPolicy};
use crate::provisioner::AssistantSpec;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_JSON: bool = false;
const DEFAULT_CONFIG_STORE_URL: &str = "file://.relay/app_config.json";
const DEFAULT_CONFIG_STORE_COLLECTION: &str = "app_config";
const DEFAULT_ASSISTANT_KEY: &str = "assistant_id";
const DEFAULT_ASSISTANT_NAME: &str = "Code Interpreter Explorer";
const DEFAULT_ASSISTANT_MODEL: &str = "gpt-4.1";
const DEFAULT_ASSISTANT_INSTRUCTIONS: &str = "You are a helpful AI assistant with access to a \
Python code interpreter. You can analyze data, create visualizations, perform mathematical \
computations, and work with files. Always explain your process and provide clear, detailed \
responses. When creating visualizations, save them as files so users can download them.";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_CORS_ALLOWED_ORIGINS: &str = "*";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_organization: Option<String>,
    pub upstream_timeout_ms: u64,
    pub upstream_request_attempts: usize,
    pub upstream_retry_backoff_ms: u64,
    pub config_store_url: String,
    pub config_store_collection: String,
    pub assistant_key: String,
    pub assistant_name: String,
    pub assistant_model: String,
    pub assistant_instructions: String,
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_multiplier: f64,
    pub rate_limit_max_retries: u32,
    pub rate_limit_max_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub max_upload_bytes: usize,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RELAY_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("OPENAI_API_KEY is required")]
    MissingApiKey,
    #[error("invalid RELAY_RATE_LIMIT_MULTIPLIER value '{value}': must be a positive number")]
    InvalidMultiplier { value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr_raw = read("RELAY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter =
            read("RELAY_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let log_json = read("RELAY_LOG_JSON")
            .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(DEFAULT_LOG_JSON);

        let openai_api_key = read("OPENAI_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let openai_base_url =
            read("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let openai_organization = read("OPENAI_ORGANIZATION");

        let upstream_timeout_ms = read("RELAY_UPSTREAM_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .max(250);

        let upstream_request_attempts = read("RELAY_UPSTREAM_REQUEST_ATTEMPTS")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_REQUEST_ATTEMPTS)
            .max(1);

        let upstream_retry_backoff_ms = read("RELAY_UPSTREAM_RETRY_BACKOFF_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MS);

        let config_store_url = read("RELAY_CONFIG_STORE_URL")
            .unwrap_or_else(|| DEFAULT_CONFIG_STORE_URL.to_string());

        let config_store_collection = read("RELAY_CONFIG_STORE_COLLECTION")
            .unwrap_or_else(|| DEFAULT_CONFIG_STORE_COLLECTION.to_string());

        let assistant_key =
            read("RELAY_ASSISTANT_KEY").unwrap_or_else(|| DEFAULT_ASSISTANT_KEY.to_string());

        let assistant_name =
            read("RELAY_ASSISTANT_NAME").unwrap_or_else(|| DEFAULT_ASSISTANT_NAME.to_string());

        let assistant_model =
            read("RELAY_ASSISTANT_MODEL").unwrap_or_else(|| DEFAULT_ASSISTANT_MODEL.to_string());

        let assistant_instructions = read("RELAY_ASSISTANT_INSTRUCTIONS")
            .unwrap_or_else(|| DEFAULT_ASSISTANT_INSTRUCTIONS.to_string());

        let rate_limit_base_delay_ms = read("RELAY_RATE_LIMIT_BASE_DELAY_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_BASE_DELAY_MS);

        let rate_limit_multiplier = match read("RELAY_RATE_LIMIT_MULTIPLIER") {
            Some(value) => match value.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() && parsed > 0.0 => parsed,
                _ => return Err(ConfigError::InvalidMultiplier { value }),
            },
            None => DEFAULT_RATE_LIMIT_MULTIPLIER,
        };

        let rate_limit_max_retries = read("RELAY_RATE_LIMIT_MAX_RETRIES")
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_RETRIES);

        let rate_limit_max_delay_ms = read("RELAY_RATE_LIMIT_MAX_DELAY_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_DELAY_MS);

        let poll_interval_ms = read("RELAY_POLL_INTERVAL_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(1);

        let poll_timeout_ms = read("RELAY_POLL_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_TIMEOUT_MS);

        let max_upload_bytes = read("RELAY_MAX_UPLOAD_BYTES")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let cors_allowed_origins = parse_csv(
            read("RELAY_CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|| DEFAULT_CORS_ALLOWED_ORIGINS.to_string()),
        );

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            openai_api_key,
            openai_base_url,
            openai_organization,
            upstream_timeout_ms,
            upstream_request_attempts,
            upstream_retry_backoff_ms,
            config_store_url,
            config_store_collection,
            assistant_key,
            assistant_name,
            assistant_model,
            assistant_instructions,
            rate_limit_base_delay_ms,
            rate_limit_multiplier,
            rate_limit_max_retries,
            rate_limit_max_delay_ms,
            poll_interval_ms,
            poll_timeout_ms,
            max_upload_bytes,
            cors_allowed_origins,
        })
    }

    pub fn client_config(&self) -> AssistantsClientConfig {
        AssistantsClientConfig {
            base_url: self.openai_base_url.clone(),
            api_key: self.openai_api_key.clone(),
            organization: self.openai_organization.clone(),
            timeout_ms: self.upstream_timeout_ms,
            request_attempts: self.upstream_request_attempts,
            retry_backoff_ms: self.upstream_retry_backoff_ms,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.rate_limit_base_delay_ms),
            multiplier: self.rate_limit_multiplier,
            max_retries: self.rate_limit_max_retries,
            max_delay: Duration::from_millis(self.rate_limit_max_delay_ms),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_wait: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn assistant_spec(&self) -> AssistantSpec {
        AssistantSpec {
            record_key: self.assistant_key.clone(),
            name: self.assistant_name.clone(),
            model: self.assistant_model.clone(),
            instructions: self.assistant_instructions.clone(),
        }
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            openai_api_key: "sk-test".to_string(),
            openai_base_url: "http://127.0.0.1:9/v1".to_string(),
            openai_organization: None,
            upstream_timeout_ms: 1_000,
            upstream_request_attempts: 1,
            upstream_retry_backoff_ms: 1,
            config_store_url: "memory".to_string(),
            config_store_collection: DEFAULT_CONFIG_STORE_COLLECTION.to_string(),
            assistant_key: DEFAULT_ASSISTANT_KEY.to_string(),
            assistant_name: DEFAULT_ASSISTANT_NAME.to_string(),
            assistant_model: DEFAULT_ASSISTANT_MODEL.to_string(),
            assistant_instructions: DEFAULT_ASSISTANT_INSTRUCTIONS.to_string(),
            rate_limit_base_delay_ms: 1,
            rate_limit_multiplier: 2.0,
            rate_limit_max_retries: 2,
            rate_limit_max_delay_ms: 5,
            poll_interval_ms: 1,
            poll_timeout_ms: 250,
            max_upload_bytes: 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

fn parse_csv(value: String) -> Vec<String> {
    value
        .split(',')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}
