use crate::error::{RelayError, Result};
use serde::{Deserialize, Deserializer};
use std::env;
use std::fs;
use std::time::Duration;

pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_PROCESSING_UPDATE_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_STREAMING_DURATION_SECONDS: u64 = 900;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Heartbeat cadence and the hard ceiling on a single streamed invocation.
///
/// Intervals are written as (possibly fractional) seconds in config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    #[serde(
        rename = "keep_alive_interval_seconds",
        deserialize_with = "duration_from_secs"
    )]
    pub keep_alive_interval: Duration,

    #[serde(
        rename = "processing_update_interval_seconds",
        deserialize_with = "duration_from_secs"
    )]
    pub processing_update_interval: Duration,

    #[serde(
        rename = "max_streaming_duration_seconds",
        deserialize_with = "duration_from_secs"
    )]
    pub max_streaming_duration: Duration,

    #[serde(rename = "poll_interval_seconds", deserialize_with = "duration_from_secs")]
    pub poll_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(DEFAULT_KEEP_ALIVE_INTERVAL_SECONDS),
            processing_update_interval: Duration::from_secs(
                DEFAULT_PROCESSING_UPDATE_INTERVAL_SECONDS,
            ),
            max_streaming_duration: Duration::from_secs(DEFAULT_MAX_STREAMING_DURATION_SECONDS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl StreamingConfig {
    /// Read the heartbeat settings from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(secs) = read_positive_u64("KEEP_ALIVE_INTERVAL_SECONDS")? {
            self.keep_alive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_positive_u64("PROCESSING_UPDATE_INTERVAL_SECONDS")? {
            self.processing_update_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_positive_u64("MAX_STREAMING_DURATION_SECONDS")? {
            self.max_streaming_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = read_positive_u64("HEARTBEAT_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_processing_update_interval(mut self, interval: Duration) -> Self {
        self.processing_update_interval = interval;
        self
    }

    pub fn with_max_streaming_duration(mut self, max: Duration) -> Self {
        self.max_streaming_duration = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let named = [
            ("keep_alive_interval", self.keep_alive_interval),
            ("processing_update_interval", self.processing_update_interval),
            ("max_streaming_duration", self.max_streaming_duration),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(RelayError::ConfigError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.poll_interval > self.keep_alive_interval {
            return Err(RelayError::ConfigError(
                "poll_interval must not exceed keep_alive_interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings consumed by the push-style delivery callback
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Answer sent when retrieval produced no documents
    pub no_docs_response: Option<String>,
    /// Whether source documents are delivered to the client
    pub return_source_docs: bool,
    pub context_key: String,
    pub output_key: String,
    pub source_documents_key: String,
    pub rephrased_query_key: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            no_docs_response: None,
            return_source_docs: false,
            context_key: "context".to_string(),
            output_key: "answer".to_string(),
            source_documents_key: "source_documents".to_string(),
            rephrased_query_key: "rephrased_query".to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn with_no_docs_response(mut self, response: impl Into<String>) -> Self {
        self.no_docs_response = Some(response.into());
        self
    }

    pub fn with_source_docs(mut self, enabled: bool) -> Self {
        self.return_source_docs = enabled;
        self
    }
}

/// Per-invocation identity of the agent being streamed
#[derive(Debug, Clone, Deserialize)]
pub struct InvocationConfig {
    pub use_case_name: String,
    pub model_id: String,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

fn default_streaming() -> bool {
    true
}

impl InvocationConfig {
    pub fn new(use_case_name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            use_case_name: use_case_name.into(),
            model_id: model_id.into(),
            streaming: true,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let streaming = StreamingConfig::from_env()?;

        let mut delivery = DeliveryConfig::default();
        if let Ok(response) = env::var("NO_DOCS_FOUND_RESPONSE")
            && !response.is_empty()
        {
            delivery.no_docs_response = Some(response);
        }
        if let Ok(flag) = env::var("RETURN_SOURCE_DOCS") {
            delivery.return_source_docs = parse_flag(&flag);
        }

        Ok(RelayConfig {
            server: ServerConfig { listen_addr },
            streaming,
            delivery,
        })
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config: RelayConfig = toml::from_str(&contents)?;

        // Allow environment variables to override file config
        config.streaming.apply_env()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(RelayError::ConfigError(
                "Listen address is empty".to_string(),
            ));
        }

        self.streaming.validate()
    }
}

fn read_positive_u64(name: &str) -> Result<Option<u64>> {
    let raw = match env::var(name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| RelayError::ConfigError(format!("Invalid {} value: {}", name, e)))?;

    if value == 0 {
        return Err(RelayError::ConfigError(format!(
            "{} must be a positive integer",
            name
        )));
    }

    Ok(Some(value))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn duration_from_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
