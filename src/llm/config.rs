//! Configuration for the Ollama inference client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::llm::errors::{InferenceError, InferenceResult};

/// Default Ollama API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-oss:20b";
/// Default temperature sent with every chat request.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default nucleus sampling threshold.
pub const DEFAULT_TOP_P: f64 = 0.9;
/// Default top-k sampling cutoff.
pub const DEFAULT_TOP_K: u32 = 40;

/// Connection settings for the Ollama client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the Ollama server, without trailing slash.
    pub base_url: String,
    /// Model name, optionally with a `:tag` suffix.
    pub model: String,
    /// Timeout applied to non-streaming requests.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Number of retries after the first failed attempt.
    pub max_retries: u32,
    /// Base delay for linear retry backoff.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl ClientConfig {
    /// Create a config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the non-streaming request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry count and backoff base delay.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse or the model is empty.
    pub fn validate(&self) -> InferenceResult<()> {
        Url::parse(&self.base_url)
            .map_err(|err| InferenceError::InvalidConfig(format!("base_url: {err}")))?;

        if self.model.trim().is_empty() {
            return Err(InferenceError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(InferenceError::InvalidConfig(
                "timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build an endpoint URL under the API root.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Linear backoff for a 1-based retry number.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_delay.saturating_mul(retry)
    }
}

/// Partial update applied on top of an existing [`ClientConfig`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// New base URL.
    pub base_url: Option<String>,
    /// New model name.
    pub model: Option<String>,
    /// New request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// New retry count.
    pub max_retries: Option<u32>,
    /// New retry base delay in milliseconds.
    pub retry_delay_ms: Option<u64>,
}

impl ConfigUpdate {
    /// Layer this update over `base`, returning the effective config.
    #[must_use]
    pub fn apply(&self, base: &ClientConfig) -> ClientConfig {
        let mut next = base.clone();
        if let Some(base_url) = &self.base_url {
            next = next.with_base_url(base_url.clone());
        }
        if let Some(model) = &self.model {
            next.model.clone_from(model);
        }
        if let Some(ms) = self.timeout_ms {
            next.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_retries {
            next.max_retries = retries;
        }
        if let Some(ms) = self.retry_delay_ms {
            next.retry_delay = Duration::from_millis(ms);
        }
        next
    }
}

/// Caller overrides for sampling options.
///
/// Unset fields fall back to the named defaults; `extra` carries any other
/// Ollama runtime option verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Additional runtime options (`num_ctx`, `seed`, ...).
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationOptions {
    /// Set the temperature override.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Resolve overrides against the defaults into the wire `options` object.
    #[must_use]
    pub fn resolve(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert(
            "temperature".to_string(),
            Value::from(self.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        );
        options.insert(
            "top_p".to_string(),
            Value::from(self.top_p.unwrap_or(DEFAULT_TOP_P)),
        );
        options.insert(
            "top_k".to_string(),
            Value::from(self.top_k.unwrap_or(DEFAULT_TOP_K)),
        );
        for (key, value) in &self.extra {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "gpt-oss:20b");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_linear_backoff() {
        let config = ClientConfig::new().with_retries(3, Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn test_invalid_config() {
        let config = ClientConfig::new().with_base_url("not a url");
        assert!(matches!(
            config.validate(),
            Err(InferenceError::InvalidConfig(_))
        ));

        let config = ClientConfig::new().with_model("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_layers_over_base() {
        let base = ClientConfig::default();
        let update = ConfigUpdate {
            model: Some("llama3".to_string()),
            base_url: Some("http://10.0.0.2:11434/".to_string()),
            ..ConfigUpdate::default()
        };
        let next = update.apply(&base);
        assert_eq!(next.model, "llama3");
        assert_eq!(next.base_url, "http://10.0.0.2:11434");
        assert_eq!(next.timeout, base.timeout);
        assert_eq!(base.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_options_resolve_defaults_and_overrides() {
        let options = GenerationOptions::default().with_temperature(0.2);
        let resolved = options.resolve();
        assert_eq!(resolved["temperature"], Value::from(0.2));
        assert_eq!(resolved["top_p"], Value::from(0.9));
        assert_eq!(resolved["top_k"], Value::from(40));

        let mut options = GenerationOptions::default();
        options.extra.insert("seed".to_string(), Value::from(7));
        assert_eq!(options.resolve()["seed"], Value::from(7));
    }
}
