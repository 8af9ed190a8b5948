use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::SkailarClient;
use crate::error::SkailarError;
use crate::proxy::{ProbeRegistry, ProxyConfig};

/// Declarative client settings, e.g. loaded from a JSON or TOML file.
///
/// # Examples
///
/// ```
/// use skailar::config::{ClientConfig, build_client_from_config};
///
/// let config: ClientConfig = serde_json::from_str(r#"{
///     "api_key": "sk-test",
///     "proxy": { "host": "127.0.0.1", "port": 3128, "protocol": "http" },
///     "probe_timeout_ms": 1500
/// }"#).unwrap();
/// let client = build_client_from_config(&config).unwrap();
/// assert!(client.proxy().is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_key: String,
    /// Defaults to [`crate::client::DEFAULT_BASE_URL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    /// Installs a [`ProbeRegistry`] with this TTL when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_cache_ttl_secs: Option<u64>,
}

/// Builds a [`SkailarClient`] from a [`ClientConfig`], validating it eagerly.
///
/// # Errors
///
/// Returns [`SkailarError::Configuration`] for an empty API key, a zero probe timeout,
/// or an invalid proxy.
pub fn build_client_from_config(config: &ClientConfig) -> Result<SkailarClient, SkailarError> {
    if config.api_key.trim().is_empty() {
        return Err(SkailarError::configuration(
            "api_key",
            "api key must not be empty",
        ));
    }

    let mut builder =
        SkailarClient::builder(config.api_key.clone()).debug_logging(config.debug_logging);

    if let Some(base_url) = &config.base_url {
        crate::proxy::provider::parse_base_url(base_url)?;
        builder = builder.base_url(base_url.clone());
    }
    if let Some(proxy) = &config.proxy {
        proxy.validate()?;
        builder = builder.proxy(proxy.clone());
    }
    if let Some(timeout_ms) = config.probe_timeout_ms {
        if timeout_ms == 0 {
            return Err(SkailarError::configuration(
                "probe_timeout_ms",
                "probe timeout must be greater than zero",
            ));
        }
        builder = builder.probe_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(ttl_secs) = config.probe_cache_ttl_secs {
        builder = builder.probe_registry(Arc::new(ProbeRegistry::new(Duration::from_secs(
            ttl_secs,
        ))));
    }

    builder.build()
}
