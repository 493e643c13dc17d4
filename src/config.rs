use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{
    poller::{ConfigurationFetcherConfig, PollerThreadConfig},
    redis_store::RedisOverrideStore,
    Error, Result,
};

/// Configuration for the agent: where datafiles come from and where forced variations live.
///
/// ```
/// # use decision_agent::AgentConfig;
/// let config = AgentConfig::from_json(r#"{"pollIntervalMs": 10000}"#).unwrap();
/// assert!(config.enable_overrides);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Base URL of the datafile CDN.
    pub base_url: String,
    /// Path appended to `base_url`. `{sdk_key}` is replaced with the application's SDK key.
    pub datafile_url_template: String,
    #[serde(rename = "pollIntervalMs", deserialize_with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "pollJitterMs", deserialize_with = "millis")]
    pub poll_jitter: Duration,
    #[serde(rename = "requestTimeoutMs", deserialize_with = "millis")]
    pub request_timeout: Duration,
    /// When `false`, setting and removing forced variations fails with
    /// [`Error::OverridesDisabled`].
    pub enable_overrides: bool,
    pub override_store: OverrideStoreConfig,
}

/// Backend holding forced variations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverrideStoreConfig {
    /// Process-local map. Overrides are lost on restart and not shared between instances.
    #[default]
    InMemory,
    #[serde(rename_all = "camelCase")]
    Redis {
        url: String,
        #[serde(default = "default_redis_key_prefix")]
        key_prefix: String,
        #[serde(default)]
        response_timeout_ms: Option<u64>,
    },
}

fn default_redis_key_prefix() -> String {
    RedisOverrideStore::DEFAULT_KEY_PREFIX.to_owned()
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            base_url: AgentConfig::DEFAULT_BASE_URL.to_owned(),
            datafile_url_template: AgentConfig::DEFAULT_DATAFILE_URL_TEMPLATE.to_owned(),
            poll_interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            poll_jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
            request_timeout: AgentConfig::DEFAULT_REQUEST_TIMEOUT,
            enable_overrides: true,
            override_store: OverrideStoreConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Default base URL for datafile requests. Deployments should use the default setting in most
    /// cases.
    pub const DEFAULT_BASE_URL: &'static str = "https://cdn.optimizely.com";

    pub const DEFAULT_DATAFILE_URL_TEMPLATE: &'static str = "/datafiles/{sdk_key}.json";

    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Parse a JSON configuration document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<AgentConfig> {
        serde_json::from_str(json).map_err(|err| Error::Configuration(err.to_string()))
    }

    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = base_url.into();
        self
    }

    pub fn datafile_url_template(&mut self, template: impl Into<String>) -> &mut Self {
        self.datafile_url_template = template.into();
        self
    }

    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn enable_overrides(&mut self, enabled: bool) -> &mut Self {
        self.enable_overrides = enabled;
        self
    }

    pub fn override_store(&mut self, store: OverrideStoreConfig) -> &mut Self {
        self.override_store = store;
        self
    }

    pub(crate) fn fetcher_config(&self, sdk_key: &str) -> ConfigurationFetcherConfig {
        ConfigurationFetcherConfig {
            base_url: self.base_url.clone(),
            datafile_path: self.datafile_url_template.clone(),
            sdk_key: sdk_key.to_owned(),
            request_timeout: self.request_timeout,
        }
    }

    pub(crate) fn poller_config(&self) -> PollerThreadConfig {
        PollerThreadConfig {
            interval: self.poll_interval,
            jitter: self.poll_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AgentConfig, OverrideStoreConfig};
    use crate::Error;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(AgentConfig::from_json("{}").unwrap(), AgentConfig::default());
    }

    #[test]
    fn parses_redis_store() {
        let config = AgentConfig::from_json(
            r#"{
                "baseUrl": "http://localhost:8080",
                "pollIntervalMs": 5000,
                "enableOverrides": false,
                "overrideStore": {"type": "redis", "url": "redis://localhost:6379"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_jitter, Duration::from_secs(3));
        assert!(!config.enable_overrides);
        assert_eq!(
            config.override_store,
            OverrideStoreConfig::Redis {
                url: "redis://localhost:6379".into(),
                key_prefix: "decision_agent:overrides".into(),
                response_timeout_ms: None,
            }
        );
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(matches!(
            AgentConfig::from_json(r#"{"pollIntervalMs": "soon"}"#),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn fetcher_config_uses_sdk_key() {
        let mut config = AgentConfig::default();
        config.base_url("http://localhost:1234");

        let fetcher = config.fetcher_config("app-1");
        assert_eq!(fetcher.base_url, "http://localhost:1234");
        assert_eq!(fetcher.sdk_key, "app-1");
        assert_eq!(fetcher.datafile_path, "/datafiles/{sdk_key}.json");
    }
}
