use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors propagated by the facade and its collaborators.
///
/// Problems with keys supplied by the caller (unknown event, experiment or variation) are normally
/// reported in-band inside result objects; the variants here signal that no result could be
/// computed at all.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Configuration source failed to produce a snapshot. The message is kept verbatim.
    #[error("{0}")]
    Configuration(String),
    #[error("configuration has not been fetched yet")]
    ConfigurationNotFetched,
    #[error("error parsing datafile")]
    DatafileParse(#[source] Arc<serde_json::Error>),
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    #[error("override store error: {0}")]
    Store(String),
    #[error(transparent)]
    Redis(Arc<redis::RedisError>),

    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Feature with key {key} not found")]
    FeatureNotFound { key: String },
    #[error("Experiment with key {key} not found")]
    ExperimentNotFound { key: String },
    #[error("Event with key {key} not found")]
    EventNotFound { key: String },

    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("overrides not enabled")]
    OverridesDisabled,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Error::Redis(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::DatafileParse(Arc::new(value))
    }
}

impl Error {
    /// Whether this error describes a caller-supplied key that is unknown to the configuration.
    pub fn is_unknown_key(&self) -> bool {
        matches!(
            self,
            Error::FeatureNotFound { .. }
                | Error::ExperimentNotFound { .. }
                | Error::EventNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn configuration_error_keeps_message_verbatim() {
        assert_eq!(
            Error::Configuration("config error".to_owned()).to_string(),
            "config error"
        );
    }

    #[test]
    fn unknown_event_message() {
        let err = Error::EventNotFound {
            key: "something".to_owned(),
        };
        assert_eq!(err.to_string(), "Event with key something not found");
        assert!(err.is_unknown_key());
        assert!(!Error::Cancelled.is_unknown_key());
    }
}
