//! Decision agent: feature and experiment decisions, forced-variation overrides and event tracking
//! for many applications from one process.
//!
//! # Overview
//!
//! Every application (identified by its SDK key) gets a [`DecisionFacade`] that combines a
//! configuration source (the application's datafile), a [`DecisionEngine`] and a
//! [`ForcedVariationStore`]. The facade answers requests with typed results ([`Decision`],
//! [`Override`], [`Track`]) that are ready to be serialized by an outer HTTP layer.
//!
//! Facades are shared through a [`ClientCache`], which builds them lazily via a
//! [`ClientFactory`] and rebuilds them when configuration changes are announced.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Problems with keys supplied by the caller (unknown feature, experiment, variation or event) are
//! reported inside the returned result. Errors returned from an operation mean that the agent was
//! unable to answer at all: configuration is not available, the override store failed, or the
//! request was cancelled.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with target `decision_agent` and structured key-values. Consider integrating a
//! `log`-compatible logger implementation for better visibility into agent operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
mod conditions;
mod config;
mod config_source;
mod context;
mod engine;
mod error;
mod events;
mod facade;
mod override_store;
mod poller;
mod project_config;
mod redis_store;
mod sharder;
mod user;

#[cfg(test)]
mod test_utils;

pub use cache::{ClientCache, ClientFactory, DefaultClientFactory};
pub use conditions::{Condition, MatchType};
pub use config::{AgentConfig, OverrideStoreConfig};
pub use config_source::{ConfigSource, ConfigUpdates, ConfigurationStore, StaticConfigSource};
pub use context::RequestContext;
pub use engine::{Assignment, BucketingEngine, DecisionEngine, DecisionKind, DecisionSource};
pub use error::{Error, Result};
pub use events::{ConversionEvent, Event, EventDispatcher, EventTags, ImpressionEvent};
pub use facade::{Decision, DecisionFacade, Override, OverrideRequest, Track};
pub use override_store::{ForcedVariationStore, InMemoryOverrideStore, KeyedLock, OverrideKey};
pub use poller::{
    ConfigurationFetcher, ConfigurationFetcherConfig, PollerThread, PollerThreadConfig,
    PolledConfigSource,
};
pub use project_config::{
    Audience, ConfigSummary, EventDefinition, Experiment, ExperimentStatus, ExperimentSummary,
    Feature, FeatureSummary, ProjectConfig, TrafficAllocation, Variable, VariableType,
    VariableValue, Variation,
};
pub use redis_store::RedisOverrideStore;
pub use sharder::{Md5Sharder, Sharder};
pub use user::{AttributeValue, Attributes, UserContext};
