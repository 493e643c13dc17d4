//! The decision engine: turns a configuration snapshot and a user into variation assignments, and
//! emits impression/conversion events.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::{
    conditions::user_qualifies,
    events::{ConversionEvent, Event, EventDispatcher, EventTags, NoopEventDispatcher},
    override_store::{ForcedVariationStore, OverrideKey},
    project_config::{Experiment, ProjectConfig, Variation},
    sharder::{bucket, Md5Sharder, Sharder},
    user::UserContext,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Feature,
    Experiment,
}

/// How the variation of an [`Assignment`] was chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecisionSource {
    /// No experiment yielded a variation.
    #[default]
    None,
    ForcedVariation,
    Bucketing,
}

/// Outcome of a decision. Experiment and variation fields are empty when no variation was
/// assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    pub experiment_id: String,
    pub experiment_key: String,
    pub variation_id: String,
    pub variation_key: String,
    /// For features, the variation's `featureEnabled`; for experiments, whether a variation was
    /// assigned.
    pub enabled: bool,
    pub source: DecisionSource,
}

impl Assignment {
    pub fn has_variation(&self) -> bool {
        self.source != DecisionSource::None
    }

    fn from_variation(
        experiment: &Experiment,
        variation: &Variation,
        source: DecisionSource,
        kind: DecisionKind,
    ) -> Assignment {
        Assignment {
            experiment_id: experiment.id.clone(),
            experiment_key: experiment.key.clone(),
            variation_id: variation.id.clone(),
            variation_key: variation.key.clone(),
            enabled: match kind {
                DecisionKind::Feature => variation.feature_enabled,
                DecisionKind::Experiment => true,
            },
            source,
        }
    }
}

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Decide a feature or experiment for `user`. Forced variations take precedence over standard
    /// bucketing.
    ///
    /// # Errors
    ///
    /// - [`Error::FeatureNotFound`] / [`Error::ExperimentNotFound`] for unknown keys
    /// - store errors while reading forced variations
    async fn decide(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        key: &str,
        kind: DecisionKind,
    ) -> Result<Assignment>;

    /// Record a conversion for `event_key`. Fails with [`Error::EventNotFound`] when the key is
    /// not part of `config`; otherwise exactly one conversion event is dispatched.
    fn track(
        &self,
        config: &ProjectConfig,
        event_key: &str,
        user: &UserContext,
        tags: &EventTags,
    ) -> Result<()>;

    /// Send an event to the engine's sink.
    fn dispatch(&self, event: Event);
}

/// Default engine: forced variations, then experiment status, audiences and md5 bucketing.
pub struct BucketingEngine {
    overrides: Arc<dyn ForcedVariationStore>,
    sharder: Box<dyn Sharder + Send + Sync>,
    dispatcher: Box<dyn EventDispatcher + Send + Sync>,
}

impl BucketingEngine {
    pub fn new(overrides: Arc<dyn ForcedVariationStore>) -> BucketingEngine {
        BucketingEngine {
            overrides,
            sharder: Box::new(Md5Sharder),
            dispatcher: Box::new(NoopEventDispatcher),
        }
    }

    /// Set the sink receiving impression and conversion events.
    pub fn with_dispatcher(
        mut self,
        dispatcher: impl EventDispatcher + Send + Sync + 'static,
    ) -> BucketingEngine {
        self.dispatcher = Box::new(dispatcher);
        self
    }

    pub fn with_sharder(mut self, sharder: impl Sharder + Send + Sync + 'static) -> BucketingEngine {
        self.sharder = Box::new(sharder);
        self
    }

    async fn decide_experiment<'c>(
        &self,
        config: &'c ProjectConfig,
        experiment: &'c Experiment,
        user: &UserContext,
    ) -> Result<Option<(&'c Variation, DecisionSource)>> {
        let override_key = OverrideKey::new(&experiment.key, &user.id);
        if let Some(forced) = self.overrides.get(&override_key).await? {
            match experiment.variation_by_key(&forced) {
                Some(variation) => {
                    log::trace!(target: "decision_agent",
                                experiment_key = experiment.key.as_str(),
                                user_id = user.id.as_str(),
                                variation_key = forced.as_str();
                                "using forced variation");
                    return Ok(Some((variation, DecisionSource::ForcedVariation)));
                }
                None => {
                    log::warn!(target: "decision_agent",
                               experiment_key = experiment.key.as_str(),
                               user_id = user.id.as_str(),
                               variation_key = forced.as_str();
                               "forced variation is not part of the experiment, ignoring it");
                }
            }
        }

        if !experiment.is_active() {
            return Ok(None);
        }

        if !user_qualifies(config, experiment, &user.attributes) {
            log::trace!(target: "decision_agent",
                        experiment_key = experiment.key.as_str(),
                        user_id = user.id.as_str();
                        "user does not qualify for experiment audiences");
            return Ok(None);
        }

        let Some(variation_id) = bucket(
            self.sharder.as_ref(),
            &user.id,
            &experiment.id,
            &experiment.traffic_allocation,
        ) else {
            return Ok(None);
        };

        let variation = experiment.variation_by_id(variation_id);
        if variation.is_none() {
            log::warn!(target: "decision_agent",
                       experiment_key = experiment.key.as_str(),
                       variation_id;
                       "internal: traffic allocated to unknown variation");
        }

        Ok(variation.map(|v| (v, DecisionSource::Bucketing)))
    }
}

#[async_trait]
impl DecisionEngine for BucketingEngine {
    async fn decide(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        key: &str,
        kind: DecisionKind,
    ) -> Result<Assignment> {
        match kind {
            DecisionKind::Experiment => {
                let experiment = config
                    .experiment(key)
                    .ok_or_else(|| Error::ExperimentNotFound {
                        key: key.to_owned(),
                    })?;

                Ok(self
                    .decide_experiment(config, experiment, user)
                    .await?
                    .map(|(variation, source)| {
                        Assignment::from_variation(experiment, variation, source, kind)
                    })
                    .unwrap_or_default())
            }
            DecisionKind::Feature => {
                let feature = config.feature(key).ok_or_else(|| Error::FeatureNotFound {
                    key: key.to_owned(),
                })?;

                for experiment_id in &feature.experiment_ids {
                    let Some(experiment) = config.experiment_by_id(experiment_id) else {
                        log::warn!(target: "decision_agent",
                                   feature_key = key,
                                   experiment_id = experiment_id.as_str();
                                   "feature references unknown experiment");
                        continue;
                    };

                    if let Some((variation, source)) =
                        self.decide_experiment(config, experiment, user).await?
                    {
                        return Ok(Assignment::from_variation(
                            experiment, variation, source, kind,
                        ));
                    }
                }

                Ok(Assignment::default())
            }
        }
    }

    fn track(
        &self,
        config: &ProjectConfig,
        event_key: &str,
        user: &UserContext,
        tags: &EventTags,
    ) -> Result<()> {
        let event = config.event(event_key).ok_or_else(|| Error::EventNotFound {
            key: event_key.to_owned(),
        })?;

        self.dispatch(Event::Conversion(ConversionEvent {
            user_id: user.id.clone(),
            attributes: user.attributes.clone(),
            event_id: event.id.clone(),
            event_key: event.key.clone(),
            tags: tags.clone(),
            timestamp: Utc::now(),
        }));

        Ok(())
    }

    fn dispatch(&self, event: Event) {
        log::trace!(target: "decision_agent", event:serde; "dispatching event");
        self.dispatcher.dispatch(event);
    }
}
