//! Request-scoped operations over a decision engine, a configuration source and a forced-variation
//! store.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    config_source::{ConfigSource, ConfigUpdates},
    context::RequestContext,
    engine::{Assignment, BucketingEngine, DecisionEngine, DecisionKind},
    events::{Event, EventDispatcher, EventTags, ImpressionEvent},
    override_store::{ForcedVariationStore, KeyedLock, OverrideKey},
    project_config::{ConfigSummary, Feature, ProjectConfig},
    user::UserContext,
    Error, Result,
};

const EXPERIMENT_NOT_FOUND: &str = "experimentKey not found in configuration";
const VARIATION_NOT_FOUND: &str = "variationKey not found in configuration";
const UPDATING_PREVIOUS_OVERRIDE: &str = "updating previous override";
const REMOVING_PREVIOUS_OVERRIDE: &str = "removing previous override";
const NO_PREVIOUS_OVERRIDE: &str = "no pre-existing override";

/// Outcome of tracking an event. `error` describes an unknown event key; it is never set when the
/// operation itself fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub user_id: String,
    pub event_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a forced-variation mutation. An empty `variation_key` means the override was
/// removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub user_id: String,
    pub experiment_key: String,
    pub variation_key: String,
    pub prev_variation_key: String,
    pub messages: Vec<String>,
}

/// Outcome of a feature or experiment activation. Fields that do not apply to the decision type
/// stay empty rather than being omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub user_id: String,
    pub feature_key: String,
    #[serde(rename = "type")]
    pub decision_type: DecisionKind,
    pub variables: HashMap<String, serde_json::Value>,
    pub enabled: bool,
    pub experiment_key: String,
    pub variation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    fn empty(user_id: &str, decision_type: DecisionKind) -> Decision {
        Decision {
            user_id: user_id.to_owned(),
            feature_key: String::new(),
            decision_type,
            variables: HashMap::new(),
            enabled: false,
            experiment_key: String::new(),
            variation_key: String::new(),
            error: None,
        }
    }
}

/// A combined set/remove request, as received from the override endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub user_id: String,
    pub experiment_key: String,
    #[serde(default)]
    pub variation_key: String,
}

/// Decision facade for one application.
///
/// All operations may run concurrently. Configuration is read as an immutable snapshot per
/// operation; override read-modify-write sequences are serialized per (experiment, user).
pub struct DecisionFacade {
    config_source: Arc<dyn ConfigSource>,
    engine: Arc<dyn DecisionEngine>,
    overrides: Arc<dyn ForcedVariationStore>,
    override_locks: KeyedLock<OverrideKey>,
    /// Latest snapshot pushed by the source, if it supports subscriptions.
    updates: RwLock<Option<ConfigUpdates>>,
    overrides_enabled: bool,
}

impl std::fmt::Debug for DecisionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let revision = self
            .current_config()
            .map(|config| config.revision().to_owned())
            .ok();
        f.debug_struct("DecisionFacade")
            .field("revision", &revision)
            .field("overrides_enabled", &self.overrides_enabled)
            .finish_non_exhaustive()
    }
}

impl DecisionFacade {
    /// Create a facade. `engine` is expected to consult `overrides` for forced variations.
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        engine: Arc<dyn DecisionEngine>,
        overrides: Arc<dyn ForcedVariationStore>,
    ) -> DecisionFacade {
        let updates = match config_source.subscribe() {
            Ok(updates) => Some(updates),
            Err(Error::UnsupportedOperation(_)) => None,
            Err(err) => {
                log::warn!(target: "decision_agent", "unable to subscribe to configuration updates: {}", err);
                None
            }
        };

        DecisionFacade {
            config_source,
            engine,
            overrides,
            override_locks: KeyedLock::new(),
            updates: RwLock::new(updates),
            overrides_enabled: true,
        }
    }

    /// Create a facade using [`BucketingEngine`] over `overrides`, sending events to `dispatcher`.
    pub fn with_bucketing_engine(
        config_source: Arc<dyn ConfigSource>,
        overrides: Arc<dyn ForcedVariationStore>,
        dispatcher: impl EventDispatcher + Send + Sync + 'static,
    ) -> DecisionFacade {
        let engine = BucketingEngine::new(overrides.clone()).with_dispatcher(dispatcher);
        DecisionFacade::new(config_source, Arc::new(engine), overrides)
    }

    /// Enable or disable the override operations.
    pub fn overrides_enabled(mut self, enabled: bool) -> DecisionFacade {
        self.overrides_enabled = enabled;
        self
    }

    /// Track `event_key` for `user`.
    ///
    /// An unknown event key is reported in [`Track::error`]. Failure to retrieve configuration is
    /// returned unchanged as the error.
    pub async fn track_event(
        &self,
        ctx: &RequestContext,
        event_key: &str,
        user: &UserContext,
        tags: &EventTags,
    ) -> Result<Track> {
        ensure_user_id(&user.id)?;
        ctx.check()?;
        let config = self.current_config()?;

        match self.engine.track(&config, event_key, user, tags) {
            Ok(()) => Ok(Track {
                user_id: user.id.clone(),
                event_key: event_key.to_owned(),
                error: None,
            }),
            Err(err @ Error::EventNotFound { .. }) => {
                log::debug!(target: "decision_agent", event_key, user_id = user.id.as_str(); "tracking unknown event");
                Ok(Track {
                    user_id: user.id.clone(),
                    event_key: event_key.to_owned(),
                    error: Some(err.to_string()),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Force `user_id` into `variation_key` of `experiment_key`.
    ///
    /// Keys unknown to the current configuration are recorded anyway and reported in
    /// [`Override::messages`]; errors are reserved for configuration, store and cancellation
    /// failures.
    pub async fn set_forced_variation(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
        user_id: &str,
        variation_key: &str,
    ) -> Result<Override> {
        self.ensure_overrides_enabled()?;
        ensure_user_id(user_id)?;
        let key = OverrideKey::new(experiment_key, user_id);

        ctx.run(async {
            let _guard = self.override_locks.lock(&key).await;

            let config = self.current_config()?;

            let mut messages = Vec::new();
            match config.experiment(experiment_key) {
                None => messages.push(EXPERIMENT_NOT_FOUND.to_owned()),
                Some(experiment) => {
                    if experiment.variation_by_key(variation_key).is_none() {
                        messages.push(VARIATION_NOT_FOUND.to_owned());
                    }
                }
            }

            // Do not write on behalf of a caller that has given up.
            ctx.check()?;
            let previous = self
                .overrides
                .set(&key, variation_key)
                .await?
                .unwrap_or_default();

            if !previous.is_empty() && previous != variation_key {
                messages.push(UPDATING_PREVIOUS_OVERRIDE.to_owned());
            }

            log::debug!(target: "decision_agent",
                        experiment_key,
                        user_id,
                        variation_key,
                        prev_variation_key = previous.as_str();
                        "forced variation set");

            Ok::<_, Error>(Override {
                user_id: user_id.to_owned(),
                experiment_key: experiment_key.to_owned(),
                variation_key: variation_key.to_owned(),
                prev_variation_key: previous,
                messages,
            })
        })
        .await
    }

    /// Remove the forced variation of `user_id` for `experiment_key`. Subsequent decisions fall
    /// back to standard bucketing.
    pub async fn remove_forced_variation(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
        user_id: &str,
    ) -> Result<Override> {
        self.ensure_overrides_enabled()?;
        ensure_user_id(user_id)?;
        let key = OverrideKey::new(experiment_key, user_id);

        ctx.run(async {
            let _guard = self.override_locks.lock(&key).await;

            ctx.check()?;
            let previous = self.overrides.remove(&key).await?;
            let messages = match &previous {
                Some(_) => {
                    log::debug!(target: "decision_agent", experiment_key, user_id; "forced variation removed");
                    vec![REMOVING_PREVIOUS_OVERRIDE.to_owned()]
                }
                None => vec![NO_PREVIOUS_OVERRIDE.to_owned()],
            };

            Ok::<_, Error>(Override {
                user_id: user_id.to_owned(),
                experiment_key: experiment_key.to_owned(),
                variation_key: String::new(),
                prev_variation_key: previous.unwrap_or_default(),
                messages,
            })
        })
        .await
    }

    /// Set or remove an override: an empty `variation_key` removes it.
    pub async fn apply_override(
        &self,
        ctx: &RequestContext,
        request: &OverrideRequest,
    ) -> Result<Override> {
        ensure_user_id(&request.user_id)?;
        if request.experiment_key.is_empty() {
            return Err(Error::InvalidInput("experimentKey cannot be empty"));
        }

        if request.variation_key.is_empty() {
            self.remove_forced_variation(ctx, &request.experiment_key, &request.user_id)
                .await
        } else {
            self.set_forced_variation(
                ctx,
                &request.experiment_key,
                &request.user_id,
                &request.variation_key,
            )
            .await
        }
    }

    /// Decide `feature_key` for `user`, resolving the feature's variables.
    ///
    /// `send_impression` only controls whether an impression is dispatched; the returned decision
    /// is the same either way.
    pub async fn activate_feature(
        &self,
        ctx: &RequestContext,
        feature_key: &str,
        user: &UserContext,
        send_impression: bool,
    ) -> Result<Decision> {
        let mut decision = Decision::empty(&user.id, DecisionKind::Feature);
        decision.feature_key = feature_key.to_owned();

        let Some((config, assignment)) = self
            .decide(ctx, feature_key, user, DecisionKind::Feature, &mut decision)
            .await?
        else {
            return Ok(decision);
        };

        if let Some(feature) = config.feature(feature_key) {
            decision.variables = resolve_variables(&config, feature, &assignment);
        }
        decision.enabled = assignment.enabled;
        decision.experiment_key = assignment.experiment_key.clone();
        decision.variation_key = assignment.variation_key.clone();

        if send_impression && assignment.has_variation() {
            self.send_impression(user, &assignment, Some(feature_key));
        }

        Ok(decision)
    }

    /// Decide `experiment_key` for `user`. Variables are not resolved for experiment decisions.
    pub async fn activate_experiment(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
        user: &UserContext,
        send_impression: bool,
    ) -> Result<Decision> {
        let mut decision = Decision::empty(&user.id, DecisionKind::Experiment);
        decision.experiment_key = experiment_key.to_owned();

        let Some((_, assignment)) = self
            .decide(ctx, experiment_key, user, DecisionKind::Experiment, &mut decision)
            .await?
        else {
            return Ok(decision);
        };

        decision.enabled = assignment.enabled;
        decision.variation_key = assignment.variation_key.clone();

        if send_impression && assignment.has_variation() {
            self.send_impression(user, &assignment, None);
        }

        Ok(decision)
    }

    /// Whether `feature_key` is enabled for `user`. Never dispatches an impression.
    pub async fn is_feature_enabled(
        &self,
        ctx: &RequestContext,
        feature_key: &str,
        user: &UserContext,
    ) -> Result<bool> {
        Ok(self
            .activate_feature(ctx, feature_key, user, false)
            .await?
            .enabled)
    }

    /// Summary view of the current configuration snapshot.
    pub fn config_summary(&self) -> Result<ConfigSummary> {
        Ok(self.current_config()?.summary().clone())
    }

    /// Drop the configuration subscription and close the configuration source.
    pub fn close(&self) {
        self.updates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.config_source.close();
    }

    /// Current snapshot: the last one pushed through the subscription, or whatever the source
    /// returns.
    fn current_config(&self) -> Result<Arc<ProjectConfig>> {
        let pushed = self
            .updates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|updates| updates.borrow().clone());

        match pushed {
            Some(config) => Ok(config),
            None => self.config_source.get_config(),
        }
    }

    /// Run the engine. Returns `None` (with `decision.error` populated) for unknown keys.
    async fn decide(
        &self,
        ctx: &RequestContext,
        key: &str,
        user: &UserContext,
        kind: DecisionKind,
        decision: &mut Decision,
    ) -> Result<Option<(Arc<ProjectConfig>, Assignment)>> {
        ensure_user_id(&user.id)?;
        ctx.check()?;
        let config = self.current_config()?;

        match ctx
            .run(self.engine.decide(&config, user, key, kind))
            .await
        {
            Ok(assignment) => {
                log::trace!(target: "decision_agent",
                            key,
                            user_id = user.id.as_str(),
                            experiment_key = assignment.experiment_key.as_str(),
                            variation_key = assignment.variation_key.as_str(),
                            enabled = assignment.enabled;
                            "decided");
                Ok(Some((config, assignment)))
            }
            Err(err) if err.is_unknown_key() => {
                decision.error = Some(err.to_string());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn send_impression(&self, user: &UserContext, assignment: &Assignment, feature_key: Option<&str>) {
        self.engine.dispatch(Event::Impression(ImpressionEvent {
            user_id: user.id.clone(),
            attributes: user.attributes.clone(),
            experiment_id: assignment.experiment_id.clone(),
            experiment_key: assignment.experiment_key.clone(),
            variation_id: assignment.variation_id.clone(),
            variation_key: assignment.variation_key.clone(),
            feature_key: feature_key.map(ToOwned::to_owned),
            timestamp: Utc::now(),
        }));
    }

    fn ensure_overrides_enabled(&self) -> Result<()> {
        if self.overrides_enabled {
            Ok(())
        } else {
            Err(Error::OverridesDisabled)
        }
    }
}

/// Users are identified by a non-empty id.
fn ensure_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::InvalidInput("userId cannot be empty"));
    }
    Ok(())
}

/// Resolve every variable of `feature`: the assigned variation's value when the feature is enabled
/// and the variation defines one, the default value otherwise.
fn resolve_variables(
    config: &ProjectConfig,
    feature: &Feature,
    assignment: &Assignment,
) -> HashMap<String, serde_json::Value> {
    let variation = config
        .experiment(&assignment.experiment_key)
        .and_then(|experiment| experiment.variation_by_id(&assignment.variation_id))
        .filter(|_| assignment.enabled);

    feature
        .variables
        .iter()
        .map(|variable| {
            let raw = variation
                .and_then(|v| v.variable_value(&variable.id))
                .unwrap_or(variable.default_value.as_str());

            let value = variable.variable_type.resolve(raw).unwrap_or_else(|| {
                log::warn!(target: "decision_agent",
                           feature_key = feature.key.as_str(),
                           variable_key = variable.key.as_str(),
                           raw;
                           "variable value does not match its type, returning it as a string");
                serde_json::Value::String(raw.to_owned())
            });

            (variable.key.clone(), value)
        })
        .collect()
}
