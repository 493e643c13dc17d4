//! Immutable project configuration snapshot and its JSON datafile representation.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{conditions::Condition, Result};

/// `TryParse` allows a single entity to fail parsing without failing the whole datafile.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Wire representation of the datafile served by the configuration origin.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Datafile {
    #[serde(default)]
    revision: String,
    #[serde(default)]
    feature_flags: Vec<TryParse<Feature>>,
    #[serde(default)]
    experiments: Vec<TryParse<Experiment>>,
    #[serde(default)]
    events: Vec<TryParse<EventDefinition>>,
    #[serde(default)]
    audiences: Vec<TryParse<Audience>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    pub default_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Integer,
    Double,
    Boolean,
    Json,
}

impl VariableType {
    /// Convert a raw datafile value into a typed JSON value. Returns `None` if the raw value does
    /// not parse as this type.
    pub fn resolve(&self, raw: &str) -> Option<serde_json::Value> {
        match self {
            VariableType::String => Some(serde_json::Value::String(raw.to_owned())),
            VariableType::Integer => raw.parse::<i64>().ok().map(Into::into),
            VariableType::Double => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number),
            VariableType::Boolean => raw.parse::<bool>().ok().map(Into::into),
            VariableType::Json => serde_json::from_str(raw).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Running,
    Launched,
    Paused,
    #[serde(rename = "Not started")]
    NotStarted,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
}

impl Experiment {
    /// Only running and launched experiments bucket users.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ExperimentStatus::Running | ExperimentStatus::Launched
        )
    }

    pub fn variation_by_key(&self, key: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.key == key)
    }

    pub fn variation_by_id(&self, id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: bool,
    #[serde(default)]
    pub variables: Vec<VariableValue>,
}

impl Variation {
    pub fn variable_value(&self, variable_id: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|v| v.id == variable_id)
            .map(|v| v.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    pub id: String,
    pub value: String,
}

/// Maps the bucket range `[previous end, end_of_range)` to a variation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    pub entity_id: String,
    pub end_of_range: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Precomputed, serializable overview of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub revision: String,
    pub features: BTreeMap<String, FeatureSummary>,
    pub experiments: BTreeMap<String, ExperimentSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSummary {
    pub experiment_keys: Vec<String>,
    pub variable_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub id: String,
    pub variation_keys: Vec<String>,
}

/// An immutable point-in-time view of all features, experiments, events and audiences of an
/// application. A snapshot never changes once built; a newer configuration is a new snapshot.
#[derive(Debug)]
pub struct ProjectConfig {
    revision: String,
    features: HashMap<String, Feature>,
    experiments: HashMap<String, Experiment>,
    experiment_keys_by_id: HashMap<String, String>,
    events: HashMap<String, EventDefinition>,
    audiences: HashMap<String, Audience>,
    summary: ConfigSummary,
}

impl ProjectConfig {
    pub fn new(
        revision: impl Into<String>,
        features: Vec<Feature>,
        experiments: Vec<Experiment>,
        events: Vec<EventDefinition>,
        audiences: Vec<Audience>,
    ) -> ProjectConfig {
        let experiment_keys_by_id = experiments
            .iter()
            .map(|e| (e.id.clone(), e.key.clone()))
            .collect();

        let mut config = ProjectConfig {
            revision: revision.into(),
            features: features.into_iter().map(|f| (f.key.clone(), f)).collect(),
            experiments: experiments
                .into_iter()
                .map(|e| (e.key.clone(), e))
                .collect(),
            experiment_keys_by_id,
            events: events.into_iter().map(|e| (e.key.clone(), e)).collect(),
            audiences: audiences.into_iter().map(|a| (a.id.clone(), a)).collect(),
            summary: ConfigSummary::default(),
        };
        config.summary = config.compute_summary();
        config
    }

    /// Parse a JSON datafile. Individual entities that fail to parse are skipped and logged.
    pub fn from_datafile(bytes: &[u8]) -> Result<ProjectConfig> {
        let datafile: Datafile = serde_json::from_slice(bytes)?;

        Ok(ProjectConfig::new(
            datafile.revision,
            parsed_entities("feature", datafile.feature_flags),
            parsed_entities("experiment", datafile.experiments),
            parsed_entities("event", datafile.events),
            parsed_entities("audience", datafile.audiences),
        ))
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn feature(&self, key: &str) -> Option<&Feature> {
        self.features.get(key)
    }

    pub fn experiment(&self, key: &str) -> Option<&Experiment> {
        self.experiments.get(key)
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Experiment> {
        self.experiment_keys_by_id
            .get(id)
            .and_then(|key| self.experiments.get(key))
    }

    pub fn event(&self, key: &str) -> Option<&EventDefinition> {
        self.events.get(key)
    }

    pub fn audience(&self, id: &str) -> Option<&Audience> {
        self.audiences.get(id)
    }

    pub fn summary(&self) -> &ConfigSummary {
        &self.summary
    }

    fn compute_summary(&self) -> ConfigSummary {
        let features = self
            .features
            .values()
            .map(|feature| {
                let summary = FeatureSummary {
                    experiment_keys: feature
                        .experiment_ids
                        .iter()
                        .filter_map(|id| self.experiment_keys_by_id.get(id).cloned())
                        .collect(),
                    variable_keys: feature.variables.iter().map(|v| v.key.clone()).collect(),
                };
                (feature.key.clone(), summary)
            })
            .collect();

        let experiments = self
            .experiments
            .values()
            .map(|experiment| {
                let summary = ExperimentSummary {
                    id: experiment.id.clone(),
                    variation_keys: experiment.variations.iter().map(|v| v.key.clone()).collect(),
                };
                (experiment.key.clone(), summary)
            })
            .collect();

        ConfigSummary {
            revision: self.revision.clone(),
            features,
            experiments,
        }
    }
}

fn parsed_entities<T>(kind: &'static str, entities: Vec<TryParse<T>>) -> Vec<T> {
    entities
        .into_iter()
        .filter_map(|entity| match entity {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(json) => {
                log::warn!(target: "decision_agent", kind, entity:serde = json; "skipping entity that failed to parse");
                None
            }
        })
        .collect()
}
