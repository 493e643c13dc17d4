use std::sync::{Arc, Mutex};

use crate::{
    events::{Event, EventDispatcher},
    project_config::{
        EventDefinition, Experiment, ExperimentStatus, Feature, TrafficAllocation, Variable,
        VariableType, VariableValue, Variation,
    },
};

/// Collects dispatched events so tests can assert on them.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingDispatcher {
    pub fn new() -> RecordingDispatcher {
        RecordingDispatcher::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl EventDispatcher for RecordingDispatcher {
    fn dispatch(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// A running experiment whose variation ids are `"{experiment_id}-{variation_key}"`. All traffic is
/// allocated to the first variation.
pub fn experiment(id: &str, key: &str, variations: &[(&str, bool)]) -> Experiment {
    let variations: Vec<Variation> = variations
        .iter()
        .map(|(variation_key, feature_enabled)| Variation {
            id: format!("{id}-{variation_key}"),
            key: (*variation_key).to_owned(),
            feature_enabled: *feature_enabled,
            variables: vec![],
        })
        .collect();

    let traffic_allocation = variations
        .first()
        .map(|v| {
            vec![TrafficAllocation {
                entity_id: v.id.clone(),
                end_of_range: 10_000,
            }]
        })
        .unwrap_or_default();

    Experiment {
        id: id.to_owned(),
        key: key.to_owned(),
        status: ExperimentStatus::Running,
        audience_ids: vec![],
        variations,
        traffic_allocation,
    }
}

pub fn feature(id: &str, key: &str, experiment_ids: &[&str], variables: Vec<Variable>) -> Feature {
    Feature {
        id: id.to_owned(),
        key: key.to_owned(),
        experiment_ids: experiment_ids.iter().map(|e| (*e).to_owned()).collect(),
        variables,
    }
}

pub fn string_variable(id: &str, key: &str, default_value: &str) -> Variable {
    Variable {
        id: id.to_owned(),
        key: key.to_owned(),
        variable_type: VariableType::String,
        default_value: default_value.to_owned(),
    }
}

pub fn variable_value(id: &str, value: &str) -> VariableValue {
    VariableValue {
        id: id.to_owned(),
        value: value.to_owned(),
    }
}

pub fn event(id: &str, key: &str) -> EventDefinition {
    EventDefinition {
        id: id.to_owned(),
        key: key.to_owned(),
        experiment_ids: vec![],
    }
}
