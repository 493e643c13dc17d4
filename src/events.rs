use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::user::Attributes;

/// Free-form tags attached to a conversion event (e.g., `revenue`, `value`).
pub type EventTags = HashMap<String, serde_json::Value>;

/// Emitted when a decision backed by an experiment is activated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionEvent {
    pub user_id: String,
    pub attributes: Attributes,
    pub experiment_id: String,
    pub experiment_key: String,
    pub variation_id: String,
    pub variation_key: String,
    /// Set when the impression comes from a feature activation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when an event is tracked for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
    pub user_id: String,
    pub attributes: Attributes,
    pub event_id: String,
    pub event_key: String,
    pub tags: EventTags,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Impression(ImpressionEvent),
    Conversion(ConversionEvent),
}

impl Event {
    pub fn user_id(&self) -> &str {
        match self {
            Event::Impression(e) => &e.user_id,
            Event::Conversion(e) => &e.user_id,
        }
    }
}

/// Sink for impression and conversion events. Implementations forward events to analytics
/// storage; dispatching must not block the caller for long.
pub trait EventDispatcher {
    fn dispatch(&self, event: Event);
}

pub(crate) struct NoopEventDispatcher;
impl EventDispatcher for NoopEventDispatcher {
    fn dispatch(&self, _event: Event) {}
}

impl<T: Fn(Event)> EventDispatcher for T {
    fn dispatch(&self, event: Event) {
        self(event);
    }
}
