use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Attributes describing a user, keyed by attribute name.
pub type Attributes = HashMap<String, AttributeValue>;

#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
    /// Structured values (arrays, objects). Conditions never match against them.
    Json(serde_json::Value),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// The user a decision or event is computed for. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl UserContext {
    pub fn new(id: impl Into<String>) -> UserContext {
        UserContext {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(id: impl Into<String>, attributes: Attributes) -> UserContext {
        UserContext {
            id: id.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeValue, UserContext};

    #[test]
    fn deserializes_untagged_attributes() {
        let user: UserContext = serde_json::from_str(
            r#"{"id": "u1", "attributes": {"plan": "pro", "age": 31, "beta": true, "x": null, "tags": ["a"]}}"#,
        )
        .unwrap();

        assert_eq!(user.attribute("plan"), Some(&AttributeValue::from("pro")));
        assert_eq!(user.attribute("age"), Some(&AttributeValue::Number(31.0)));
        assert_eq!(user.attribute("beta"), Some(&AttributeValue::Boolean(true)));
        assert_eq!(user.attribute("x"), Some(&AttributeValue::Null));
        assert!(matches!(user.attribute("tags"), Some(AttributeValue::Json(_))));
    }

    #[test]
    fn attributes_default_to_empty() {
        let user: UserContext = serde_json::from_str(r#"{"id": "u1"}"#).unwrap();
        assert_eq!(user, UserContext::new("u1"));
    }
}
