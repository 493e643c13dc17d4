//! Audience condition matching.
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{
    project_config::{Audience, Experiment, ProjectConfig},
    user::{AttributeValue, Attributes},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Attribute name the condition is evaluated against.
    pub name: String,
    #[serde(rename = "match")]
    pub match_type: MatchType,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn eval(&self, attributes: &Attributes) -> bool {
        self.match_type.eval(attributes.get(&self.name), &self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Exists,
    Substring,
    Gt,
    Ge,
    Lt,
    Le,
    SemverEq,
    SemverGt,
    SemverGe,
    SemverLt,
    SemverLe,
    Regex,
    OneOf,
}

impl MatchType {
    /// Apply the match to an attribute. Returns `false` when the match cannot be applied
    /// (missing attribute, type mismatch, unparsable regex or version).
    pub fn eval(&self, attribute: Option<&AttributeValue>, value: &serde_json::Value) -> bool {
        self.try_eval(attribute, value).unwrap_or(false)
    }

    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        value: &serde_json::Value,
    ) -> Option<bool> {
        use serde_json::Value;

        match self {
            Self::Exists => Some(!matches!(attribute, None | Some(AttributeValue::Null))),

            Self::Exact => Some(match (attribute?, value) {
                (AttributeValue::String(a), Value::String(v)) => a == v,
                (AttributeValue::Number(a), Value::Number(v)) => Some(*a) == v.as_f64(),
                (AttributeValue::Boolean(a), Value::Bool(v)) => a == v,
                _ => return None,
            }),

            Self::Substring => match (attribute?, value) {
                (AttributeValue::String(a), Value::String(v)) => Some(a.contains(v.as_str())),
                _ => None,
            },

            Self::Gt | Self::Ge | Self::Lt | Self::Le => {
                let a = match attribute? {
                    AttributeValue::Number(n) => *n,
                    AttributeValue::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                let v = match value {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                Some(match self {
                    Self::Gt => a > v,
                    Self::Ge => a >= v,
                    Self::Lt => a < v,
                    _ => a <= v,
                })
            }

            Self::SemverEq | Self::SemverGt | Self::SemverGe | Self::SemverLt | Self::SemverLe => {
                let a = match attribute? {
                    AttributeValue::String(s) => Version::parse(s).ok()?,
                    _ => return None,
                };
                let v = match value {
                    Value::String(s) => Version::parse(s).ok()?,
                    _ => return None,
                };
                Some(match self {
                    Self::SemverEq => a == v,
                    Self::SemverGt => a > v,
                    Self::SemverGe => a >= v,
                    Self::SemverLt => a < v,
                    _ => a <= v,
                })
            }

            Self::Regex => match (attribute?, value) {
                (AttributeValue::String(a), Value::String(pattern)) => {
                    Some(Regex::new(pattern).ok()?.is_match(a))
                }
                _ => None,
            },

            Self::OneOf => {
                let a = match attribute? {
                    AttributeValue::String(s) => s.clone(),
                    AttributeValue::Number(n) => n.to_string(),
                    AttributeValue::Boolean(b) => b.to_string(),
                    _ => return None,
                };
                let Value::Array(candidates) = value else {
                    return None;
                };
                Some(
                    candidates
                        .iter()
                        .any(|c| matches!(c, Value::String(s) if *s == a)),
                )
            }
        }
    }
}

impl Audience {
    /// An audience is satisfied when all of its conditions hold.
    pub fn eval(&self, attributes: &Attributes) -> bool {
        self.conditions.iter().all(|c| c.eval(attributes))
    }
}

/// Return `true` if the user with `attributes` qualifies for `experiment`. Experiments without
/// audiences admit everyone; otherwise at least one audience must be satisfied. Audience ids
/// missing from the configuration never match.
pub fn user_qualifies(
    config: &ProjectConfig,
    experiment: &Experiment,
    attributes: &Attributes,
) -> bool {
    experiment.audience_ids.is_empty()
        || experiment.audience_ids.iter().any(|id| {
            config
                .audience(id)
                .is_some_and(|audience| audience.eval(attributes))
        })
}
