use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";

/// Attribute map of an entity, keyed by Home Assistant attribute name.
pub type Attributes = serde_json::Map<String, Value>;

/// Identifier attached to every outgoing service call and echoed back on the
/// state changes it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An attribute value that could not be read as a number.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{entity_id}: attribute '{key}' is not numeric: {value}")]
pub struct MalformedValue {
    pub entity_id: String,
    pub key: String,
    pub value: String,
}

/// State of one entity as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,

    /// Primary value: HVAC mode for climates, reading for sensors, `on`/`off`
    /// for binary sensors.
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    #[serde(default = "SystemTime::now")]
    pub last_changed: SystemTime,

    /// Correlation id of the service call that caused this state, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<CorrelationId>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Attributes::new(),
            last_changed: SystemTime::now(),
            context: None,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Unavailable and unknown entities are excluded from aggregation.
    pub fn is_available(&self) -> bool {
        self.state != STATE_UNAVAILABLE && self.state != STATE_UNKNOWN
    }

    /// Attribute value, treating JSON `null` as absent.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(Value::as_str)
    }

    /// Numeric attribute. Numeric strings are accepted; anything else is
    /// reported as malformed.
    pub fn attr_f64(&self, key: &str) -> Result<Option<f64>, MalformedValue> {
        match self.attr(key) {
            None => Ok(None),
            Some(value) => coerce_number(value).map(Some).ok_or_else(|| MalformedValue {
                entity_id: self.entity_id.clone(),
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// String list attribute; non-string items are skipped.
    pub fn attr_list(&self, key: &str) -> Vec<String> {
        self.attr(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The primary value read as a number (sensor readings, number entities).
    pub fn state_f64(&self) -> Result<f64, MalformedValue> {
        self.state.trim().parse::<f64>().map_err(|_| MalformedValue {
            entity_id: self.entity_id.clone(),
            key: "state".to_string(),
            value: self.state.clone(),
        })
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Snapshot of everything the engine publishes: one entry per climate group,
/// keyed by group key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub groups: BTreeMap<String, crate::climate::GroupSnapshot>,
}
