//! Events that drive machine instances.
//!
//! An event is a tagged value: a `type` plus an arbitrary payload. On the
//! wire it is a flat JSON object:
//!
//! ```json
//! {"type": "stage.touched", "position": {"x": 10, "y": 20}, "circleUnderPointer": null}
//! ```

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event sent to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, used to select transition rules.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event-specific payload. Opaque to the engine.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Creates an event with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
        }
    }

    /// Adds a payload field.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Parses an event from JSON. A bare string is an event with no payload.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        match json {
            Value::String(s) => Ok(Self::new(s.as_str())),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    /// Returns the event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Returns a payload field, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Returns the payload as a JSON object value.
    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

impl From<&str> for Event {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Event {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
