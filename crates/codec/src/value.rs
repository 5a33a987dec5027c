//! Storage-neutral representation of encoded aggregate state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flat `field name → encoded value` map: the body of a snapshot.
pub type StateMap = BTreeMap<String, StateValue>;

/// A primitive-safe value inside a [`StateMap`].
///
/// Carries no type tags or type names. Structure is recovered from the
/// target type on decode. Serializes untagged, so a `StateMap` stores as a
/// plain JSON document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Explicit null marker (`None`, unit).
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned values that do not fit in `i64`.
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<StateValue>),
    Map(StateMap),
}

impl StateValue {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) | StateValue::UInt(_) => "integer",
            StateValue::Float(_) => "float",
            StateValue::String(_) => "string",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            StateValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<u64> for StateValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => StateValue::Int(v),
            Err(_) => StateValue::UInt(value),
        }
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(value: Vec<StateValue>) -> Self {
        StateValue::List(value)
    }
}

impl From<StateMap> for StateValue {
    fn from(value: StateMap) -> Self {
        StateValue::Map(value)
    }
}
