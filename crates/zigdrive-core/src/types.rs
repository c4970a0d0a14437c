/*!
 * Core data types for zigdrive.
 *
 * Device instances are named by an opaque [`Id`]; capability values cross
 * the hub boundary as a [`Value`].
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one device instance on the hub
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Random identifier, for devices the hub has not named yet
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use the hub's own identifier
    pub fn from_string<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    /// The identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// A capability value as the hub stores it
///
/// The hub only knows booleans, numbers and strings; integers and floats are
/// interchangeable wherever a number is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean capability (on/off, alarms)
    Bool(bool),
    /// Whole number
    Integer(i64),
    /// Measured or scaled number
    Float(f64),
    /// Enumerated capability
    String(String),
}

impl Value {
    /// Whether the value is a boolean
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Whether the value is a number of either kind
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// The boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    /// The number as `f64`, if this is one
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    /// The text, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value's type in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => b.fmt(f),
            Value::Integer(i) => i.fmt(f),
            Value::Float(v) => v.fmt(f),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        assert_ne!(Id::new(), Id::new());
        let id: Id = "0x00124b001a2b3c4d".into();
        assert_eq!(id.as_str(), "0x00124b001a2b3c4d");
        assert_eq!(id.to_string(), "0x00124b001a2b3c4d");
    }

    #[test]
    fn test_numbers_are_interchangeable() {
        assert_eq!(Value::from(42i64).as_float(), Some(42.0));
        assert_eq!(Value::from(21.5).as_float(), Some(21.5));
        assert!(Value::Integer(1).is_numeric());
        assert_eq!(Value::Integer(1).type_name(), Value::Float(1.0).type_name());
        assert_eq!(Value::from(true).as_float(), None);
        assert_eq!(Value::from("eco").as_str(), Some("eco"));
    }

    #[test]
    fn test_serde_is_untagged() {
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
        let v: Value = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, Value::Float(12.5));
        assert_eq!(serde_json::to_string(&Value::Integer(7)).unwrap(), "7");
    }
}
