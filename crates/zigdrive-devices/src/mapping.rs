/*!
 * Datapoint ↔ capability conversions.
 *
 * Scale factors and enum tables are per model and per datapoint id, so they
 * live in the device profile rather than in the codec.
 */
use serde::{Deserialize, Serialize};

use zigdrive_core::types::Value;

use crate::capability::Capability;
use crate::datapoint::{Datapoint, DatapointValue};
use crate::device::{DeviceError, Result};

fn default_divisor() -> f64 {
    1.0
}

/// How a datapoint value becomes a capability value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversion {
    /// Boolean capability, optionally inverted
    Boolean {
        /// Flip the device's sense
        #[serde(default)]
        invert: bool,
    },
    /// Numeric capability: `raw / divisor`, optionally clamped
    Scaled {
        /// Divisor applied to the raw integer
        #[serde(default = "default_divisor")]
        divisor: f64,
        /// Inclusive bounds applied after scaling
        #[serde(default)]
        clamp: Option<(f64, f64)>,
    },
    /// Enum index looked up in a table of numeric values
    Enum {
        /// Capability value for each index
        values: Vec<f64>,
    },
}

/// Binding of one datapoint id to one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointMapping {
    /// Datapoint id
    pub id: u8,
    /// Target capability
    pub capability: Capability,
    /// Value conversion
    pub conversion: Conversion,
}

impl DatapointMapping {
    /// Convert an inbound datapoint value into a capability value
    pub fn to_capability(&self, value: &DatapointValue) -> Result<Value> {
        let number = match value {
            DatapointValue::Value(n) => Some(f64::from(*n)),
            DatapointValue::Enum(n) => Some(f64::from(*n)),
            DatapointValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        };

        match (&self.conversion, value, number) {
            (Conversion::Boolean { invert }, DatapointValue::Bool(b), _) => Ok(Value::Bool(*b != *invert)),
            (Conversion::Boolean { invert }, _, Some(n)) => Ok(Value::Bool((n != 0.0) != *invert)),
            (Conversion::Scaled { divisor, clamp }, _, Some(n)) => {
                let mut scaled = n / divisor;
                if let Some((min, max)) = clamp {
                    scaled = scaled.clamp(*min, *max);
                }
                Ok(Value::Float(scaled))
            }
            (Conversion::Enum { values }, DatapointValue::Enum(index), _) => values
                .get(usize::from(*index))
                .map(|v| Value::Float(*v))
                .ok_or_else(|| {
                    DeviceError::ValueOutOfRange(
                        self.capability.to_string(),
                        format!("enum index {} has no mapping", index),
                    )
                }),
            _ => Err(DeviceError::InvalidValueType(
                self.capability.to_string(),
                self.expected().to_string(),
                format!("{:?}", value),
            )),
        }
    }

    /// Convert a capability value into the outbound datapoint
    pub fn to_datapoint(&self, value: &Value) -> Result<Datapoint> {
        let mismatch = || {
            DeviceError::InvalidValueType(
                self.capability.to_string(),
                self.expected().to_string(),
                value.type_name().to_string(),
            )
        };

        match &self.conversion {
            Conversion::Boolean { invert } => {
                let on = value.as_bool().ok_or_else(mismatch)?;
                Ok(Datapoint::bool(self.id, on != *invert))
            }
            Conversion::Scaled { divisor, .. } => {
                let raw = (value.as_float().ok_or_else(mismatch)? * divisor).round();
                if raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
                    return Err(DeviceError::ValueOutOfRange(
                        self.capability.to_string(),
                        format!("{} does not fit a datapoint value", raw),
                    ));
                }
                Ok(Datapoint::value(self.id, raw as i32))
            }
            Conversion::Enum { values } => {
                let wanted = value.as_float().ok_or_else(mismatch)?;
                let index = values
                    .iter()
                    .position(|v| (v - wanted).abs() < f64::EPSILON)
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or_else(|| {
                        DeviceError::ValueOutOfRange(
                            self.capability.to_string(),
                            format!("{} is not one of {:?}", wanted, values),
                        )
                    })?;
                Ok(Datapoint::enumeration(self.id, index))
            }
        }
    }

    fn expected(&self) -> &'static str {
        match self.conversion {
            Conversion::Boolean { .. } => "boolean",
            Conversion::Scaled { .. } | Conversion::Enum { .. } => "number",
        }
    }
}
