/*!
 * Hub capability vocabulary.
 *
 * Capability identifiers and their value types are a fixed contract with
 * the hub; nothing outside this enum may be registered or written.
 */
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use zigdrive_core::types::Value;

use crate::device::{DeviceError, Result};

/// A capability the hub recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// On/off switch
    #[serde(rename = "onoff")]
    OnOff,
    /// Dim level, 0.0 to 1.0
    Dim,
    /// Temperature in °C
    MeasureTemperature,
    /// Relative humidity in %
    MeasureHumidity,
    /// Illuminance in lux
    MeasureLuminance,
    /// Instantaneous power in W
    MeasurePower,
    /// Cumulative energy in kWh
    MeterPower,
    /// Voltage in V
    MeasureVoltage,
    /// Current in A
    MeasureCurrent,
    /// Battery level in %
    MeasureBattery,
    /// Low-battery alarm
    AlarmBattery,
    /// Motion alarm
    AlarmMotion,
    /// Contact (door/window) alarm
    AlarmContact,
    /// Water leak alarm
    AlarmWater,
    /// Smoke alarm
    AlarmSmoke,
    /// Carbon monoxide alarm
    AlarmCo,
    /// Tamper alarm
    AlarmTamper,
    /// Vibration alarm
    AlarmVibration,
    /// Alarm with no more specific hazard type
    AlarmGeneric,
    /// Thermostat setpoint in °C
    TargetTemperature,
    /// Cover position, 0.0 to 1.0
    WindowcoveringsSet,
}

/// The value type a capability accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `Value::Bool`
    Boolean,
    /// `Value::Integer` or `Value::Float`
    Number,
}

impl Capability {
    /// Every capability in the vocabulary
    pub const ALL: [Capability; 21] = [
        Capability::OnOff,
        Capability::Dim,
        Capability::MeasureTemperature,
        Capability::MeasureHumidity,
        Capability::MeasureLuminance,
        Capability::MeasurePower,
        Capability::MeterPower,
        Capability::MeasureVoltage,
        Capability::MeasureCurrent,
        Capability::MeasureBattery,
        Capability::AlarmBattery,
        Capability::AlarmMotion,
        Capability::AlarmContact,
        Capability::AlarmWater,
        Capability::AlarmSmoke,
        Capability::AlarmCo,
        Capability::AlarmTamper,
        Capability::AlarmVibration,
        Capability::AlarmGeneric,
        Capability::TargetTemperature,
        Capability::WindowcoveringsSet,
    ];

    /// Capabilities that only make sense on battery-powered devices
    pub const BATTERY: [Capability; 2] = [Capability::MeasureBattery, Capability::AlarmBattery];

    /// The identifier the hub uses for this capability
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::OnOff => "onoff",
            Capability::Dim => "dim",
            Capability::MeasureTemperature => "measure_temperature",
            Capability::MeasureHumidity => "measure_humidity",
            Capability::MeasureLuminance => "measure_luminance",
            Capability::MeasurePower => "measure_power",
            Capability::MeterPower => "meter_power",
            Capability::MeasureVoltage => "measure_voltage",
            Capability::MeasureCurrent => "measure_current",
            Capability::MeasureBattery => "measure_battery",
            Capability::AlarmBattery => "alarm_battery",
            Capability::AlarmMotion => "alarm_motion",
            Capability::AlarmContact => "alarm_contact",
            Capability::AlarmWater => "alarm_water",
            Capability::AlarmSmoke => "alarm_smoke",
            Capability::AlarmCo => "alarm_co",
            Capability::AlarmTamper => "alarm_tamper",
            Capability::AlarmVibration => "alarm_vibration",
            Capability::AlarmGeneric => "alarm_generic",
            Capability::TargetTemperature => "target_temperature",
            Capability::WindowcoveringsSet => "windowcoverings_set",
        }
    }

    /// The value type accepted by `set_capability_value`
    pub fn value_kind(&self) -> ValueKind {
        match self {
            Capability::OnOff
            | Capability::AlarmBattery
            | Capability::AlarmMotion
            | Capability::AlarmContact
            | Capability::AlarmWater
            | Capability::AlarmSmoke
            | Capability::AlarmCo
            | Capability::AlarmTamper
            | Capability::AlarmVibration
            | Capability::AlarmGeneric => ValueKind::Boolean,
            _ => ValueKind::Number,
        }
    }

    /// Inclusive bounds for numeric capabilities with a fixed range
    pub fn range(&self) -> Option<(f64, f64)> {
        match self {
            Capability::Dim | Capability::WindowcoveringsSet => Some((0.0, 1.0)),
            Capability::MeasureBattery | Capability::MeasureHumidity => Some((0.0, 100.0)),
            _ => None,
        }
    }

    /// Whether this capability reports battery state
    pub fn is_battery(&self) -> bool {
        Self::BATTERY.contains(self)
    }

    /// Alarms that describe an event rather than a lasting condition
    pub fn is_momentary(&self) -> bool {
        matches!(self, Capability::AlarmMotion | Capability::AlarmVibration)
    }

    /// Whether the hub may ask the device to change this capability
    pub fn is_settable(&self) -> bool {
        matches!(
            self,
            Capability::OnOff
                | Capability::Dim
                | Capability::TargetTemperature
                | Capability::WindowcoveringsSet
        )
    }

    /// Check that `value` has the type this capability accepts
    pub fn validate(&self, value: &Value) -> Result<()> {
        let ok = match self.value_kind() {
            ValueKind::Boolean => value.is_bool(),
            ValueKind::Number => value.is_numeric(),
        };
        if !ok {
            return Err(DeviceError::InvalidValueType(
                self.as_str().to_string(),
                format!("{:?}", self.value_kind()).to_lowercase(),
                value.type_name().to_string(),
            ));
        }

        if let (Some((min, max)), Some(v)) = (self.range(), value.as_float()) {
            if v < min || v > max {
                return Err(DeviceError::ValueOutOfRange(
                    self.as_str().to_string(),
                    format!("{} is outside {}..={}", v, min, max),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DeviceError::UnknownCapability(s.to_string()))
    }
}

/// Ordered set of capabilities registered with the hub for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the capability is registered
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Register a capability, returning whether it was newly added
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    /// Unregister a capability, returning whether it was present
    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    /// Iterate in capability order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no capability is registered
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Capabilities in `self` but not in `other`
    pub fn difference<'a>(&'a self, other: &'a CapabilitySet) -> impl Iterator<Item = Capability> + 'a {
        self.0.difference(&other.0).copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("measure_battery_pct".parse::<Capability>().is_err());
    }

    #[test]
    fn test_serde_uses_hub_identifiers() {
        assert_eq!(serde_json::to_string(&Capability::OnOff).unwrap(), "\"onoff\"");
        assert_eq!(serde_json::to_string(&Capability::AlarmCo).unwrap(), "\"alarm_co\"");
        let cap: Capability = serde_json::from_str("\"windowcoverings_set\"").unwrap();
        assert_eq!(cap, Capability::WindowcoveringsSet);
    }

    #[test]
    fn test_validate_value_types() {
        assert!(Capability::AlarmMotion.validate(&Value::Bool(true)).is_ok());
        assert!(matches!(
            Capability::AlarmMotion.validate(&Value::Integer(1)),
            Err(DeviceError::InvalidValueType(..))
        ));
        assert!(Capability::MeasureBattery.validate(&Value::Float(25.0)).is_ok());
        assert!(matches!(
            Capability::MeasureBattery.validate(&Value::Float(120.0)),
            Err(DeviceError::ValueOutOfRange(..))
        ));
        assert!(Capability::MeasureTemperature.validate(&Value::Float(-12.5)).is_ok());
    }

    #[test]
    fn test_capability_set_is_ordered() {
        let set = CapabilitySet::from([
            Capability::AlarmBattery,
            Capability::OnOff,
            Capability::MeasureBattery,
        ]);
        let order: Vec<Capability> = set.iter().collect();
        assert_eq!(
            order,
            vec![Capability::OnOff, Capability::MeasureBattery, Capability::AlarmBattery]
        );
        assert_eq!(set.to_string(), "[onoff, measure_battery, alarm_battery]");
    }
}
