/*!
 * Per-model device profiles.
 *
 * A profile is plain data: which capability each advertised cluster implies,
 * how vendor datapoints map to capabilities, and how the battery is read.
 * Profiles are loaded once into a read-only [`ProfileCatalog`] and shared
 * with every device runtime through an `Arc`.
 */
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::Capability;
use crate::device::{cluster, DeviceError, Result};
use crate::mapping::{Conversion, DatapointMapping};
use crate::power::{BatteryChemistry, PowerOverride};
use crate::zone::ZoneType;

/// A capability implied by one cluster on one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCandidate {
    /// Endpoint the cluster must be advertised on
    pub endpoint: u8,
    /// Cluster identifier
    pub cluster: u16,
    /// Capability registered when the cluster is present
    pub capability: Capability,
}

impl CapabilityCandidate {
    /// Whether the candidate measures power or energy
    pub fn is_metering(&self) -> bool {
        cluster::METERING_CLUSTERS.contains(&self.cluster)
            || matches!(self.capability, Capability::MeasurePower | Capability::MeterPower)
    }
}

/// Which power-configuration attribute reports the battery level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatterySource {
    /// `batteryPercentageRemaining`
    #[default]
    Percentage,
    /// `batteryVoltage`, mapped through the chemistry window
    Voltage,
}

fn default_battery_divisor() -> f64 {
    2.0
}

fn default_low_threshold() -> f64 {
    10.0
}

/// Battery reading parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryProfile {
    /// Divisor applied to `batteryPercentageRemaining`
    #[serde(default = "default_battery_divisor")]
    pub divisor: f64,
    /// Declared chemistry
    #[serde(default)]
    pub chemistry: Option<BatteryChemistry>,
    /// `alarm_battery` is raised at or below this percentage
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Attribute used for the battery level
    #[serde(default)]
    pub source: BatterySource,
}

impl Default for BatteryProfile {
    fn default() -> Self {
        Self {
            divisor: default_battery_divisor(),
            chemistry: None,
            low_threshold: default_low_threshold(),
            source: BatterySource::default(),
        }
    }
}

impl BatteryProfile {
    /// Battery percentage from a raw `batteryPercentageRemaining` value
    pub fn percentage(&self, raw: u8) -> f64 {
        (f64::from(raw) / self.divisor).clamp(0.0, 100.0)
    }

    /// Battery percentage from a raw `batteryVoltage` value (0.1 V units)
    pub fn percentage_from_voltage(&self, decivolts: u8) -> f64 {
        self.chemistry
            .unwrap_or_default()
            .percent_from_voltage(f64::from(decivolts) / 10.0)
    }

    /// Whether `percentage` counts as low
    pub fn is_low(&self, percentage: f64) -> bool {
        percentage <= self.low_threshold
    }
}

/// IAS zone parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneProfile {
    /// Endpoint carrying the zone cluster; the lowest advertising one if unset
    #[serde(default)]
    pub endpoint: Option<u8>,
    /// Zone type to assume when the device never declares one
    #[serde(default)]
    pub zone_type: Option<ZoneType>,
}

/// Static description of one device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Model identifier
    pub model: String,
    /// Cluster-implied capabilities
    #[serde(default)]
    pub candidates: Vec<CapabilityCandidate>,
    /// Vendor datapoint bindings
    #[serde(default)]
    pub datapoints: Vec<DatapointMapping>,
    /// Battery reading parameters
    #[serde(default)]
    pub battery: BatteryProfile,
    /// Present for IAS zone devices
    #[serde(default)]
    pub zone: Option<ZoneProfile>,
}

impl DeviceProfile {
    /// Create an empty profile
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            candidates: Vec::new(),
            datapoints: Vec::new(),
            battery: BatteryProfile::default(),
            zone: None,
        }
    }

    /// Builder-style helper adding a candidate capability
    pub fn with_candidate(mut self, endpoint: u8, cluster: u16, capability: Capability) -> Self {
        self.candidates.push(CapabilityCandidate {
            endpoint,
            cluster,
            capability,
        });
        self
    }

    /// Builder-style helper adding a datapoint mapping
    pub fn with_datapoint(mut self, id: u8, capability: Capability, conversion: Conversion) -> Self {
        self.datapoints.push(DatapointMapping {
            id,
            capability,
            conversion,
        });
        self
    }

    /// Builder-style helper marking the model as an IAS zone device
    pub fn with_zone(mut self, zone: ZoneProfile) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Mapping for a datapoint id
    pub fn datapoint(&self, id: u8) -> Option<&DatapointMapping> {
        self.datapoints.iter().find(|m| m.id == id)
    }

    /// Mapping that writes a capability, for outbound commands
    pub fn datapoint_for(&self, capability: Capability) -> Option<&DatapointMapping> {
        self.datapoints.iter().find(|m| m.capability == capability)
    }

    /// Whether any candidate measures power or energy
    pub fn meters_power(&self) -> bool {
        self.candidates.iter().any(CapabilityCandidate::is_metering)
    }

    /// Check the profile for contradictions
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(DeviceError::Profile("model must not be empty".to_string()));
        }
        if self.battery.divisor <= 0.0 {
            return Err(DeviceError::Profile(format!(
                "{}: battery divisor must be positive",
                self.model
            )));
        }

        let mut seen = BTreeSet::new();
        for mapping in &self.datapoints {
            if !seen.insert(mapping.id) {
                return Err(DeviceError::Profile(format!(
                    "{}: datapoint {} mapped twice",
                    self.model, mapping.id
                )));
            }
            if let Conversion::Scaled { divisor, .. } = mapping.conversion {
                if divisor == 0.0 {
                    return Err(DeviceError::Profile(format!(
                        "{}: datapoint {} has a zero divisor",
                        self.model, mapping.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Per-device user settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Power source override
    #[serde(default)]
    pub power_override: PowerOverride,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    profiles: Vec<DeviceProfile>,
}

/// Read-only set of device profiles keyed by model
#[derive(Debug, Default)]
pub struct ProfileCatalog {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ProfileCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document holding `[[profiles]]` tables
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let document: CatalogDocument =
            toml::from_str(document).map_err(|e| DeviceError::Profile(e.to_string()))?;

        let mut catalog = Self::new();
        for profile in document.profiles {
            catalog.insert(profile)?;
        }
        Ok(catalog)
    }

    /// Load a TOML catalog from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Profile(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_toml_str(&document)?;
        debug!("Loaded {} device profiles from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Add a profile, rejecting invalid ones and duplicate models
    pub fn insert(&mut self, profile: DeviceProfile) -> Result<()> {
        profile.validate()?;
        if self.profiles.contains_key(&profile.model) {
            return Err(DeviceError::Profile(format!(
                "model {} defined twice",
                profile.model
            )));
        }
        self.profiles.insert(profile.model.clone(), Arc::new(profile));
        Ok(())
    }

    /// Profile for a model
    pub fn get(&self, model: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.get(model).cloned()
    }

    /// Number of profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
