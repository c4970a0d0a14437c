/*!
 * Device-level types shared across the runtime.
 *
 * This module defines the device error type, the Zigbee cluster inventory
 * captured at interview time and the events a device runtime consumes.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use zigdrive_core::{error::Error as CoreError, types::Value};

use crate::capability::Capability;
use crate::power::PowerSourceReport;
use crate::zone::RawIeeeAddress;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The hub refused a capability add/remove/write
    #[error("Host rejected {0}")]
    HostRejected(String),

    /// A wireless command could not be delivered
    #[error("Communication error: {0}")]
    Communication(String),

    /// The value type is not valid for the capability
    #[error("Invalid value type for capability {0}: expected {1}, got {2}")]
    InvalidValueType(String, String, String),

    /// The value is out of range for the capability
    #[error("Value out of range for capability {0}: {1}")]
    ValueOutOfRange(String, String),

    /// The identifier is not part of the hub vocabulary
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// The device cannot perform the request
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A per-model profile is invalid
    #[error("Profile error: {0}")]
    Profile(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl DeviceError {
    /// Whether the error was produced by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Core(e) if e.is_timeout())
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Zigbee cluster identifiers the runtime understands
pub mod cluster {
    /// Basic (carries the power-source attribute)
    pub const BASIC: u16 = 0x0000;
    /// Power configuration (battery percentage and voltage)
    pub const POWER_CONFIG: u16 = 0x0001;
    /// On/off
    pub const ON_OFF: u16 = 0x0006;
    /// Level control
    pub const LEVEL_CONTROL: u16 = 0x0008;
    /// Window covering
    pub const WINDOW_COVERING: u16 = 0x0102;
    /// Thermostat
    pub const THERMOSTAT: u16 = 0x0201;
    /// Illuminance measurement
    pub const ILLUMINANCE_MEASUREMENT: u16 = 0x0400;
    /// Temperature measurement
    pub const TEMPERATURE_MEASUREMENT: u16 = 0x0402;
    /// Relative humidity measurement
    pub const HUMIDITY_MEASUREMENT: u16 = 0x0405;
    /// Occupancy sensing
    pub const OCCUPANCY_SENSING: u16 = 0x0406;
    /// IAS zone
    pub const IAS_ZONE: u16 = 0x0500;
    /// Smart-energy metering
    pub const METERING: u16 = 0x0702;
    /// Electrical measurement
    pub const ELECTRICAL_MEASUREMENT: u16 = 0x0B04;
    /// Tuya manufacturer-specific datapoint cluster
    pub const TUYA: u16 = 0xEF00;

    /// Clusters that indicate an energy/mains metering device
    pub const METERING_CLUSTERS: [u16; 2] = [METERING, ELECTRICAL_MEASUREMENT];
}

/// Endpoint → cluster inventory advertised by a device at interview time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInventory(BTreeMap<u8, BTreeSet<u16>>);

impl ClusterInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper adding one endpoint's clusters
    pub fn with_endpoint<I: IntoIterator<Item = u16>>(mut self, endpoint: u8, clusters: I) -> Self {
        self.0.entry(endpoint).or_default().extend(clusters);
        self
    }

    /// Whether the endpoint advertised the cluster
    pub fn has(&self, endpoint: u8, cluster: u16) -> bool {
        self.0.get(&endpoint).map_or(false, |c| c.contains(&cluster))
    }

    /// Whether any endpoint advertised the cluster
    pub fn has_anywhere(&self, cluster: u16) -> bool {
        self.0.values().any(|c| c.contains(&cluster))
    }

    /// Lowest endpoint advertising the cluster
    pub fn endpoint_of(&self, cluster: u16) -> Option<u8> {
        self.0
            .iter()
            .find(|(_, clusters)| clusters.contains(&cluster))
            .map(|(ep, _)| *ep)
    }

    /// Whether a metering or electrical-measurement cluster is advertised
    pub fn has_metering(&self) -> bool {
        cluster::METERING_CLUSTERS.iter().any(|c| self.has_anywhere(*c))
    }

    /// Whether the device advertised nothing at all
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|c| c.is_empty())
    }
}

impl fmt::Display for ClusterInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (ep, clusters) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            let ids: Vec<String> = clusters.iter().map(|c| format!("0x{:04X}", c)).collect();
            write!(f, "ep{}: {}", ep, ids.join(","))?;
        }
        Ok(())
    }
}

/// Everything learned about a device during one (re-)interview
#[derive(Debug, Clone, Default)]
pub struct Interview {
    /// Advertised endpoint/cluster inventory
    pub inventory: ClusterInventory,
    /// Raw power-source attribute, if the device answered
    pub power_source: Option<PowerSourceReport>,
    /// Battery voltage in 0.1 V units, if the device answered
    pub battery_voltage: Option<u8>,
    /// The device's self-reported IEEE identifier, possibly malformed
    pub ieee_address: Option<RawIeeeAddress>,
}

/// An inbound report addressed to one endpoint of the device
#[derive(Debug, Clone)]
pub enum InboundReport {
    /// Basic cluster power-source attribute
    PowerSource(PowerSourceReport),
    /// Power configuration `batteryPercentageRemaining` (half-percent units)
    BatteryPercentage {
        /// Source endpoint
        endpoint: u8,
        /// Raw attribute value
        raw: u8,
    },
    /// Power configuration `batteryVoltage` (0.1 V units)
    BatteryVoltage {
        /// Source endpoint
        endpoint: u8,
        /// Raw attribute value
        decivolts: u8,
    },
    /// IAS zone status attribute report or change notification
    ZoneStatus {
        /// Source endpoint
        endpoint: u8,
        /// Zone status bitmap
        status: u16,
    },
    /// IAS zone enroll request issued by the device
    ZoneEnrollRequest {
        /// Source endpoint
        endpoint: u8,
        /// Zone type the device declares
        zone_type: u16,
        /// Manufacturer code the device declares
        manufacturer_code: u16,
    },
    /// Manufacturer-specific command on the Tuya cluster
    VendorCommand {
        /// Source endpoint
        endpoint: u8,
        /// Cluster command identifier
        command: u8,
        /// Command payload
        payload: Bytes,
    },
}

/// Timer expirations posted back into a device's inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The compliant enrollment window of an interview session elapsed
    EnrollmentFallback {
        /// Interview session the timer was armed for
        session: u32,
    },
    /// A raised alarm is due to be cleared
    AlarmReset {
        /// Alarm capability to clear
        capability: Capability,
        /// Report generation the timer was armed for
        generation: u64,
    },
}

/// Events a device runtime processes, one at a time
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The device was (re-)interviewed
    Interview(Interview),
    /// The device sent a report
    Report(InboundReport),
    /// The hub asks the device to change a capability
    SetCapability {
        /// Target capability
        capability: Capability,
        /// Requested value
        value: Value,
    },
    /// A timer armed by the runtime fired
    Timer(TimerEvent),
    /// The device was removed from the hub
    Removed,
}
