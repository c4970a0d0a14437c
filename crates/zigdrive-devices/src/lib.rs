/*!
 * zigdrive Devices
 *
 * This crate provides the per-device runtime for Zigbee sensors and
 * actuators: power-source classification, capability reconciliation,
 * the Tuya datapoint codec and IAS zone enrollment.
 */

#![warn(missing_docs)]

// Re-export core types
pub use zigdrive_core::prelude;

pub mod capability;
pub mod datapoint;
pub mod device;
pub mod host;
pub mod mapping;
pub mod power;
pub mod profile;
pub mod reconciler;
pub mod runtime;
pub mod zone;

// Re-export the types most callers need
pub use capability::{Capability, CapabilitySet};
pub use datapoint::{Datapoint, DatapointCodec, DatapointFrame, DatapointType};
pub use device::{ClusterInventory, DeviceError, DeviceEvent, InboundReport, Interview, TimerEvent};
pub use host::{CapabilityHost, ZigbeeLink};
pub use power::{BatteryChemistry, PowerClassifier, PowerOverride, PowerSourceReport, PowerVerdict};
pub use profile::{DeviceProfile, DeviceSettings, ProfileCatalog};
pub use reconciler::{CapabilityReconciler, Reconciliation};
pub use runtime::DeviceRuntime;
pub use zone::{ZoneEnrollment, ZoneEnrollmentState};

/// zigdrive devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
