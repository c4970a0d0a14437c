/*!
 * Power-source classification.
 *
 * Vendors report the Basic cluster power source either as the ZCL
 * enumeration or as free text. Classification never fails: anything that
 * cannot be recognised is treated as a battery device, because a mains
 * device with a spare battery capability is harmless while a battery device
 * misread as mains loses its low-battery warnings.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Raw power-source attribute as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PowerSourceReport {
    /// ZCL power-source enumeration
    Code(u8),
    /// Vendor free text ("mains", "bat", ...)
    Text(String),
}

impl From<u8> for PowerSourceReport {
    fn from(code: u8) -> Self {
        PowerSourceReport::Code(code)
    }
}

impl From<&str> for PowerSourceReport {
    fn from(text: &str) -> Self {
        PowerSourceReport::Text(text.to_string())
    }
}

/// Battery chemistry of a battery-powered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatteryChemistry {
    /// 3 V coin cell
    Cr2032,
    /// 3 V coin cell, higher capacity
    Cr2450,
    /// AAA cells
    Aaa,
    /// AA cells
    Aa,
    /// Not known
    #[default]
    Unknown,
}

impl BatteryChemistry {
    /// Empty/full voltage window used to estimate charge from voltage
    pub fn voltage_window(&self) -> (f64, f64) {
        match self {
            BatteryChemistry::Cr2032 | BatteryChemistry::Cr2450 => (2.1, 3.0),
            BatteryChemistry::Aaa | BatteryChemistry::Aa => (2.0, 3.2),
            BatteryChemistry::Unknown => (2.0, 3.0),
        }
    }

    /// Estimate the remaining charge in percent from a voltage reading
    pub fn percent_from_voltage(&self, volts: f64) -> f64 {
        let (empty, full) = self.voltage_window();
        let ratio = ((volts - empty) / (full - empty)).clamp(0.0, 1.0);
        (ratio * 100.0).round()
    }
}

impl fmt::Display for BatteryChemistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatteryChemistry::Cr2032 => "CR2032",
            BatteryChemistry::Cr2450 => "CR2450",
            BatteryChemistry::Aaa => "AAA",
            BatteryChemistry::Aa => "AA",
            BatteryChemistry::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How a device is powered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerVerdict {
    /// Mains powered
    Ac,
    /// Low-voltage DC supply
    DcLowVoltage,
    /// Battery powered
    Battery(BatteryChemistry),
}

impl PowerVerdict {
    /// Whether the device runs on batteries
    pub fn is_battery(&self) -> bool {
        matches!(self, PowerVerdict::Battery(_))
    }

    /// Fill in a known chemistry when the verdict is battery of unknown kind
    pub fn with_chemistry(self, chemistry: Option<BatteryChemistry>) -> Self {
        match (self, chemistry) {
            (PowerVerdict::Battery(BatteryChemistry::Unknown), Some(known)) => PowerVerdict::Battery(known),
            (verdict, _) => verdict,
        }
    }
}

impl fmt::Display for PowerVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerVerdict::Ac => write!(f, "AC"),
            PowerVerdict::DcLowVoltage => write!(f, "DC"),
            PowerVerdict::Battery(chemistry) => write!(f, "BATTERY({})", chemistry),
        }
    }
}

/// User setting that pins the power source instead of detecting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOverride {
    /// Detect from the device's reports
    #[default]
    Auto,
    /// Force mains
    Ac,
    /// Force low-voltage DC
    Dc,
    /// Force battery
    Battery,
}

impl PowerOverride {
    /// The pinned verdict, or `None` when detection should run
    pub fn verdict(&self) -> Option<PowerVerdict> {
        match self {
            PowerOverride::Auto => None,
            PowerOverride::Ac => Some(PowerVerdict::Ac),
            PowerOverride::Dc => Some(PowerVerdict::DcLowVoltage),
            PowerOverride::Battery => Some(PowerVerdict::Battery(BatteryChemistry::Unknown)),
        }
    }
}

/// Stateless power-source classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerClassifier;

impl PowerClassifier {
    /// Classify a raw power-source report
    pub fn classify(report: &PowerSourceReport) -> PowerVerdict {
        let verdict = match report {
            PowerSourceReport::Code(code) => Self::classify_code(*code),
            PowerSourceReport::Text(text) => Self::classify_text(text),
        };
        debug!("Power source {:?} classified as {}", report, verdict);
        verdict
    }

    /// Map the ZCL power-source enumeration; bit 7 only flags a backup battery
    pub fn classify_code(code: u8) -> PowerVerdict {
        match code & 0x7F {
            0x01 | 0x02 | 0x05 | 0x06 => PowerVerdict::Ac,
            0x04 => PowerVerdict::DcLowVoltage,
            _ => PowerVerdict::Battery(BatteryChemistry::Unknown),
        }
    }

    /// Map vendor free text through the synonym table
    pub fn classify_text(text: &str) -> PowerVerdict {
        match text.trim().to_lowercase().as_str() {
            "mains" | "main" | "ac" => PowerVerdict::Ac,
            "battery" | "bat" => PowerVerdict::Battery(BatteryChemistry::Unknown),
            other => {
                debug!("Unrecognised power source text {:?}, assuming battery", other);
                PowerVerdict::Battery(BatteryChemistry::Unknown)
            }
        }
    }

    /// Verdict for a device that never answered the power-source read
    ///
    /// A declared chemistry wins, then a metering capability implies mains,
    /// and otherwise the device is assumed to be on batteries.
    pub fn fallback(declared: Option<BatteryChemistry>, meters_power: bool) -> PowerVerdict {
        match declared {
            Some(chemistry) => PowerVerdict::Battery(chemistry),
            None if meters_power => PowerVerdict::Ac,
            None => PowerVerdict::Battery(BatteryChemistry::Unknown),
        }
    }
}
