/*!
 * IAS zone enrollment.
 *
 * A security sensor must complete the zone enrollment handshake before its
 * alarm reports are trusted. The compliant path answers the device's own
 * enroll request. A delayed fallback path exists for firmwares that never
 * send one and report a damaged IEEE identifier; it writes a repaired
 * identifier to the CIE address and proactively sends the enroll response.
 *
 * [`ZoneEnrollment`] is a pure state machine: it decides, the device runtime
 * performs the wireless I/O and feeds the outcome back in.
 */
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::Capability;

bitflags! {
    /// ZCL IAS zone status bitmap
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ZoneStatus: u16 {
        /// Primary alarm
        const ALARM1         = 0x0001;
        /// Secondary alarm
        const ALARM2         = 0x0002;
        /// Tamper
        const TAMPER         = 0x0004;
        /// Battery low
        const BATTERY_LOW    = 0x0008;
        /// Sends supervision reports
        const SUPERVISION    = 0x0010;
        /// Sends restore reports
        const RESTORE        = 0x0020;
        /// Trouble/failure
        const TROUBLE        = 0x0040;
        /// Mains fault
        const AC_FAULT       = 0x0080;
        /// Test mode
        const TEST           = 0x0100;
        /// Battery defect
        const BATTERY_DEFECT = 0x0200;
    }
}

impl ZoneStatus {
    /// Decode a raw status word, dropping reserved bits
    pub fn from_raw(raw: u16) -> Self {
        Self::from_bits_truncate(raw)
    }

    /// Whether either alarm bit is raised
    pub fn is_alarmed(&self) -> bool {
        self.intersects(ZoneStatus::ALARM1 | ZoneStatus::ALARM2)
    }

    /// Capability values carried by this status for a zone of `zone_type`
    pub fn capability_values(&self, zone_type: ZoneType) -> [(Capability, bool); 3] {
        [
            (zone_type.alarm_capability(), self.is_alarmed()),
            (Capability::AlarmTamper, self.contains(ZoneStatus::TAMPER)),
            (
                Capability::AlarmBattery,
                self.intersects(ZoneStatus::BATTERY_LOW | ZoneStatus::BATTERY_DEFECT),
            ),
        ]
    }
}

/// Hazard class a zone reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// Motion sensor (0x000D)
    Motion,
    /// Contact switch (0x0015)
    Contact,
    /// Fire sensor (0x0028)
    Fire,
    /// Water sensor (0x002A)
    Water,
    /// Carbon monoxide sensor (0x002B)
    CarbonMonoxide,
    /// Vibration/movement sensor (0x002D)
    Vibration,
    /// Any other zone type
    Generic,
}

impl ZoneType {
    /// Map a ZCL zone type code
    pub fn from_code(code: u16) -> Self {
        match code {
            0x000D => ZoneType::Motion,
            0x0015 => ZoneType::Contact,
            0x0028 => ZoneType::Fire,
            0x002A => ZoneType::Water,
            0x002B => ZoneType::CarbonMonoxide,
            0x002D => ZoneType::Vibration,
            _ => ZoneType::Generic,
        }
    }

    /// The alarm capability driven by the primary alarm bit
    pub fn alarm_capability(&self) -> Capability {
        match self {
            ZoneType::Motion => Capability::AlarmMotion,
            ZoneType::Contact => Capability::AlarmContact,
            ZoneType::Fire => Capability::AlarmSmoke,
            ZoneType::Water => Capability::AlarmWater,
            ZoneType::CarbonMonoxide => Capability::AlarmCo,
            ZoneType::Vibration => Capability::AlarmVibration,
            ZoneType::Generic => Capability::AlarmGeneric,
        }
    }
}

/// A well-formed 64-bit IEEE address, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IeeeAddress([u8; 8]);

impl IeeeAddress {
    /// Create from bytes in display order
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Bytes in display order
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Bytes in over-the-air order
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// All-zero and all-ones are reserved and never name a real radio
    pub fn is_reserved(&self) -> bool {
        self.0 == [0x00; 8] || self.0 == [0xFF; 8]
    }

    /// Rebuild an address from damaged text by keeping its first 16 hex digits
    pub fn repair(text: &str) -> Option<Self> {
        let digits: Vec<u8> = text
            .chars()
            .filter_map(|c| c.to_digit(16))
            .take(16)
            .map(|d| d as u8)
            .collect();
        if digits.len() < 16 {
            return None;
        }

        let mut bytes = [0u8; 8];
        for (byte, pair) in bytes.iter_mut().zip(digits.chunks(2)) {
            *byte = (pair[0] << 4) | pair[1];
        }
        let address = Self(bytes);
        (!address.is_reserved()).then_some(address)
    }
}

impl fmt::Display for IeeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

impl FromStr for IeeeAddress {
    type Err = String;

    /// Strict parse: `aa:bb:cc:dd:ee:ff:00:11` or 16 hex digits, optional `0x`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let compact = if s.contains(':') {
            let groups: Vec<&str> = s.split(':').collect();
            if groups.len() != 8 || groups.iter().any(|g| g.len() != 2) {
                return Err(format!("not a colon-separated IEEE address: {:?}", s));
            }
            groups.concat()
        } else {
            s.strip_prefix("0x").unwrap_or(s).to_string()
        };

        if compact.len() != 16 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not an IEEE address: {:?}", s));
        }

        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&compact[i * 2..i * 2 + 2], 16).map_err(|e| e.to_string())?;
        }
        Ok(Self(bytes))
    }
}

/// IEEE identifier exactly as a device reported it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIeeeAddress {
    /// Raw attribute bytes, display order
    Bytes(Vec<u8>),
    /// Textual form
    Text(String),
}

/// Outcome of inspecting a reported identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IeeeCheck {
    /// The identifier is usable as reported
    WellFormed(IeeeAddress),
    /// The identifier is damaged; `corrected` holds a repair when one exists
    Malformed {
        /// Repaired identifier
        corrected: Option<IeeeAddress>,
    },
}

impl RawIeeeAddress {
    /// Classify the identifier and repair it when possible
    pub fn check(&self) -> IeeeCheck {
        match self {
            RawIeeeAddress::Bytes(bytes) => {
                let fixed = bytes
                    .get(..8)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(IeeeAddress::new)
                    .filter(|a| !a.is_reserved());
                match fixed {
                    Some(address) if bytes.len() == 8 => IeeeCheck::WellFormed(address),
                    corrected => IeeeCheck::Malformed { corrected },
                }
            }
            RawIeeeAddress::Text(text) => match text.parse::<IeeeAddress>() {
                Ok(address) if !address.is_reserved() => IeeeCheck::WellFormed(address),
                _ => IeeeCheck::Malformed {
                    corrected: IeeeAddress::repair(text),
                },
            },
        }
    }
}

impl fmt::Display for RawIeeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawIeeeAddress::Bytes(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "[{}]", parts.join(" "))
            }
            RawIeeeAddress::Text(text) => write!(f, "{:?}", text),
        }
    }
}

/// Status code carried by a zone enroll response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnrollResponseCode {
    /// Enrollment accepted
    Success = 0x00,
    /// Zone type not supported
    NotSupported = 0x01,
    /// Enrollment not permitted
    NoEnrollPermit = 0x02,
    /// CIE has no free zone slots
    TooManyZones = 0x03,
}

/// Enroll response command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollResponse {
    /// Response status
    pub code: EnrollResponseCode,
    /// Zone identifier assigned to the device
    pub zone_id: u8,
}

impl EnrollResponse {
    /// Wire payload: `[code, zone_id]`
    pub fn to_bytes(&self) -> [u8; 2] {
        [self.code as u8, self.zone_id]
    }
}

/// Which path produced an enroll response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentPath {
    /// Answer to the device's own enroll request
    Primary,
    /// Proactive response after the compliant window elapsed
    Fallback,
}

/// Enrollment state of one device instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneEnrollmentState {
    /// No handshake completed
    Unenrolled,
    /// An enroll response is in flight
    AwaitingEnrollResponse,
    /// Handshake complete; zone status reports are trusted
    Enrolled,
    /// The handshake failed; retried on the next interview
    Faulted,
}

impl fmt::Display for ZoneEnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Evidence of a completed enrollment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    /// Assigned zone identifier
    pub zone_id: u8,
    /// Identifier the device reported, possibly malformed
    pub ieee_address: Option<RawIeeeAddress>,
    /// Path that completed the handshake
    pub path: EnrollmentPath,
    /// Completion time
    pub enrolled_at: DateTime<Utc>,
}

/// Inputs that drive the enrollment state machine
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentEvent {
    /// A (re-)interview began
    InterviewStarted {
        /// Identifier the device reported during the interview
        identifier: Option<RawIeeeAddress>,
    },
    /// The device sent a zone enroll request
    EnrollRequest {
        /// Zone type the device declared
        zone_type: ZoneType,
    },
    /// The compliant window of an interview session elapsed
    FallbackWindowElapsed {
        /// Session the timer was armed for
        session: u32,
    },
    /// The enroll response was delivered
    ResponseAcknowledged,
    /// The enroll response failed or was never acknowledged
    ResponseFailed {
        /// What went wrong
        reason: String,
    },
    /// The device was removed from the hub
    Removed,
}

impl EnrollmentEvent {
    fn name(&self) -> &'static str {
        match self {
            EnrollmentEvent::InterviewStarted { .. } => "interview_started",
            EnrollmentEvent::EnrollRequest { .. } => "enroll_request",
            EnrollmentEvent::FallbackWindowElapsed { .. } => "fallback_window_elapsed",
            EnrollmentEvent::ResponseAcknowledged => "response_acknowledged",
            EnrollmentEvent::ResponseFailed { .. } => "response_failed",
            EnrollmentEvent::Removed => "removed",
        }
    }
}

/// Work the caller must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentAction {
    /// Post `FallbackWindowElapsed { session }` after `after`
    ArmFallbackTimer {
        /// Session to echo back
        session: u32,
        /// Delay before the fallback may run
        after: Duration,
    },
    /// Send an enroll response, preceded by a CIE address write when set
    SendEnrollResponse {
        /// Response to send
        response: EnrollResponse,
        /// Path the response belongs to
        path: EnrollmentPath,
        /// Repaired identifier to write first
        cie_address: Option<IeeeAddress>,
    },
}

/// Zone enrollment state machine for one device instance
#[derive(Debug)]
pub struct ZoneEnrollment {
    zone_id: u8,
    fallback_window: Duration,
    state: ZoneEnrollmentState,
    session: u32,
    fallback_attempted: bool,
    pending_path: EnrollmentPath,
    identifier: Option<RawIeeeAddress>,
    zone_type: Option<ZoneType>,
    record: Option<EnrollmentRecord>,
    history: Vec<(ZoneEnrollmentState, &'static str, ZoneEnrollmentState)>,
}

impl ZoneEnrollment {
    /// Create an unenrolled state machine
    pub fn new(zone_id: u8, fallback_window: Duration) -> Self {
        Self {
            zone_id,
            fallback_window,
            state: ZoneEnrollmentState::Unenrolled,
            session: 0,
            fallback_attempted: false,
            pending_path: EnrollmentPath::Primary,
            identifier: None,
            zone_type: None,
            record: None,
            history: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ZoneEnrollmentState {
        self.state
    }

    /// Whether zone status reports are trusted
    pub fn is_enrolled(&self) -> bool {
        self.state == ZoneEnrollmentState::Enrolled
    }

    /// Current interview session
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Zone type declared by the device's enroll request
    pub fn zone_type(&self) -> Option<ZoneType> {
        self.zone_type
    }

    /// Record of the completed enrollment
    pub fn record(&self) -> Option<&EnrollmentRecord> {
        self.record.as_ref()
    }

    /// State changes since creation or the last reset as (from, event, to)
    pub fn history(&self) -> &[(ZoneEnrollmentState, &'static str, ZoneEnrollmentState)] {
        &self.history
    }

    /// Feed one event into the state machine
    pub fn trigger(&mut self, event: EnrollmentEvent) -> Option<EnrollmentAction> {
        let name = event.name();
        match (self.state, event) {
            (_, EnrollmentEvent::Removed) => {
                self.reset();
                None
            }

            (ZoneEnrollmentState::Enrolled, EnrollmentEvent::InterviewStarted { .. }) => {
                debug!("Zone already enrolled; interview leaves enrollment untouched");
                None
            }
            (_, EnrollmentEvent::InterviewStarted { identifier }) => {
                self.session = self.session.wrapping_add(1);
                self.fallback_attempted = false;
                self.identifier = identifier;
                self.transition(ZoneEnrollmentState::Unenrolled, name);
                Some(EnrollmentAction::ArmFallbackTimer {
                    session: self.session,
                    after: self.fallback_window,
                })
            }

            (ZoneEnrollmentState::Unenrolled, EnrollmentEvent::EnrollRequest { zone_type }) => {
                self.zone_type = Some(zone_type);
                self.pending_path = EnrollmentPath::Primary;
                self.transition(ZoneEnrollmentState::AwaitingEnrollResponse, name);
                Some(self.response(EnrollmentPath::Primary, None))
            }
            (ZoneEnrollmentState::Enrolled, EnrollmentEvent::EnrollRequest { zone_type }) => {
                debug!("Enroll request while enrolled; answering again");
                self.zone_type = Some(zone_type);
                Some(self.response(EnrollmentPath::Primary, None))
            }
            (state, EnrollmentEvent::EnrollRequest { .. }) => {
                debug!("Ignoring enroll request in state {}", state);
                None
            }

            (ZoneEnrollmentState::Unenrolled, EnrollmentEvent::FallbackWindowElapsed { session })
                if session == self.session && !self.fallback_attempted =>
            {
                self.fallback_attempted = true;
                self.fallback(name)
            }
            (state, EnrollmentEvent::FallbackWindowElapsed { session }) => {
                debug!(
                    "Stale fallback timer for session {} (current {}) in state {}",
                    session, self.session, state
                );
                None
            }

            (ZoneEnrollmentState::AwaitingEnrollResponse, EnrollmentEvent::ResponseAcknowledged) => {
                self.record = Some(EnrollmentRecord {
                    zone_id: self.zone_id,
                    ieee_address: self.identifier.clone(),
                    path: self.pending_path,
                    enrolled_at: Utc::now(),
                });
                self.transition(ZoneEnrollmentState::Enrolled, name);
                None
            }
            (ZoneEnrollmentState::AwaitingEnrollResponse, EnrollmentEvent::ResponseFailed { reason }) => {
                warn!("Zone enrollment failed: {}", reason);
                self.transition(ZoneEnrollmentState::Faulted, name);
                None
            }
            (state, EnrollmentEvent::ResponseAcknowledged | EnrollmentEvent::ResponseFailed { .. }) => {
                debug!("Ignoring {} in state {}", name, state);
                None
            }
        }
    }

    fn fallback(&mut self, name: &'static str) -> Option<EnrollmentAction> {
        let check = match &self.identifier {
            Some(identifier) => identifier.check(),
            None => {
                debug!("No identifier reported; fallback enrollment not applicable");
                return None;
            }
        };

        match check {
            IeeeCheck::WellFormed(address) => {
                debug!(
                    "Identifier {} is well-formed; waiting for a compliant enroll request",
                    address
                );
                None
            }
            IeeeCheck::Malformed {
                corrected: Some(address),
            } => {
                info!(
                    "No enroll request within {:?}; enrolling with repaired identifier {}",
                    self.fallback_window, address
                );
                self.pending_path = EnrollmentPath::Fallback;
                self.transition(ZoneEnrollmentState::AwaitingEnrollResponse, name);
                Some(self.response(EnrollmentPath::Fallback, Some(address)))
            }
            IeeeCheck::Malformed { corrected: None } => {
                // stays Unenrolled so a late compliant request can still enroll
                warn!(
                    "Identifier {} is malformed beyond repair; waiting for an enroll request",
                    self.identifier.as_ref().map(|i| i.to_string()).unwrap_or_default()
                );
                None
            }
        }
    }

    fn response(&self, path: EnrollmentPath, cie_address: Option<IeeeAddress>) -> EnrollmentAction {
        EnrollmentAction::SendEnrollResponse {
            response: EnrollResponse {
                code: EnrollResponseCode::Success,
                zone_id: self.zone_id,
            },
            path,
            cie_address,
        }
    }

    /// Forget everything learned about the device, history included
    pub fn reset(&mut self) {
        if self.state != ZoneEnrollmentState::Unenrolled {
            info!("Zone enrollment reset from {}", self.state);
        }
        self.state = ZoneEnrollmentState::Unenrolled;
        self.fallback_attempted = false;
        self.pending_path = EnrollmentPath::Primary;
        self.record = None;
        self.identifier = None;
        self.zone_type = None;
        self.history.clear();
    }

    fn transition(&mut self, target: ZoneEnrollmentState, event: &'static str) {
        let source = self.state;
        self.state = target;
        if source == target {
            return;
        }
        self.history.push((source, event, target));
        info!("Zone enrollment transitioned from {} to {} on {}", source, target, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    fn malformed() -> RawIeeeAddress {
        RawIeeeAddress::Text("00-12-4B-00-1A-2B-3C-4D?".into())
    }

    fn started(machine: &mut ZoneEnrollment, identifier: Option<RawIeeeAddress>) -> u32 {
        match machine.trigger(EnrollmentEvent::InterviewStarted { identifier }) {
            Some(EnrollmentAction::ArmFallbackTimer { session, after }) => {
                assert_eq!(after, WINDOW);
                session
            }
            other => panic!("expected fallback timer, got {:?}", other),
        }
    }

    #[test]
    fn test_status_bits() {
        let status = ZoneStatus::from_raw(0x0001 | 0x0004 | 0x8000);
        assert!(status.is_alarmed());
        assert!(status.contains(ZoneStatus::TAMPER));
        assert_eq!(status.bits(), 0x0005);

        let values = ZoneStatus::from_raw(0x0008).capability_values(ZoneType::Water);
        assert_eq!(
            values,
            [
                (Capability::AlarmWater, false),
                (Capability::AlarmTamper, false),
                (Capability::AlarmBattery, true),
            ]
        );
    }

    #[test]
    fn test_zone_types() {
        assert_eq!(ZoneType::from_code(0x000D).alarm_capability(), Capability::AlarmMotion);
        assert_eq!(ZoneType::from_code(0x0015).alarm_capability(), Capability::AlarmContact);
        assert_eq!(ZoneType::from_code(0x0028).alarm_capability(), Capability::AlarmSmoke);
        assert_eq!(ZoneType::from_code(0x002B).alarm_capability(), Capability::AlarmCo);
        assert_eq!(ZoneType::from_code(0x0225), ZoneType::Generic);
    }

    #[test]
    fn test_ieee_parse_and_repair() {
        let canonical: IeeeAddress = "00:12:4b:00:1a:2b:3c:4d".parse().unwrap();
        assert_eq!(canonical.to_string(), "00:12:4b:00:1a:2b:3c:4d");
        assert_eq!(canonical, "0x00124B001A2B3C4D".parse().unwrap());
        assert_eq!(canonical.to_le_bytes(), [0x4d, 0x3c, 0x2b, 0x1a, 0x00, 0x4b, 0x12, 0x00]);

        assert!(":4:ae:f:::9:fe:f:::f:6e:2:::0:bc".parse::<IeeeAddress>().is_err());
        assert_eq!(IeeeAddress::repair(":4:ae:f:::9:fe:f:::f:6e:2:::0:bc"), None);
        assert_eq!(IeeeAddress::repair("00-12-4B-00-1A-2B-3C-4D?"), Some(canonical));
        assert_eq!(IeeeAddress::repair("0000000000000000"), None);
    }

    #[test]
    fn test_raw_identifier_check() {
        let good = RawIeeeAddress::Bytes(vec![0, 0x12, 0x4b, 0, 0x1a, 0x2b, 0x3c, 0x4d]);
        assert!(matches!(good.check(), IeeeCheck::WellFormed(_)));

        let long = RawIeeeAddress::Bytes(vec![0, 0x12, 0x4b, 0, 0x1a, 0x2b, 0x3c, 0x4d, 0xff]);
        assert!(matches!(long.check(), IeeeCheck::Malformed { corrected: Some(_) }));

        let zero = RawIeeeAddress::Bytes(vec![0; 8]);
        assert_eq!(zero.check(), IeeeCheck::Malformed { corrected: None });

        assert!(matches!(malformed().check(), IeeeCheck::Malformed { corrected: Some(_) }));
    }

    #[test]
    fn test_primary_path() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(malformed()));

        let action = machine.trigger(EnrollmentEvent::EnrollRequest {
            zone_type: ZoneType::Motion,
        });
        assert_eq!(
            action,
            Some(EnrollmentAction::SendEnrollResponse {
                response: EnrollResponse {
                    code: EnrollResponseCode::Success,
                    zone_id: 10
                },
                path: EnrollmentPath::Primary,
                cie_address: None,
            })
        );
        assert_eq!(machine.state(), ZoneEnrollmentState::AwaitingEnrollResponse);

        machine.trigger(EnrollmentEvent::ResponseAcknowledged);
        assert!(machine.is_enrolled());
        assert_eq!(machine.record().map(|r| r.path), Some(EnrollmentPath::Primary));

        // the fallback timer firing afterwards is a no-op
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);
        assert!(machine.is_enrolled());
    }

    #[test]
    fn test_fallback_path_repairs_identifier() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(malformed()));

        let action = machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session });
        let expected: IeeeAddress = "00:12:4b:00:1a:2b:3c:4d".parse().unwrap();
        assert!(matches!(
            action,
            Some(EnrollmentAction::SendEnrollResponse {
                path: EnrollmentPath::Fallback,
                cie_address: Some(address),
                ..
            }) if address == expected
        ));

        machine.trigger(EnrollmentEvent::ResponseAcknowledged);
        assert!(machine.is_enrolled());
        assert_eq!(machine.record().map(|r| r.path), Some(EnrollmentPath::Fallback));
    }

    #[test]
    fn test_fallback_runs_once_per_session() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(malformed()));

        assert!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }).is_some());
        machine.trigger(EnrollmentEvent::ResponseFailed {
            reason: "no ack".into(),
        });
        assert_eq!(machine.state(), ZoneEnrollmentState::Faulted);
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);

        // the next interview retries
        let next = started(&mut machine, Some(malformed()));
        assert_eq!(machine.state(), ZoneEnrollmentState::Unenrolled);
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);
        assert!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session: next }).is_some());
    }

    #[test]
    fn test_fallback_skips_well_formed_and_unrepairable() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(RawIeeeAddress::Text("00:12:4b:00:1a:2b:3c:4d".into())));
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);
        assert_eq!(machine.state(), ZoneEnrollmentState::Unenrolled);

        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(RawIeeeAddress::Text("::1:".into())));
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);
        assert_eq!(machine.state(), ZoneEnrollmentState::Unenrolled);
    }

    #[test]
    fn test_late_request_enrolls_after_unrepairable_identifier() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        let session = started(&mut machine, Some(RawIeeeAddress::Text("::1:".into())));
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);

        let action = machine.trigger(EnrollmentEvent::EnrollRequest {
            zone_type: ZoneType::Motion,
        });
        assert!(matches!(
            action,
            Some(EnrollmentAction::SendEnrollResponse {
                path: EnrollmentPath::Primary,
                cie_address: None,
                ..
            })
        ));
        machine.trigger(EnrollmentEvent::ResponseAcknowledged);
        assert!(machine.is_enrolled());
        assert_eq!(machine.record().map(|r| r.path), Some(EnrollmentPath::Primary));

        // the fallback still ran only once for the session
        assert_eq!(machine.trigger(EnrollmentEvent::FallbackWindowElapsed { session }), None);
    }

    #[test]
    fn test_reinterviews_do_not_grow_history() {
        let mut machine = ZoneEnrollment::new(10, WINDOW);
        for _ in 0..5 {
            started(&mut machine, Some(malformed()));
        }
        assert!(machine.history().is_empty());

        machine.trigger(EnrollmentEvent::EnrollRequest {
            zone_type: ZoneType::Motion,
        });
        assert_eq!(machine.history().len(), 1);
        machine.trigger(EnrollmentEvent::ResponseFailed {
            reason: "timeout".into(),
        });
        started(&mut machine, Some(malformed()));
        assert_eq!(machine.history().len(), 3);
    }

    #[test]
    fn test_removed_destroys_record() {
        let mut machine = ZoneEnrollment::new(7, WINDOW);
        started(&mut machine, None);
        machine.trigger(EnrollmentEvent::EnrollRequest {
            zone_type: ZoneType::Contact,
        });
        machine.trigger(EnrollmentEvent::ResponseAcknowledged);
        assert_eq!(machine.record().map(|r| r.zone_id), Some(7));

        assert_eq!(machine.history().len(), 2);

        machine.trigger(EnrollmentEvent::Removed);
        assert!(machine.record().is_none());
        assert_eq!(machine.state(), ZoneEnrollmentState::Unenrolled);
        assert!(machine.history().is_empty());
        assert_eq!(machine.zone_type(), None);
    }
}
