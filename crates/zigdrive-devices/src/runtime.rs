/*!
 * Per-device runtime.
 *
 * A [`DeviceRuntime`] owns everything known about one physical device and
 * processes its events strictly one at a time. Interviews classify the power
 * source and reconcile capabilities before the report path is armed, so no
 * capability value is written before the capability set is settled.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use zigdrive_core::config::{Config, HostConfig, ZoneConfig};
use zigdrive_core::logging::{component_span, operation_span, Span};
use zigdrive_core::types::{Id, Value};
use zigdrive_core::utils::{spawn_delayed, with_timeout};

use crate::capability::{Capability, CapabilitySet};
use crate::datapoint::{command, DatapointCodec, DatapointFrame};
use crate::device::{
    cluster, ClusterInventory, DeviceError, DeviceEvent, InboundReport, Interview, Result, TimerEvent,
};
use crate::host::{CapabilityHost, ZigbeeLink};
use crate::power::{PowerClassifier, PowerSourceReport, PowerVerdict};
use crate::profile::{BatterySource, DeviceProfile, DeviceSettings};
use crate::reconciler::CapabilityReconciler;
use crate::zone::{
    EnrollmentAction, EnrollmentEvent, ZoneEnrollment, ZoneEnrollmentState, ZoneStatus, ZoneType,
};

/// Sender half of a device inbox
pub type DeviceSender = mpsc::UnboundedSender<DeviceEvent>;

/// Receiver half of a device inbox
pub type DeviceInbox = mpsc::UnboundedReceiver<DeviceEvent>;

/// Runtime for one device instance
#[derive(Debug)]
pub struct DeviceRuntime<H: ?Sized, L: ?Sized> {
    id: Id,
    profile: Arc<DeviceProfile>,
    settings: DeviceSettings,
    zone_config: ZoneConfig,
    host_config: HostConfig,
    host: Arc<H>,
    link: Arc<L>,
    reconciler: CapabilityReconciler,
    enrollment: ZoneEnrollment,
    verdict: Option<PowerVerdict>,
    capabilities: CapabilitySet,
    inventory: ClusterInventory,
    armed: bool,
    removed: bool,
    sequence: u16,
    alarm_generations: HashMap<Capability, u64>,
    sender: DeviceSender,
    span: Span,
}

impl<H, L> DeviceRuntime<H, L>
where
    H: CapabilityHost + ?Sized,
    L: ZigbeeLink + ?Sized,
{
    /// Create a runtime and the inbox it reads from
    pub fn new(
        id: Id,
        profile: Arc<DeviceProfile>,
        config: &Config,
        host: Arc<H>,
        link: Arc<L>,
    ) -> (Self, DeviceInbox) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let span = component_span("device", Some(id.as_str()));

        let runtime = Self {
            enrollment: ZoneEnrollment::new(config.zone.zone_id, config.zone.fallback_window()),
            reconciler: CapabilityReconciler::new(config.host.call_timeout()),
            zone_config: config.zone.clone(),
            host_config: config.host.clone(),
            id,
            profile,
            settings: DeviceSettings::default(),
            host,
            link,
            verdict: None,
            capabilities: CapabilitySet::new(),
            inventory: ClusterInventory::new(),
            armed: false,
            removed: false,
            sequence: 0,
            alarm_generations: HashMap::new(),
            sender,
            span,
        };
        (runtime, inbox)
    }

    /// Apply per-device user settings
    pub fn with_settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Device identifier
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// A sender posting into this runtime's inbox
    pub fn sender(&self) -> DeviceSender {
        self.sender.clone()
    }

    /// Power verdict of the last interview
    pub fn verdict(&self) -> Option<PowerVerdict> {
        self.verdict
    }

    /// Capability set after the last reconciliation
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Zone enrollment state machine
    pub fn enrollment(&self) -> &ZoneEnrollment {
        &self.enrollment
    }

    /// Current zone enrollment state
    pub fn enrollment_state(&self) -> ZoneEnrollmentState {
        self.enrollment.state()
    }

    /// Whether reports are being processed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Process events until the device is removed
    ///
    /// The runtime keeps a sender to its own inbox for timers, so the loop
    /// ends on [`DeviceEvent::Removed`] rather than when callers hang up.
    pub async fn run(mut self, mut inbox: DeviceInbox) {
        info!(parent: &self.span, "Device runtime started for model {}", self.profile.model);
        while let Some(event) = inbox.recv().await {
            let last = matches!(event, DeviceEvent::Removed);
            self.handle(event).await;
            if last {
                break;
            }
        }
        info!(parent: &self.span, "Device runtime stopped");
    }

    /// Process one event to completion
    ///
    /// Failures are logged and recovered locally; nothing is surfaced.
    pub async fn handle(&mut self, event: DeviceEvent) {
        let span = self.span.clone();
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&mut self, event: DeviceEvent) {
        if self.removed {
            debug!("Device removed; ignoring {:?}", event);
            return;
        }

        match event {
            DeviceEvent::Interview(interview) => self.interview(interview).await,
            DeviceEvent::Report(report) if self.armed => self.report(report).await,
            DeviceEvent::Report(report) => {
                debug!("Dropping report before the first interview: {:?}", report);
            }
            DeviceEvent::SetCapability { capability, value } => {
                if let Err(e) = self.set_capability(capability, value).await {
                    warn!("Setting {} failed: {}", capability, e);
                }
            }
            DeviceEvent::Timer(timer) => self.timer(timer).await,
            DeviceEvent::Removed => self.remove(),
        }
    }

    async fn interview(&mut self, interview: Interview) {
        debug!("Interview with clusters {}", interview.inventory);
        self.inventory = interview.inventory;

        let verdict = self.classify(interview.power_source.as_ref());
        if self.verdict != Some(verdict) {
            info!("Power source is {}", verdict);
        }
        self.verdict = Some(verdict);

        let reconciled = self
            .reconciler
            .reconcile(verdict, &self.inventory, &self.profile.candidates, self.host.as_ref())
            .instrument(operation_span("reconcile", "device"))
            .await;
        match reconciled {
            Ok(result) => self.capabilities = result.capabilities,
            Err(e) => warn!("Capability reconciliation failed: {}", e),
        }
        self.armed = true;

        if let Some(decivolts) = interview.battery_voltage {
            if self.profile.battery.source == BatterySource::Voltage {
                let percentage = self.profile.battery.percentage_from_voltage(decivolts);
                self.publish_battery(percentage).await;
            }
        }

        if self.profile.zone.is_some() && self.inventory.has_anywhere(cluster::IAS_ZONE) {
            let action = self.enrollment.trigger(EnrollmentEvent::InterviewStarted {
                identifier: interview.ieee_address,
            });
            let endpoint = self.zone_endpoint();
            self.perform(action, endpoint).await;
        }
    }

    fn classify(&self, report: Option<&PowerSourceReport>) -> PowerVerdict {
        let declared = self.profile.battery.chemistry;
        let verdict = if let Some(pinned) = self.settings.power_override.verdict() {
            debug!("Power source pinned by settings to {}", pinned);
            pinned
        } else if let Some(report) = report {
            PowerClassifier::classify(report)
        } else {
            debug!("No power source reported; falling back to the profile");
            PowerClassifier::fallback(declared, self.profile.meters_power())
        };
        verdict.with_chemistry(declared)
    }

    async fn report(&mut self, report: InboundReport) {
        match report {
            InboundReport::PowerSource(source) => {
                debug!("Power source {:?} reported; re-evaluated on the next interview", source);
            }
            InboundReport::BatteryPercentage { raw, .. } => {
                if self.profile.battery.source == BatterySource::Percentage {
                    let percentage = self.profile.battery.percentage(raw);
                    self.publish_battery(percentage).await;
                }
            }
            InboundReport::BatteryVoltage { decivolts, .. } => {
                if self.profile.battery.source == BatterySource::Voltage {
                    let percentage = self.profile.battery.percentage_from_voltage(decivolts);
                    self.publish_battery(percentage).await;
                }
            }
            InboundReport::ZoneStatus { status, .. } => self.zone_status(status).await,
            InboundReport::ZoneEnrollRequest {
                endpoint,
                zone_type,
                manufacturer_code,
            } => {
                if self.profile.zone.is_none() {
                    debug!("Enroll request from a model without a zone; ignoring");
                    return;
                }
                debug!(
                    "Enroll request on endpoint {} for zone type {:#06x} (manufacturer {:#06x})",
                    endpoint, zone_type, manufacturer_code
                );
                let action = self.enrollment.trigger(EnrollmentEvent::EnrollRequest {
                    zone_type: ZoneType::from_code(zone_type),
                });
                self.perform(action, endpoint).await;
            }
            InboundReport::VendorCommand {
                command: cmd,
                payload,
                ..
            } => {
                if command::carries_datapoints(cmd) {
                    self.datapoints(&payload).await;
                } else {
                    debug!("Ignoring vendor command {:#04x}", cmd);
                }
            }
        }
    }

    async fn datapoints(&mut self, payload: &[u8]) {
        let decoded = DatapointCodec::decode(payload);
        if let Some(e) = &decoded.error {
            warn!(
                "Malformed datapoint frame {}: {}; keeping {} datapoints",
                decoded.frame.sequence,
                e,
                decoded.frame.datapoints.len()
            );
        }

        for dp in decoded.frame.datapoints {
            let mapping = match self.profile.datapoint(dp.id) {
                Some(mapping) => mapping.clone(),
                None => {
                    debug!("Unmapped datapoint {} ({})", dp.id, dp.kind);
                    continue;
                }
            };
            let value = dp
                .decode_value()
                .map_err(|e| DeviceError::Communication(e.to_string()))
                .and_then(|raw| mapping.to_capability(&raw));

            match value {
                Ok(Value::Float(percentage)) if mapping.capability == Capability::MeasureBattery => {
                    self.publish_battery(percentage).await
                }
                Ok(value) => self.publish(mapping.capability, value).await,
                Err(e) => warn!("Datapoint {} not applied: {}", dp.id, e),
            }
        }
    }

    async fn zone_status(&mut self, raw: u16) {
        if !self.enrollment.is_enrolled() {
            debug!("Dropping zone status {:#06x} from an unenrolled zone", raw);
            return;
        }

        let zone_type = self
            .profile
            .zone
            .as_ref()
            .and_then(|z| z.zone_type)
            .or(self.enrollment.zone_type())
            .unwrap_or(ZoneType::Generic);

        for (capability, raised) in ZoneStatus::from_raw(raw).capability_values(zone_type) {
            self.publish(capability, Value::Bool(raised)).await;
        }
    }

    async fn publish_battery(&mut self, percentage: f64) {
        self.publish(Capability::MeasureBattery, Value::Float(percentage))
            .await;
        let low = self.profile.battery.is_low(percentage);
        self.publish(Capability::AlarmBattery, Value::Bool(low)).await;
    }

    async fn publish(&mut self, capability: Capability, value: Value) {
        if !self.capabilities.contains(capability) {
            debug!("{} is not registered; dropping {}", capability, value);
            return;
        }

        if capability.is_momentary() {
            self.track_alarm(capability, value.as_bool().unwrap_or(false));
        }

        let call = self.host.set_capability_value(capability, value);
        if let Err(e) = with_timeout(self.host_config.call_timeout(), call).await {
            warn!("Writing {} failed: {}", capability, e);
        }
    }

    fn track_alarm(&mut self, capability: Capability, raised: bool) {
        let generation = self.alarm_generations.entry(capability).or_insert(0);
        *generation += 1;

        if let (true, Some(delay)) = (raised, self.zone_config.alarm_reset()) {
            let event = TimerEvent::AlarmReset {
                capability,
                generation: *generation,
            };
            self.post_after(delay, DeviceEvent::Timer(event));
        }
    }

    /// Send a capability change to the device as a Tuya datapoint
    pub async fn set_capability(&mut self, capability: Capability, value: Value) -> Result<()> {
        if !self.armed {
            return Err(DeviceError::NotSupported(
                "device has not been interviewed".to_string(),
            ));
        }
        if !capability.is_settable() {
            return Err(DeviceError::NotSupported(format!("{} is read-only", capability)));
        }
        capability.validate(&value)?;

        let mapping = self.profile.datapoint_for(capability).ok_or_else(|| {
            DeviceError::NotSupported(format!("{} has no datapoint on {}", capability, self.profile.model))
        })?;
        let datapoint = mapping.to_datapoint(&value)?;

        let frame = DatapointFrame::new(self.next_sequence()).with(datapoint);
        let payload = DatapointCodec::encode(&frame).map_err(|e| DeviceError::Communication(e.to_string()))?;
        let endpoint = self.inventory.endpoint_of(cluster::TUYA).unwrap_or(1);

        debug!("Sending {} = {} as frame {}", capability, value, frame.sequence);
        with_timeout(
            self.host_config.call_timeout(),
            self.link.send_vendor_command(endpoint, command::DATA_REQUEST, payload),
        )
        .await
    }

    async fn timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::EnrollmentFallback { session } => {
                let action = self
                    .enrollment
                    .trigger(EnrollmentEvent::FallbackWindowElapsed { session });
                let endpoint = self.zone_endpoint();
                self.perform(action, endpoint).await;
            }
            TimerEvent::AlarmReset {
                capability,
                generation,
            } => {
                if self.alarm_generations.get(&capability) == Some(&generation) {
                    debug!("Auto-resetting {}", capability);
                    self.publish(capability, Value::Bool(false)).await;
                } else {
                    debug!("Stale reset for {} (generation {})", capability, generation);
                }
            }
        }
    }

    async fn perform(&mut self, action: Option<EnrollmentAction>, endpoint: u8) {
        match action {
            None => {}
            Some(EnrollmentAction::ArmFallbackTimer { session, after }) => {
                self.post_after(after, DeviceEvent::Timer(TimerEvent::EnrollmentFallback { session }));
            }
            Some(EnrollmentAction::SendEnrollResponse {
                response,
                path,
                cie_address,
            }) => {
                debug!("Sending {:?} enroll response {:?} on endpoint {}", path, response, endpoint);
                let link = self.link.clone();
                let delivered = with_timeout(self.zone_config.response_timeout(), async move {
                    if let Some(address) = cie_address {
                        link.write_cie_address(endpoint, address).await?;
                    }
                    link.send_enroll_response(endpoint, response).await
                })
                .await;

                let outcome = match delivered {
                    Ok(()) => EnrollmentEvent::ResponseAcknowledged,
                    Err(e) => EnrollmentEvent::ResponseFailed { reason: e.to_string() },
                };
                self.enrollment.trigger(outcome);
            }
        }
    }

    fn remove(&mut self) {
        self.enrollment.trigger(EnrollmentEvent::Removed);
        self.armed = false;
        self.removed = true;
        info!("Device removed");
    }

    fn zone_endpoint(&self) -> u8 {
        self.profile
            .zone
            .as_ref()
            .and_then(|z| z.endpoint)
            .or_else(|| self.inventory.endpoint_of(cluster::IAS_ZONE))
            .unwrap_or(1)
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn post_after(&self, delay: Duration, event: DeviceEvent) {
        let sender = self.sender.clone();
        spawn_delayed(delay, async move {
            // the runtime may be gone by now
            let _ = sender.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{LinkCall, MemoryHost, MemoryLink};
    use crate::mapping::Conversion;
    use crate::power::{BatteryChemistry, PowerOverride};
    use crate::profile::ZoneProfile;
    use crate::zone::{EnrollmentPath, RawIeeeAddress};
    use bytes::Bytes;

    type TestRuntime = DeviceRuntime<MemoryHost, MemoryLink>;

    fn runtime(profile: DeviceProfile) -> (TestRuntime, DeviceInbox, Arc<MemoryHost>, Arc<MemoryLink>) {
        let host = Arc::new(MemoryHost::new());
        let link = Arc::new(MemoryLink::new());
        let (runtime, inbox) = DeviceRuntime::new(
            Id::from_string("dev-1"),
            Arc::new(profile),
            &Config::default(),
            host.clone(),
            link.clone(),
        );
        (runtime, inbox, host, link)
    }

    fn thermostat() -> DeviceProfile {
        DeviceProfile::new("TS0601_thermostat")
            .with_candidate(1, cluster::TUYA, Capability::TargetTemperature)
            .with_candidate(1, cluster::TUYA, Capability::OnOff)
            .with_datapoint(1, Capability::OnOff, Conversion::Boolean { invert: false })
            .with_datapoint(
                2,
                Capability::TargetTemperature,
                Conversion::Scaled {
                    divisor: 10.0,
                    clamp: None,
                },
            )
    }

    fn tuya_interview(power: u8) -> Interview {
        Interview {
            inventory: ClusterInventory::new().with_endpoint(1, [cluster::BASIC, cluster::TUYA]),
            power_source: Some(PowerSourceReport::Code(power)),
            ..Interview::default()
        }
    }

    #[tokio::test]
    async fn test_reports_before_interview_are_dropped() {
        let (mut runtime, _inbox, host, _link) = runtime(thermostat());
        runtime
            .handle(DeviceEvent::Report(InboundReport::BatteryPercentage { endpoint: 1, raw: 100 }))
            .await;
        assert!(!runtime.is_armed());
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_interview_reconciles_before_arming() {
        let (mut runtime, _inbox, host, _link) = runtime(thermostat());
        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;

        assert!(runtime.is_armed());
        assert_eq!(runtime.verdict(), Some(PowerVerdict::Ac));
        assert_eq!(
            host.registered(),
            CapabilitySet::from([Capability::OnOff, Capability::TargetTemperature])
        );
    }

    #[tokio::test]
    async fn test_refused_capabilities_are_never_written() {
        let (mut runtime, _inbox, host, _link) = runtime(thermostat());
        host.refuse_adds(true);
        runtime.handle(DeviceEvent::Interview(tuya_interview(0x03))).await;

        assert!(runtime.is_armed());
        assert!(runtime.capabilities().is_empty());
        runtime
            .handle(DeviceEvent::Report(InboundReport::BatteryPercentage { endpoint: 1, raw: 100 }))
            .await;
        assert!(host.writes().is_empty());
    }

    #[tokio::test]
    async fn test_override_and_fallback_classification() {
        let profile = thermostat();
        let (runtime_a, ..) = runtime(profile.clone());
        let mut pinned = runtime_a.with_settings(DeviceSettings {
            power_override: PowerOverride::Battery,
        });
        pinned.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;
        assert_eq!(pinned.verdict(), Some(PowerVerdict::Battery(BatteryChemistry::Unknown)));

        let mut profile = profile;
        profile.battery.chemistry = Some(BatteryChemistry::Cr2032);
        let (mut declared, ..) = runtime(profile);
        let mut interview = tuya_interview(0x01);
        interview.power_source = None;
        declared.handle(DeviceEvent::Interview(interview)).await;
        assert_eq!(declared.verdict(), Some(PowerVerdict::Battery(BatteryChemistry::Cr2032)));
    }

    #[tokio::test]
    async fn test_set_capability_encodes_datapoint_request() {
        let (mut runtime, _inbox, _host, link) = runtime(thermostat());
        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;

        runtime
            .set_capability(Capability::TargetTemperature, Value::Float(21.5))
            .await
            .unwrap();
        runtime.set_capability(Capability::OnOff, Value::Bool(true)).await.unwrap();

        let calls = link.calls();
        assert_eq!(
            calls[0],
            LinkCall::Vendor(
                1,
                command::DATA_REQUEST,
                Bytes::from_static(&[0x00, 0x01, 0x02, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xD7])
            )
        );
        // each command carries its own sequence number
        assert_eq!(
            calls[1],
            LinkCall::Vendor(
                1,
                command::DATA_REQUEST,
                Bytes::from_static(&[0x00, 0x02, 0x01, 0x01, 0x00, 0x01, 0x01])
            )
        );
    }

    #[tokio::test]
    async fn test_set_capability_rejections() {
        let (mut runtime, _inbox, _host, link) = runtime(thermostat());
        assert!(runtime.set_capability(Capability::OnOff, Value::Bool(true)).await.is_err());

        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;
        assert!(matches!(
            runtime.set_capability(Capability::Dim, Value::Float(0.5)).await,
            Err(DeviceError::NotSupported(_))
        ));
        assert!(matches!(
            runtime.set_capability(Capability::OnOff, Value::Float(1.0)).await,
            Err(DeviceError::InvalidValueType(..))
        ));
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn test_vendor_report_updates_capabilities() {
        let (mut runtime, _inbox, host, _link) = runtime(thermostat());
        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;

        let frame = DatapointFrame::new(9)
            .with(crate::datapoint::Datapoint::bool(1, true))
            .with(crate::datapoint::Datapoint::value(2, 205))
            .with(crate::datapoint::Datapoint::value(99, 1));
        let payload = DatapointCodec::encode(&frame).unwrap();
        runtime
            .handle(DeviceEvent::Report(InboundReport::VendorCommand {
                endpoint: 1,
                command: command::DATA_REPORT,
                payload,
            }))
            .await;

        assert_eq!(host.last_value(Capability::OnOff), Some(Value::Bool(true)));
        assert_eq!(host.last_value(Capability::TargetTemperature), Some(Value::Float(20.5)));
    }

    #[tokio::test]
    async fn test_zone_status_ignored_until_enrolled() {
        let profile = DeviceProfile::new("TS0202")
            .with_candidate(1, cluster::IAS_ZONE, Capability::AlarmMotion)
            .with_zone(ZoneProfile::default());
        let (mut runtime, _inbox, host, link) = runtime(profile);

        let interview = Interview {
            inventory: ClusterInventory::new().with_endpoint(1, [cluster::POWER_CONFIG, cluster::IAS_ZONE]),
            power_source: Some(PowerSourceReport::Code(0x03)),
            ieee_address: Some(RawIeeeAddress::Text("00:12:4b:00:1a:2b:3c:4d".into())),
            ..Interview::default()
        };
        runtime.handle(DeviceEvent::Interview(interview)).await;

        let status = DeviceEvent::Report(InboundReport::ZoneStatus { endpoint: 1, status: 0x0001 });
        runtime.handle(status.clone()).await;
        assert_eq!(host.last_value(Capability::AlarmMotion), None);

        runtime
            .handle(DeviceEvent::Report(InboundReport::ZoneEnrollRequest {
                endpoint: 1,
                zone_type: 0x000D,
                manufacturer_code: 0x1002,
            }))
            .await;
        assert_eq!(runtime.enrollment_state(), ZoneEnrollmentState::Enrolled);
        assert_eq!(
            runtime.enrollment().record().map(|r| r.path),
            Some(EnrollmentPath::Primary)
        );
        assert_eq!(link.enroll_responses().len(), 1);

        runtime.handle(status).await;
        assert_eq!(host.last_value(Capability::AlarmMotion), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_removed_ignores_later_events() {
        let (mut runtime, _inbox, host, _link) = runtime(thermostat());
        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;
        runtime.handle(DeviceEvent::Removed).await;
        host.clear_calls();

        runtime.handle(DeviceEvent::Interview(tuya_interview(0x01))).await;
        assert!(host.calls().is_empty());
        assert!(!runtime.is_armed());
    }
}
