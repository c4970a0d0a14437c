/*!
 * Outbound seams to the hub and the Zigbee stack.
 *
 * The device runtime never talks to the platform directly; it goes through
 * [`CapabilityHost`] for the hub capability API and [`ZigbeeLink`] for
 * wireless commands. [`memory`] provides recording in-process versions.
 */
use async_trait::async_trait;
use bytes::Bytes;

use zigdrive_core::types::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::device::Result;
use crate::zone::{EnrollResponse, IeeeAddress};

/// Hub capability API for one device
#[async_trait]
pub trait CapabilityHost: Send + Sync {
    /// Capabilities currently registered for the device
    async fn capabilities(&self) -> Result<CapabilitySet>;

    /// Register a capability
    async fn add_capability(&self, capability: Capability) -> Result<()>;

    /// Unregister a capability
    async fn remove_capability(&self, capability: Capability) -> Result<()>;

    /// Publish a capability value
    async fn set_capability_value(&self, capability: Capability, value: Value) -> Result<()>;
}

/// Wireless commands addressed to one device
#[async_trait]
pub trait ZigbeeLink: Send + Sync {
    /// Send a zone enroll response on the IAS zone cluster
    async fn send_enroll_response(&self, endpoint: u8, response: EnrollResponse) -> Result<()>;

    /// Write the CIE address attribute of the IAS zone cluster
    async fn write_cie_address(&self, endpoint: u8, address: IeeeAddress) -> Result<()>;

    /// Send a command on the Tuya cluster
    async fn send_vendor_command(&self, endpoint: u8, command: u8, payload: Bytes) -> Result<()>;
}

pub mod memory {
    //! In-memory host and link that record every call.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::device::DeviceError;

    /// A call made against [`MemoryHost`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum HostCall {
        /// `add_capability`
        Add(Capability),
        /// `remove_capability`
        Remove(Capability),
        /// `set_capability_value`
        Set(Capability, Value),
    }

    /// Capability host backed by a set in memory
    ///
    /// Behaves like the hub: adding a registered capability, removing an
    /// absent one, or writing an unregistered one is rejected.
    #[derive(Debug, Default)]
    pub struct MemoryHost {
        registered: Mutex<CapabilitySet>,
        calls: Mutex<Vec<HostCall>>,
        refuse_add: AtomicBool,
        refuse_remove: AtomicBool,
    }

    impl MemoryHost {
        /// Create a host with no capabilities
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a host with capabilities already registered
        pub fn with_capabilities<I: IntoIterator<Item = Capability>>(caps: I) -> Self {
            Self {
                registered: Mutex::new(caps.into_iter().collect()),
                ..Self::default()
            }
        }

        /// Reject every `add_capability` call while set
        pub fn refuse_adds(&self, refuse: bool) {
            self.refuse_add.store(refuse, Ordering::SeqCst);
        }

        /// Reject every `remove_capability` call while set
        pub fn refuse_removes(&self, refuse: bool) {
            self.refuse_remove.store(refuse, Ordering::SeqCst);
        }

        /// Registered capabilities
        pub fn registered(&self) -> CapabilitySet {
            lock(&self.registered).clone()
        }

        /// Every call so far, including rejected ones
        pub fn calls(&self) -> Vec<HostCall> {
            lock(&self.calls).clone()
        }

        /// Values written so far, in order
        pub fn writes(&self) -> Vec<(Capability, Value)> {
            lock(&self.calls)
                .iter()
                .filter_map(|call| match call {
                    HostCall::Set(cap, value) => Some((*cap, value.clone())),
                    _ => None,
                })
                .collect()
        }

        /// Last value written to a capability
        pub fn last_value(&self, capability: Capability) -> Option<Value> {
            self.writes()
                .into_iter()
                .rev()
                .find(|(cap, _)| *cap == capability)
                .map(|(_, value)| value)
        }

        /// Forget recorded calls
        pub fn clear_calls(&self) {
            lock(&self.calls).clear();
        }

        fn record(&self, call: HostCall) {
            lock(&self.calls).push(call);
        }
    }

    #[async_trait]
    impl CapabilityHost for MemoryHost {
        async fn capabilities(&self) -> Result<CapabilitySet> {
            Ok(self.registered())
        }

        async fn add_capability(&self, capability: Capability) -> Result<()> {
            self.record(HostCall::Add(capability));
            if self.refuse_add.load(Ordering::SeqCst) {
                return Err(DeviceError::HostRejected(format!("{} refused", capability)));
            }
            if lock(&self.registered).insert(capability) {
                Ok(())
            } else {
                Err(DeviceError::HostRejected(format!("{} already registered", capability)))
            }
        }

        async fn remove_capability(&self, capability: Capability) -> Result<()> {
            self.record(HostCall::Remove(capability));
            if self.refuse_remove.load(Ordering::SeqCst) {
                return Err(DeviceError::HostRejected(format!("{} refused", capability)));
            }
            if lock(&self.registered).remove(capability) {
                Ok(())
            } else {
                Err(DeviceError::HostRejected(format!("{} not registered", capability)))
            }
        }

        async fn set_capability_value(&self, capability: Capability, value: Value) -> Result<()> {
            self.record(HostCall::Set(capability, value.clone()));
            if !lock(&self.registered).contains(capability) {
                return Err(DeviceError::HostRejected(format!("{} not registered", capability)));
            }
            capability.validate(&value)
        }
    }

    /// A call made against [`MemoryLink`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum LinkCall {
        /// `send_enroll_response`
        EnrollResponse(u8, EnrollResponse),
        /// `write_cie_address`
        CieAddress(u8, IeeeAddress),
        /// `send_vendor_command`
        Vendor(u8, u8, Bytes),
    }

    /// Zigbee link that records commands instead of sending them
    #[derive(Debug, Default)]
    pub struct MemoryLink {
        calls: Mutex<Vec<LinkCall>>,
        fail_enroll: AtomicBool,
        enroll_delay: Mutex<Option<Duration>>,
    }

    impl MemoryLink {
        /// Create a link that accepts everything
        pub fn new() -> Self {
            Self::default()
        }

        /// Make enroll responses fail
        pub fn fail_enroll_responses(&self, fail: bool) {
            self.fail_enroll.store(fail, Ordering::SeqCst);
        }

        /// Delay enroll-response acknowledgements
        pub fn delay_enroll_responses(&self, delay: Option<Duration>) {
            *lock(&self.enroll_delay) = delay;
        }

        /// Every command so far
        pub fn calls(&self) -> Vec<LinkCall> {
            lock(&self.calls).clone()
        }

        /// Enroll responses sent so far
        pub fn enroll_responses(&self) -> Vec<EnrollResponse> {
            lock(&self.calls)
                .iter()
                .filter_map(|call| match call {
                    LinkCall::EnrollResponse(_, response) => Some(*response),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: LinkCall) {
            lock(&self.calls).push(call);
        }
    }

    #[async_trait]
    impl ZigbeeLink for MemoryLink {
        async fn send_enroll_response(&self, endpoint: u8, response: EnrollResponse) -> Result<()> {
            self.record(LinkCall::EnrollResponse(endpoint, response));
            let delay = *lock(&self.enroll_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_enroll.load(Ordering::SeqCst) {
                return Err(DeviceError::Communication("enroll response not delivered".to_string()));
            }
            Ok(())
        }

        async fn write_cie_address(&self, endpoint: u8, address: IeeeAddress) -> Result<()> {
            self.record(LinkCall::CieAddress(endpoint, address));
            Ok(())
        }

        async fn send_vendor_command(&self, endpoint: u8, command: u8, payload: Bytes) -> Result<()> {
            self.record(LinkCall::Vendor(endpoint, command, payload));
            Ok(())
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;

    #[tokio::test]
    async fn test_memory_host_rejects_like_the_hub() {
        let host = MemoryHost::with_capabilities([Capability::OnOff]);

        assert!(host.add_capability(Capability::OnOff).await.is_err());
        assert!(host.remove_capability(Capability::MeasureBattery).await.is_err());
        assert!(host
            .set_capability_value(Capability::Dim, Value::Float(0.5))
            .await
            .is_err());

        host.add_capability(Capability::Dim).await.unwrap();
        host.set_capability_value(Capability::Dim, Value::Float(0.5))
            .await
            .unwrap();
        assert_eq!(host.last_value(Capability::Dim), Some(Value::Float(0.5)));
        assert_eq!(host.registered(), CapabilitySet::from([Capability::OnOff, Capability::Dim]));
    }

    #[tokio::test]
    async fn test_memory_link_failure() {
        let link = MemoryLink::new();
        let response = EnrollResponse {
            code: crate::zone::EnrollResponseCode::Success,
            zone_id: 10,
        };
        link.send_enroll_response(1, response).await.unwrap();
        link.fail_enroll_responses(true);
        assert!(link.send_enroll_response(1, response).await.is_err());
        assert_eq!(link.enroll_responses().len(), 2);
    }
}
