/*!
 * Capability reconciliation.
 *
 * Brings the hub's capability set for a device in line with its power
 * verdict and the clusters it advertised. Only capabilities this module
 * manages (the profile's candidates and the battery pair) are ever removed;
 * anything else registered on the device is left alone.
 */
use std::time::Duration;

use tracing::{debug, info, warn};

use zigdrive_core::utils::with_timeout;

use crate::capability::{Capability, CapabilitySet};
use crate::device::{ClusterInventory, Result};
use crate::host::CapabilityHost;
use crate::power::PowerVerdict;
use crate::profile::CapabilityCandidate;

/// Outcome of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Capabilities the host accepted as added
    pub added: Vec<Capability>,
    /// Capabilities the host accepted as removed
    pub removed: Vec<Capability>,
    /// Capabilities registered with the host afterwards
    pub capabilities: CapabilitySet,
}

impl Reconciliation {
    /// Whether the diff was empty
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes and applies capability diffs against the hub
#[derive(Debug, Clone)]
pub struct CapabilityReconciler {
    call_timeout: Duration,
}

impl CapabilityReconciler {
    /// Create a reconciler bounding each host call by `call_timeout`
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Capabilities the device should expose
    pub fn desired(
        verdict: PowerVerdict,
        inventory: &ClusterInventory,
        candidates: &[CapabilityCandidate],
    ) -> CapabilitySet {
        let mut desired: CapabilitySet = candidates
            .iter()
            .filter(|c| inventory.has(c.endpoint, c.cluster))
            .map(|c| c.capability)
            .filter(|cap| verdict.is_battery() || !cap.is_battery())
            .collect();

        if verdict.is_battery() {
            if inventory.has_metering() {
                debug!("Battery verdict with metering clusters; battery capabilities withheld");
            } else {
                for cap in Capability::BATTERY {
                    desired.insert(cap);
                }
            }
        }

        desired
    }

    /// Capabilities this reconciler may remove
    pub fn managed(candidates: &[CapabilityCandidate]) -> CapabilitySet {
        candidates
            .iter()
            .map(|c| c.capability)
            .chain(Capability::BATTERY)
            .collect()
    }

    /// Bring the host in line with `verdict` and `inventory`
    ///
    /// Rejections from the host are logged and otherwise ignored, so calling
    /// this again with the same inputs issues no calls at all. When any call
    /// fails the host is asked again for its capability set, so the result
    /// only lists what is actually registered.
    pub async fn reconcile<H>(
        &self,
        verdict: PowerVerdict,
        inventory: &ClusterInventory,
        candidates: &[CapabilityCandidate],
        host: &H,
    ) -> Result<Reconciliation>
    where
        H: CapabilityHost + ?Sized,
    {
        let live = with_timeout(self.call_timeout, host.capabilities()).await?;
        let desired = Self::desired(verdict, inventory, candidates);
        let managed = Self::managed(candidates);

        let to_add: Vec<Capability> = desired.difference(&live).collect();
        let to_remove: Vec<Capability> = live
            .difference(&desired)
            .filter(|cap| managed.contains(*cap))
            .collect();

        let mut removed = Vec::with_capacity(to_remove.len());
        let mut added = Vec::with_capacity(to_add.len());
        let mut failed = false;

        for cap in to_remove {
            match with_timeout(self.call_timeout, host.remove_capability(cap)).await {
                Ok(()) => removed.push(cap),
                Err(e) => {
                    warn!("Removing capability {} failed, ignoring: {}", cap, e);
                    failed = true;
                }
            }
        }
        for cap in to_add {
            match with_timeout(self.call_timeout, host.add_capability(cap)).await {
                Ok(()) => added.push(cap),
                Err(e) => {
                    warn!("Adding capability {} failed, ignoring: {}", cap, e);
                    failed = true;
                }
            }
        }

        let mut capabilities: CapabilitySet = live
            .iter()
            .filter(|cap| !removed.contains(cap))
            .chain(added.iter().copied())
            .collect();
        if failed {
            match with_timeout(self.call_timeout, host.capabilities()).await {
                Ok(current) => capabilities = current,
                Err(e) => warn!("Re-reading capabilities failed, keeping applied diff: {}", e),
            }
        }

        if added.is_empty() && removed.is_empty() {
            debug!("Capabilities already match {} verdict: {}", verdict, capabilities);
        } else {
            info!(
                "Reconciled capabilities for {} verdict: added {:?}, removed {:?}, now {}",
                verdict, added, removed, capabilities
            );
        }

        Ok(Reconciliation {
            added,
            removed,
            capabilities,
        })
    }
}
