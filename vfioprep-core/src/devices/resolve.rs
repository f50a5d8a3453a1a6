//! Device/group resolution.
//!
//! Pure analysis over a [`HostSnapshot`]: pick the display device to hand to
//! the guest, expand it to every function that has to move with it, and check
//! that the host keeps a working display. Nothing here mutates the system.
//!
//! # Sibling rule
//!
//! A sibling is a function on the same physical card (same domain, bus and
//! slot) *and* in the primary's isolation group. Other devices in the group
//! are reported as a warning and only included in [`GroupMode::WholeGroup`].
//! Same-card functions in a different group are excluded and reported.
//! PCI bridges are never part of a target set.

use crate::devices::device::{normalize_id, BusAddress, Device, DeviceId};
use crate::devices::enumerate::{enumerate, DeviceSet, PciSource};
use crate::devices::iommu::{IsolationMap, IsolationSource};
use crate::error::{PrepError, Result};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Operator capability that disambiguates between candidate devices.
pub trait Chooser {
    /// Return the index of the chosen candidate, or [`PrepError::UserAborted`].
    fn choose(&mut self, candidates: &[Device]) -> Result<usize>;
}

impl<F> Chooser for F
where
    F: FnMut(&[Device]) -> Result<usize>,
{
    fn choose(&mut self, candidates: &[Device]) -> Result<usize> {
        self(candidates)
    }
}

/// How far a selection expands inside the primary's isolation group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupMode {
    /// Primary plus the same-card functions in its group.
    #[default]
    Slot,
    /// Every non-bridge device in the primary's group.
    WholeGroup,
}

/// Device listing plus isolation data, captured together.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    /// Devices with `isolation_group` attached where known.
    pub devices: DeviceSet,
    /// `None` when the isolation subsystem is not active.
    pub isolation: Option<IsolationMap>,
}

impl HostSnapshot {
    /// Enumerate devices and read isolation groups.
    pub fn capture(pci: &dyn PciSource, isolation: &dyn IsolationSource) -> Result<Self> {
        let devices = enumerate(pci)?;
        let isolation = isolation.groups()?;
        let devices = match &isolation {
            Some(map) => devices.with_isolation(map),
            None => devices,
        };
        Ok(Self { devices, isolation })
    }

    /// Display controllers in address order.
    pub fn displays(&self) -> Vec<Device> {
        classify_displays(&self.devices)
    }

    /// [`resolve_group`] against this snapshot.
    pub fn resolve(&self, primary: &Device, mode: GroupMode) -> Result<TargetSelection> {
        resolve_group(&self.devices, self.isolation.as_ref(), primary, mode)
    }
}

/// The set of functions that must be handed to the guest together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSelection {
    pub primary: Device,
    /// Other functions included, in address order.
    pub siblings: Vec<Device>,
    pub group_id: u32,
    pub mode: GroupMode,
    /// Group members outside the primary's slot (not bridges).
    pub extra_group_devices: Vec<Device>,
    /// Same-slot functions that sit in a different (or no) group.
    pub foreign_slot_devices: Vec<Device>,
    /// Group members that enumeration did not report.
    pub unlisted_members: Vec<BusAddress>,
}

impl TargetSelection {
    /// Primary first, then siblings.
    pub fn members(&self) -> impl Iterator<Item = &Device> {
        std::iter::once(&self.primary).chain(self.siblings.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Bus addresses of every member, primary first.
    pub fn addresses(&self) -> Vec<BusAddress> {
        self.members().map(|d| d.address).collect()
    }

    /// Operator-facing isolation warnings; empty for a cleanly isolated card.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.extra_group_devices.is_empty() {
            let list = describe(&self.extra_group_devices);
            warnings.push(match self.mode {
                GroupMode::Slot => format!(
                    "IOMMU group {} also contains devices outside slot {}: {}. \
                     They cannot stay with the host while the GPU is in the guest; \
                     use --whole-group to pass them through as well, or move the card \
                     to a better isolated slot.",
                    self.group_id,
                    self.primary.address.slot_prefix(),
                    list
                ),
                GroupMode::WholeGroup => format!(
                    "Whole IOMMU group {} will be passed through, including: {}",
                    self.group_id, list
                ),
            });
        }

        if !self.foreign_slot_devices.is_empty() {
            warnings.push(format!(
                "Functions on the same card sit outside IOMMU group {} and were excluded: {}",
                self.group_id,
                describe(&self.foreign_slot_devices)
            ));
        }

        if !self.unlisted_members.is_empty() {
            let list: Vec<String> = self.unlisted_members.iter().map(|a| a.to_string()).collect();
            warnings.push(format!(
                "IOMMU group {} lists devices enumeration did not report: {}",
                self.group_id,
                list.join(", ")
            ));
        }

        warnings
    }
}

fn describe(devices: &[Device]) -> String {
    devices.iter().map(|d| format!("{} ({})", d.address, d.display_name())).collect::<Vec<_>>().join(", ")
}

/// Filter to the display-controller class family, keeping input order.
pub fn classify_displays(devices: &DeviceSet) -> Vec<Device> {
    devices.iter().filter(|d| d.is_display()).cloned().collect()
}

/// Pick the display device to pass through.
///
/// Exactly one device from `preferred_vendor` is selected directly. Several
/// are handed to `chooser` in input order. None is [`PrepError::NoCandidate`].
pub fn select_primary(
    displays: &[Device],
    preferred_vendor: &str,
    chooser: &mut dyn Chooser,
) -> Result<Device> {
    let wanted = normalize_id(preferred_vendor);
    let candidates: Vec<Device> =
        displays.iter().filter(|d| d.vendor_id == wanted).cloned().collect();

    match candidates.as_slice() {
        [] => {
            let found: Vec<String> = displays.iter().map(|d| d.display_name()).collect();
            Err(PrepError::NoCandidate {
                vendor: wanted,
                hint: if found.is_empty() {
                    "No display controllers were found at all.".to_string()
                } else {
                    format!(
                        "Found: {}. Pass --vendor with one of these vendor ids.",
                        found.join(", ")
                    )
                },
            })
        }
        [only] => {
            info!(address = %only.address, device = %only.display_name(), "Selected the only matching GPU");
            Ok(only.clone())
        }
        _ => {
            let count = candidates.len();
            debug!(count, vendor = %wanted, "Multiple matching GPUs, asking operator");
            let index = chooser.choose(&candidates)?;
            let selected = candidates
                .get(index)
                .cloned()
                .ok_or(PrepError::InvalidChoice { index, count })?;
            info!(address = %selected.address, device = %selected.display_name(), "Operator selected GPU");
            Ok(selected)
        }
    }
}

/// Display device the host would keep using, if any.
///
/// Prefers NVIDIA, then Intel, then anything else, among devices with a live
/// driver that is not the passthrough driver.
pub fn host_display<'a>(
    displays: &'a [Device],
    primary: &Device,
    passthrough_driver: &str,
) -> Option<&'a Device> {
    let usable: Vec<&Device> = displays
        .iter()
        .filter(|d| d.address != primary.address)
        .filter(|d| d.has_driver() && !d.is_bound_to(passthrough_driver))
        .collect();

    let rank = |d: &Device| match d.vendor_name() {
        "NVIDIA" => 0,
        "Intel" => 1,
        _ => 2,
    };
    usable.into_iter().min_by_key(|d| rank(d))
}

/// Whether another display device keeps a working host driver.
///
/// A `false` result is a safety signal for the caller, not an error.
pub fn verify_host_retains_display(
    displays: &[Device],
    primary: &Device,
    passthrough_driver: &str,
) -> bool {
    match host_display(displays, primary, passthrough_driver) {
        Some(host) => {
            info!(address = %host.address, driver = ?host.driver, "Host keeps a display device");
            true
        }
        None => {
            warn!(primary = %primary.address, "No other display device with a working host driver");
            false
        }
    }
}

/// Expand `primary` into the full [`TargetSelection`].
///
/// Fails with [`PrepError::NoIsolationData`] when isolation groups are not
/// available or do not cover the primary device.
pub fn resolve_group(
    devices: &DeviceSet,
    isolation: Option<&IsolationMap>,
    primary: &Device,
    mode: GroupMode,
) -> Result<TargetSelection> {
    let no_data = |reason: &str| PrepError::NoIsolationData {
        address: primary.address.to_string(),
        hint: format!(
            "{}. Enable VT-d/AMD-Vi in firmware, add intel_iommu=on or amd_iommu=on \
             to the kernel command line (vfioprep setup does this), reboot and re-run.",
            reason
        ),
    };

    let map = isolation.ok_or_else(|| no_data("IOMMU groups are not available"))?;
    let group_id = map
        .group_of(&primary.address)
        .ok_or_else(|| no_data("The device is not in any IOMMU group"))?;
    let group = map.group(group_id).ok_or_else(|| no_data("The IOMMU group is empty"))?;

    let mut siblings = Vec::new();
    let mut extra_group_devices = Vec::new();
    let mut foreign_slot_devices = Vec::new();
    let mut unlisted_members = Vec::new();

    for device in devices.iter().filter(|d| d.address != primary.address) {
        let same_slot = device.address.same_slot(&primary.address);
        let in_group = group.contains(&device.address);

        match (same_slot, in_group) {
            (true, true) => siblings.push(device.clone()),
            (true, false) => foreign_slot_devices.push(device.clone()),
            (false, true) if device.class.is_bridge() => {
                debug!(address = %device.address, "Ignoring PCI bridge in IOMMU group");
            }
            (false, true) => extra_group_devices.push(device.clone()),
            (false, false) => {}
        }
    }

    for member in &group.members {
        if *member != primary.address && devices.get(member).is_none() {
            unlisted_members.push(*member);
        }
    }

    if mode == GroupMode::WholeGroup {
        siblings.extend(extra_group_devices.iter().cloned());
        siblings.sort_by(|a, b| a.address.cmp(&b.address));
    }

    let selection = TargetSelection {
        primary: primary.clone(),
        siblings,
        group_id,
        mode,
        extra_group_devices,
        foreign_slot_devices,
        unlisted_members,
    };

    for warning in selection.warnings() {
        warn!(group = group_id, "{}", warning);
    }
    info!(
        primary = %primary.address,
        group = group_id,
        members = selection.len(),
        ?mode,
        "Resolved passthrough target"
    );

    Ok(selection)
}

/// Unique `vendor:device` ids of a selection, in first-seen member order.
pub fn device_ids(selection: &TargetSelection) -> Vec<DeviceId> {
    let mut seen = HashSet::new();
    selection.members().map(Device::id).filter(|id| seen.insert(id.clone())).collect()
}
