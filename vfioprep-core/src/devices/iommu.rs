//! IOMMU (isolation) group data.
//!
//! IOMMU groups are the smallest unit of device isolation. All devices in a
//! group share one DMA isolation domain, so they move between host and guest
//! together or not at all.
//!
//! When the kernel runs without an active IOMMU the group directory is absent
//! or empty. That is the normal state of a host that has not been configured
//! yet, so it is reported as `Ok(None)` rather than as an error.

use crate::devices::device::BusAddress;
use crate::error::{PrepError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Path to IOMMU groups in sysfs.
pub const IOMMU_GROUPS_PATH: &str = "/sys/kernel/iommu_groups";

/// One isolation group and its member functions, in address order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationGroup {
    pub id: u32,
    pub members: Vec<BusAddress>,
}

impl IsolationGroup {
    pub fn contains(&self, address: &BusAddress) -> bool {
        self.members.binary_search(address).is_ok()
    }
}

/// All isolation groups of the host, indexed both ways.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolationMap {
    groups: BTreeMap<u32, IsolationGroup>,
    by_address: HashMap<BusAddress, u32>,
}

impl IsolationMap {
    /// Build a map from `(group id, members)` pairs.
    pub fn new(groups: impl IntoIterator<Item = (u32, Vec<BusAddress>)>) -> Self {
        let mut map = Self::default();
        for (id, mut members) in groups {
            members.sort();
            members.dedup();
            for addr in &members {
                map.by_address.insert(*addr, id);
            }
            map.groups.insert(id, IsolationGroup { id, members });
        }
        map
    }

    /// Group id of `address`, if it belongs to any group.
    pub fn group_of(&self, address: &BusAddress) -> Option<u32> {
        self.by_address.get(address).copied()
    }

    pub fn group(&self, id: u32) -> Option<&IsolationGroup> {
        self.groups.get(&id)
    }

    /// Groups in ascending id order.
    pub fn groups(&self) -> impl Iterator<Item = &IsolationGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Provider of isolation group membership.
pub trait IsolationSource {
    /// `Ok(None)` when the isolation subsystem is not active at all.
    fn groups(&self) -> Result<Option<IsolationMap>>;
}

/// Reads `/sys/kernel/iommu_groups/<id>/devices/*`.
#[derive(Debug, Clone)]
pub struct SysfsIsolationSource {
    root: PathBuf,
}

impl Default for SysfsIsolationSource {
    fn default() -> Self {
        Self::new(IOMMU_GROUPS_PATH)
    }
}

impl SysfsIsolationSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl IsolationSource for SysfsIsolationSource {
    fn groups(&self) -> Result<Option<IsolationMap>> {
        if !self.root.exists() {
            debug!(path = %self.root.display(), "IOMMU groups directory absent");
            return Ok(None);
        }

        let entries = fs::read_dir(&self.root)
            .map_err(|e| PrepError::IoError { path: self.root.clone(), source: e })?;

        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::IoError { path: self.root.clone(), source: e })?;
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };

            let devices_path = entry.path().join("devices");
            let mut members = Vec::new();
            if devices_path.exists() {
                for dev in fs::read_dir(&devices_path)
                    .map_err(|e| PrepError::IoError { path: devices_path.clone(), source: e })?
                {
                    let dev = dev.map_err(|e| PrepError::IoError { path: devices_path.clone(), source: e })?;
                    if let Some(addr) = dev.file_name().to_str().and_then(|n| n.parse().ok()) {
                        members.push(addr);
                    }
                }
            }

            debug!(group = id, devices = ?members, "Read IOMMU group");
            if !members.is_empty() {
                groups.push((id, members));
            }
        }

        if groups.is_empty() {
            debug!("IOMMU groups directory holds no populated groups");
            return Ok(None);
        }

        let map = IsolationMap::new(groups);
        info!(groups = map.len(), "Read IOMMU groups");
        Ok(Some(map))
    }
}
