//! PCI device snapshot types.

use crate::error::{PrepError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sysfs path for PCI devices.
pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Default driver that claims devices handed to a guest.
pub const PASSTHROUGH_DRIVER: &str = "vfio-pci";

/// PCI bus address with an optional domain: `0b:00.0` or `0000:0b:00.0`.
static BUS_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("Invalid bus address regex")
});

/// PCI class codes we care about (base class << 16 | subclass << 8 | prog-if).
pub mod class {
    /// Base class of every display controller.
    pub const DISPLAY_BASE: u8 = 0x03;
    /// VGA compatible controller (0x030000)
    pub const VGA_CONTROLLER: u32 = 0x030000;
    /// 3D controller (0x030200) - compute GPUs
    pub const CONTROLLER_3D: u32 = 0x030200;
    /// Audio device (0x0403xx), usually function 1 of a GPU.
    pub const AUDIO_DEVICE: u16 = 0x0403;
    /// PCI-to-PCI bridge (0x0604xx)
    pub const PCI_BRIDGE: u16 = 0x0604;
}

/// Known GPU vendor IDs.
pub mod vendor {
    pub const NVIDIA: &str = "10de";
    pub const AMD: &str = "1002";
    pub const INTEL: &str = "8086";
}

/// Bus address of one PCI function, the unique key of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl BusAddress {
    /// Whether `other` sits on the same physical card (same domain, bus and slot).
    pub fn same_slot(&self, other: &BusAddress) -> bool {
        self.domain == other.domain && self.bus == other.bus && self.slot == other.slot
    }

    /// `dddd:bb:ss`, the part shared by all functions of one card.
    pub fn slot_prefix(&self) -> String {
        format!("{:04x}:{:02x}:{:02x}", self.domain, self.bus, self.slot)
    }

    /// `bb:ss.f`, the form `lspci` prints without `-D`.
    pub fn short(&self) -> String {
        format!("{:02x}:{:02x}.{}", self.bus, self.slot, self.function)
    }
}

impl FromStr for BusAddress {
    type Err = PrepError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PrepError::InvalidAddress { address: s.to_string() };
        let caps = BUS_ADDRESS_REGEX.captures(s.trim()).ok_or_else(invalid)?;

        let hex_u8 = |idx: usize| u8::from_str_radix(&caps[idx], 16).map_err(|_| invalid());
        let domain = match caps.get(1) {
            Some(m) => u16::from_str_radix(m.as_str(), 16).map_err(|_| invalid())?,
            None => 0,
        };

        Ok(Self { domain, bus: hex_u8(2)?, slot: hex_u8(3)?, function: hex_u8(4)? })
    }
}

impl TryFrom<String> for BusAddress {
    type Error = PrepError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(value: BusAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot_prefix(), self.function)
    }
}

/// 24-bit PCI class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassCode(pub u32);

impl ClassCode {
    /// Parse `0x030000` (sysfs), `030000` or the 4-digit `0300` form lspci prints.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.trim().trim_start_matches("0x");
        let value = u32::from_str_radix(hex, 16).ok()?;
        match hex.len() {
            4 => Some(Self(value << 8)),
            6 => Some(Self(value)),
            _ => None,
        }
    }

    pub fn base(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Base class and subclass, e.g. `0x0300`.
    pub fn base_and_sub(&self) -> u16 {
        (self.0 >> 8) as u16
    }

    /// Display controller family (VGA, XGA, 3D, other display).
    pub fn is_display(&self) -> bool {
        self.base() == class::DISPLAY_BASE
    }

    pub fn is_audio(&self) -> bool {
        self.base_and_sub() == class::AUDIO_DEVICE
    }

    pub fn is_bridge(&self) -> bool {
        self.base_and_sub() == class::PCI_BRIDGE
    }
}

impl fmt::Display for ClassCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}", self.0)
    }
}

/// `vendor:device` identifier pair handed to the passthrough driver.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub vendor: String,
    pub device: String,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.device)
    }
}

/// One PCI function as reported by enumeration.
///
/// Devices are point-in-time snapshots; a new enumeration produces new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: BusAddress,
    pub class: ClassCode,
    /// Vendor ID, lowercase hex without `0x` (e.g., "1002")
    pub vendor_id: String,
    /// Device ID, lowercase hex without `0x` (e.g., "73bf")
    pub device_id: String,
    /// Human-readable description
    pub description: String,
    /// Currently bound driver (None if unbound)
    pub driver: Option<String>,
    /// Isolation (IOMMU) group, present once isolation data has been attached
    pub isolation_group: Option<u32>,
}

impl Device {
    /// The `vendor:device` pair of this function.
    pub fn id(&self) -> DeviceId {
        DeviceId { vendor: self.vendor_id.clone(), device: self.device_id.clone() }
    }

    pub fn is_display(&self) -> bool {
        self.class.is_display()
    }

    /// Whether the device is bound to `driver`.
    pub fn is_bound_to(&self, driver: &str) -> bool {
        self.driver.as_deref() == Some(driver)
    }

    /// Whether some non-empty driver currently owns the device.
    pub fn has_driver(&self) -> bool {
        self.driver.as_deref().is_some_and(|d| !d.trim().is_empty())
    }

    /// Short vendor name for well-known GPU vendors.
    pub fn vendor_name(&self) -> &'static str {
        match self.vendor_id.as_str() {
            vendor::NVIDIA => "NVIDIA",
            vendor::AMD => "AMD",
            vendor::INTEL => "Intel",
            _ => "Unknown",
        }
    }

    /// Get a human-readable device name.
    pub fn display_name(&self) -> String {
        format!("{} [{}]", self.description, self.id())
    }
}

/// Normalize a vendor/device id read from sysfs or lspci (`0x1002` -> `1002`).
pub fn normalize_id(raw: &str) -> String {
    raw.trim().trim_start_matches("0x").to_lowercase()
}
