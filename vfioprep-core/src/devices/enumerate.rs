//! PCI device enumeration.
//!
//! Two sources are supported: `lspci` machine-readable output, which carries
//! human-readable names, and raw sysfs attributes under `/sys/bus/pci/devices`.
//! Either way enumeration is all-or-nothing: a device that cannot be read fails
//! the whole snapshot rather than silently disappearing from it.

use crate::devices::device::{normalize_id, BusAddress, ClassCode, Device, PCI_DEVICES_PATH};
use crate::devices::iommu::IsolationMap;
use crate::error::{PrepError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Trailing `[xxxx]` code in an `lspci -nn` field.
static BRACKET_CODE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?)\s*\[([0-9a-fA-F]{4})\]$").expect("Invalid bracket code regex")
});

/// Provider of a raw device listing.
pub trait PciSource {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// List every PCI function currently visible to the host.
    fn list(&self) -> Result<Vec<Device>>;
}

/// Immutable, address-ordered snapshot of the host's PCI functions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Build a set, ordering by bus address. Later duplicates of an address are dropped.
    pub fn new(mut devices: Vec<Device>) -> Self {
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices.dedup_by(|later, earlier| later.address == earlier.address);
        Self { devices }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device by bus address.
    pub fn get(&self, address: &BusAddress) -> Option<&Device> {
        self.devices
            .binary_search_by(|d| d.address.cmp(address))
            .ok()
            .map(|idx| &self.devices[idx])
    }

    /// A fresh snapshot whose devices carry their isolation group id.
    pub fn with_isolation(&self, map: &IsolationMap) -> DeviceSet {
        let devices = self
            .devices
            .iter()
            .map(|d| Device { isolation_group: map.group_of(&d.address), ..d.clone() })
            .collect();
        DeviceSet { devices }
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

/// Take a complete device snapshot from `source`.
///
/// Fails with [`PrepError::EnumerationFailed`] if the source is unavailable or
/// reports nothing at all.
pub fn enumerate(source: &dyn PciSource) -> Result<DeviceSet> {
    let devices = source.list()?;
    if devices.is_empty() {
        return Err(PrepError::EnumerationFailed {
            reason: format!("{} reported no PCI devices", source.name()),
            hint: "Check that /sys is mounted and the command runs as root.".to_string(),
        });
    }

    let set = DeviceSet::new(devices);
    info!(source = source.name(), devices = set.len(), "Enumerated PCI devices");
    Ok(set)
}

// --- lspci ---

/// Device listing from `lspci -D -nn -mm` plus drivers from `lspci -D -k`.
#[derive(Debug, Clone)]
pub struct LspciSource {
    binary: Option<PathBuf>,
}

impl Default for LspciSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LspciSource {
    /// Locate `lspci` on `PATH` at enumeration time.
    pub fn new() -> Self {
        Self { binary: None }
    }

    /// Use an explicit `lspci` binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: Some(binary.into()) }
    }

    fn binary(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        which::which("lspci").map_err(|_| PrepError::EnumerationFailed {
            reason: "lspci not found".to_string(),
            hint: "Install pciutils (apt install pciutils / dnf install pciutils).".to_string(),
        })
    }

    fn run(binary: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(binary).args(args).output().map_err(|e| {
            PrepError::EnumerationFailed {
                reason: format!("Failed to run {}: {}", binary.display(), e),
                hint: "Install pciutils and re-run.".to_string(),
            }
        })?;

        if !output.status.success() {
            return Err(PrepError::EnumerationFailed {
                reason: format!(
                    "{} {} exited with {}: {}",
                    binary.display(),
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                hint: "Re-run as root; lspci needs access to PCI configuration space.".to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PciSource for LspciSource {
    fn name(&self) -> &str {
        "lspci"
    }

    fn list(&self) -> Result<Vec<Device>> {
        let binary = self.binary()?;
        let listing = Self::run(&binary, &["-D", "-nn", "-mm"])?;

        // Driver info is an enrichment; without it devices just appear unbound.
        let drivers = match Self::run(&binary, &["-D", "-k"]) {
            Ok(out) => parse_lspci_drivers(&out),
            Err(e) => {
                warn!(error = %e, "Could not read kernel driver bindings");
                HashMap::new()
            }
        };

        let mut devices = parse_lspci_mm(&listing)?;
        for device in &mut devices {
            device.driver = drivers.get(&device.address).cloned();
        }
        Ok(devices)
    }
}

/// Parse `lspci -D -nn -mm` output.
///
/// ```text
/// 0000:0b:00.0 "VGA compatible controller [0300]" "Advanced Micro Devices, Inc. [AMD/ATI] [1002]" "Navi 21 [Radeon RX 6800/6800 XT / 6900 XT] [73bf]" -rc1 ...
/// ```
pub fn parse_lspci_mm(output: &str) -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let malformed = |what: &str| PrepError::EnumerationFailed {
            reason: format!("Unexpected lspci line ({}): {}", what, line),
            hint: "Report this line together with your pciutils version.".to_string(),
        };

        let (address, rest) = line.split_once(char::is_whitespace).ok_or_else(|| malformed("no fields"))?;
        let address: BusAddress = address.parse()?;
        let fields = quoted_fields(rest);
        if fields.len() < 3 {
            return Err(malformed("expected class, vendor and device"));
        }

        let (_, class_code) = split_code(&fields[0]).ok_or_else(|| malformed("class code"))?;
        let class = ClassCode::parse(&class_code).ok_or_else(|| malformed("class code"))?;
        let (_, vendor_id) = split_code(&fields[1]).ok_or_else(|| malformed("vendor id"))?;
        let (description, device_id) =
            split_code(&fields[2]).ok_or_else(|| malformed("device id"))?;

        debug!(address = %address, class = %class, vendor = %vendor_id, device = %device_id, "Parsed lspci device");

        devices.push(Device {
            address,
            class,
            vendor_id: normalize_id(&vendor_id),
            device_id: normalize_id(&device_id),
            description,
            driver: None,
            isolation_group: None,
        });
    }

    Ok(devices)
}

/// Parse `Kernel driver in use:` lines from `lspci -D -k` output.
pub fn parse_lspci_drivers(output: &str) -> HashMap<BusAddress, String> {
    let mut drivers = HashMap::new();
    let mut current: Option<BusAddress> = None;

    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            current = line.split_whitespace().next().and_then(|a| a.parse().ok());
            continue;
        }
        if let (Some(addr), Some((_, driver))) = (current, line.split_once("Kernel driver in use:"))
        {
            let driver = driver.trim();
            if !driver.is_empty() {
                drivers.insert(addr, driver.to_string());
            }
        }
    }

    drivers
}

/// Collect the double-quoted fields of an `-mm` line, skipping bare `-r`/`-p` options.
fn quoted_fields(rest: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            fields.push(chars.by_ref().take_while(|&c| c != '"').collect());
        }
    }
    fields
}

/// Split `"Navi 21 [73bf]"` into `("Navi 21", "73bf")`.
fn split_code(field: &str) -> Option<(String, String)> {
    let caps = BRACKET_CODE_REGEX.captures(field.trim())?;
    Some((caps[1].trim().to_string(), caps[2].to_string()))
}

// --- sysfs ---

/// Device listing read directly from sysfs attributes.
#[derive(Debug, Clone)]
pub struct SysfsPciSource {
    root: PathBuf,
}

impl Default for SysfsPciSource {
    fn default() -> Self {
        Self::new(PCI_DEVICES_PATH)
    }
}

impl SysfsPciSource {
    /// Read devices below `root` (normally `/sys/bus/pci/devices`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_device(&self, dir: &Path, address: BusAddress) -> Result<Device> {
        let class_raw = read_attr(&dir.join("class"))?;
        let class = ClassCode::parse(&class_raw).ok_or_else(|| PrepError::EnumerationFailed {
            reason: format!("Unreadable class code '{}' for {}", class_raw, address),
            hint: "The sysfs tree looks damaged; try the lspci source.".to_string(),
        })?;
        let vendor_id = normalize_id(&read_attr(&dir.join("vendor"))?);
        let device_id = normalize_id(&read_attr(&dir.join("device"))?);

        let driver = fs::read_link(dir.join("driver"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()));

        let description = format!("{} device {}", class_label(&class), device_id);

        Ok(Device {
            address,
            class,
            vendor_id,
            device_id,
            description,
            driver,
            isolation_group: None,
        })
    }
}

impl PciSource for SysfsPciSource {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn list(&self) -> Result<Vec<Device>> {
        let entries = fs::read_dir(&self.root).map_err(|e| PrepError::EnumerationFailed {
            reason: format!("Cannot read {}: {}", self.root.display(), e),
            hint: "PCI sysfs is unavailable; is /sys mounted?".to_string(),
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::EnumerationFailed {
                reason: format!("Cannot list {}: {}", self.root.display(), e),
                hint: "PCI sysfs is unavailable; is /sys mounted?".to_string(),
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(address) = name.parse::<BusAddress>() else {
                debug!(entry = %name, "Skipping non-device sysfs entry");
                continue;
            };
            devices.push(self.read_device(&entry.path(), address)?);
        }

        Ok(devices)
    }
}

/// Read a value from a sysfs file.
fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path).map(|s| s.trim().to_string()).map_err(|e| {
        PrepError::EnumerationFailed {
            reason: format!("Cannot read {}: {}", path.display(), e),
            hint: "Re-run as root.".to_string(),
        }
    })
}

fn class_label(class: &ClassCode) -> &'static str {
    match class.base_and_sub() {
        0x0300 => "VGA compatible controller",
        0x0302 => "3D controller",
        0x0380 => "Display controller",
        0x0403 => "Audio device",
        0x0604 => "PCI bridge",
        0x0c03 => "USB controller",
        _ if class.is_display() => "Display controller",
        _ => "PCI device",
    }
}
