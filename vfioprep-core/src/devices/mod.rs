//! PCI device discovery and passthrough target resolution.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Device resolution                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PciSource (lspci | sysfs)   ──► DeviceSet                  │
//! │  IsolationSource (sysfs)     ──► Option<IsolationMap>       │
//! │                                                             │
//! │  HostSnapshot                                               │
//! │  ├── classify_displays()    - display controllers only      │
//! │  ├── select_primary()       - preferred vendor, Chooser     │
//! │  ├── verify_host_retains_display()                          │
//! │  ├── resolve_group()        - siblings in the same group    │
//! │  └── device_ids()           - vendor:device list            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Safety
//!
//! - **Isolation integrity**: every function in a target set shares the
//!   primary's IOMMU group. Poorly isolated hardware is surfaced as warnings on
//!   the [`TargetSelection`], never silently included or dropped.
//!
//! - **Host display**: [`verify_host_retains_display`] tells the caller whether
//!   the host would be left without a working display. It is a signal, not a
//!   hard failure.

mod device;
mod enumerate;
mod iommu;
mod resolve;

pub use device::{
    class, normalize_id, vendor, BusAddress, ClassCode, Device, DeviceId, PASSTHROUGH_DRIVER,
    PCI_DEVICES_PATH,
};
pub use enumerate::{
    enumerate, parse_lspci_drivers, parse_lspci_mm, DeviceSet, LspciSource, PciSource,
    SysfsPciSource,
};
pub use iommu::{IsolationGroup, IsolationMap, IsolationSource, SysfsIsolationSource, IOMMU_GROUPS_PATH};
pub use resolve::{
    classify_displays, device_ids, host_display, resolve_group, select_primary,
    verify_host_retains_display, Chooser, GroupMode, HostSnapshot, TargetSelection,
};
