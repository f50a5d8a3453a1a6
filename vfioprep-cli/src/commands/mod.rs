//! CLI command implementations

pub mod cleanup;
pub mod config;
pub mod gpu;
pub mod groups;
pub mod script;
pub mod setup;

pub use cleanup::cleanup;
pub use config::show_config;
pub use gpu::gpus;
pub use groups::groups;
pub use script::script;
pub use setup::setup;

use vfioprep_core::devices::{HostSnapshot, LspciSource, PciSource, SysfsIsolationSource, SysfsPciSource};
use vfioprep_core::{Config, EnumerationSourceKind, Result};

/// Enumerate devices and isolation groups with the configured source.
pub(crate) fn capture(config: &Config) -> Result<HostSnapshot> {
    let pci: Box<dyn PciSource> = match config.enumeration_source {
        EnumerationSourceKind::Lspci => Box::new(LspciSource::new()),
        EnumerationSourceKind::Sysfs => Box::<SysfsPciSource>::default(),
    };
    HostSnapshot::capture(pci.as_ref(), &SysfsIsolationSource::default())
}

/// `-` for missing values in tables.
pub(crate) fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
