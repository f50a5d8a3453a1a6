//! vfioprep core library
//!
//! Prepares a Linux host for GPU passthrough and undoes it again:
//!
//! - [`devices`] finds the GPU to hand to a guest and every function that has
//!   to move with it, using PCI enumeration and IOMMU isolation groups.
//! - [`host`] applies the kernel parameters, passthrough driver options and
//!   initramfs changes, backing up through [`backup`] first.
//! - [`journal`] records every applied mutation and persists the record.
//! - [`reversal`] turns a journal into an ordered, idempotent procedure that
//!   can run in-process or be written out as a shell script.
//!
//! # Operational constraints
//!
//! One operator, one session at a time. The persisted journal and the files
//! it describes are not locked; concurrent runs against the same host are
//! unsupported. External tools (`lspci`, `kernelstub`, `update-grub`,
//! initramfs generators) are blocking calls without a timeout.

pub mod backup;
pub mod config;
pub mod devices;
pub mod error;
pub mod host;
pub mod journal;
pub mod observability;
pub mod paths;
pub mod reversal;

// Re-export commonly used items
pub use backup::BackupStore;
pub use config::{Config, EnumerationSourceKind};
pub use error::{PrepError, Result};
pub use journal::{Action, Category, Journal};
pub use observability::{init as init_observability, Verbosity};
pub use reversal::{synthesize, ReversalContext, ReversalProcedure, ReversalReport, ReversalStep};
