//! Host mutation collaborators.
//!
//! Everything that changes the host during setup lives here, behind two narrow
//! capabilities: [`BootParameterTool`] (kernel command line) and
//! [`InitramfsRebuilder`]. The resolution and reversal code only ever see
//! these traits, never a concrete mechanism.
//!
//! Every mutation is preceded by a backup from [`crate::backup::BackupStore`]
//! and recorded in the [`crate::journal::Journal`], even when the mutation
//! itself then fails.

pub mod bootloader;
pub mod initramfs;
pub mod modules;

pub use bootloader::{
    apply_boot_parameters, boot_tool_by_name, detect_boot_tool, BootParameterOutcome, GrubDefault,
    Kernelstub,
};
pub use initramfs::InitramfsTool;
pub use modules::{write_initramfs_module_config, write_module_config, ModuleConfigOutcome};

use crate::error::{PrepError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// Path to CPU information.
pub const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Mechanism that owns the kernel command line on this host.
///
/// Implementations either edit files in place (reversed by restoring those
/// files) or call a command-line tool (reversed by the inverse command).
pub trait BootParameterTool {
    /// Short mechanism name, stored in the journal.
    fn name(&self) -> &str;

    /// Files edited in place by [`add`](Self::add) and [`remove`](Self::remove).
    ///
    /// Empty for command-based tools.
    fn edited_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Parameters currently configured for the next boot.
    fn current(&self) -> Result<Vec<String>>;

    /// Add parameters. May replace an existing parameter with the same key.
    fn add(&self, params: &[String]) -> Result<()>;

    /// Remove parameters. Parameters that are already absent are not an error.
    fn remove(&self, params: &[String]) -> Result<()>;

    /// Regenerate derived bootloader configuration after an edit.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Shell command that adds `param`, if the mechanism has one.
    fn add_command(&self, _param: &str) -> Option<String> {
        None
    }

    /// Shell command that removes `param`, if the mechanism has one.
    fn remove_command(&self, _param: &str) -> Option<String> {
        None
    }

    /// Shell command equivalent of [`refresh`](Self::refresh).
    fn refresh_command(&self) -> Option<String> {
        None
    }
}

/// Single "rebuild the initramfs" capability.
pub trait InitramfsRebuilder {
    fn name(&self) -> &str;

    fn rebuild(&self) -> Result<()>;

    /// Shell command equivalent of [`rebuild`](Self::rebuild).
    fn script_command(&self) -> String;
}

/// CPU vendor, which decides the IOMMU enable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Amd,
    Intel,
    Other,
}

impl CpuVendor {
    /// Read the vendor from `/proc/cpuinfo` content.
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        let vendor = cpuinfo
            .lines()
            .find_map(|l| l.strip_prefix("vendor_id").and_then(|rest| rest.split(':').nth(1)))
            .map(str::trim);

        match vendor {
            Some("AuthenticAMD") => Self::Amd,
            Some("GenuineIntel") => Self::Intel,
            _ => Self::Other,
        }
    }

    /// Vendor of the running host.
    pub fn detect() -> Result<Self> {
        let content = std::fs::read_to_string(CPUINFO_PATH)
            .map_err(|e| PrepError::IoError { path: CPUINFO_PATH.into(), source: e })?;
        Ok(Self::from_cpuinfo(&content))
    }

    /// Kernel parameter that turns the IOMMU on.
    pub fn iommu_parameter(&self) -> &'static str {
        match self {
            Self::Amd => "amd_iommu=on",
            Self::Intel | Self::Other => "intel_iommu=on",
        }
    }
}

/// Kernel parameters needed for passthrough with `passthrough_driver`.
pub fn required_kernel_parameters(cpu: CpuVendor, passthrough_driver: &str) -> Vec<String> {
    vec![
        cpu.iommu_parameter().to_string(),
        "iommu=pt".to_string(),
        format!("rd.driver.pre={}", passthrough_driver),
    ]
}

/// Key part of a kernel parameter (`iommu` for `iommu=pt`).
pub fn parameter_key(param: &str) -> &str {
    param.split_once('=').map_or(param, |(key, _)| key)
}

/// Quote `s` for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Locate `program` on `PATH`.
pub(crate) fn find_tool(program: &str, hint: &str) -> Result<PathBuf> {
    which::which(program)
        .map_err(|_| PrepError::ToolNotFound { tool: program.to_string(), hint: hint.to_string() })
}

/// Run an external tool to completion and return its stdout.
///
/// Blocks without a timeout; a hanging tool hangs the session.
pub(crate) fn run_tool(program: &Path, args: &[&str]) -> Result<String> {
    let output = execute(program, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run_tool`], but returns stdout followed by stderr.
///
/// For tools that report through a logger writing to stderr.
pub(crate) fn run_tool_combined(program: &Path, args: &[&str]) -> Result<String> {
    let output = execute(program, args)?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(combined)
}

fn execute(program: &Path, args: &[&str]) -> Result<Output> {
    let tool = tool_label(program);
    debug!(tool = %tool, ?args, "Running external tool");

    let output = Command::new(program).args(args).output().map_err(|e| PrepError::ToolFailed {
        tool: tool.clone(),
        reason: format!("failed to start: {}", e),
    })?;

    if !output.status.success() {
        return Err(PrepError::ToolFailed {
            tool,
            reason: format!(
                "{} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(output)
}

fn tool_label(program: &Path) -> String {
    program.file_name().map_or_else(
        || program.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_vendor_from_cpuinfo() {
        let amd = "processor\t: 0\nvendor_id\t: AuthenticAMD\ncpu family\t: 25\n";
        let intel = "processor\t: 0\nvendor_id\t: GenuineIntel\n";
        assert_eq!(CpuVendor::from_cpuinfo(amd), CpuVendor::Amd);
        assert_eq!(CpuVendor::from_cpuinfo(intel), CpuVendor::Intel);
        assert_eq!(CpuVendor::from_cpuinfo("processor: 0\n"), CpuVendor::Other);
    }

    #[test]
    fn test_required_parameters() {
        assert_eq!(
            required_kernel_parameters(CpuVendor::Amd, "vfio-pci"),
            vec!["amd_iommu=on", "iommu=pt", "rd.driver.pre=vfio-pci"]
        );
        assert_eq!(required_kernel_parameters(CpuVendor::Other, "vfio-pci")[0], "intel_iommu=on");
    }

    #[test]
    fn test_parameter_key() {
        assert_eq!(parameter_key("iommu=pt"), "iommu");
        assert_eq!(parameter_key("rd.driver.pre=vfio-pci"), "rd.driver.pre");
        assert_eq!(parameter_key("quiet"), "quiet");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/default/grub"), "/etc/default/grub");
        assert_eq!(shell_quote("iommu=pt"), "iommu=pt");
        assert_eq!(shell_quote("/tmp/my file"), "'/tmp/my file'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_run_tool_reports_failure() {
        let err = run_tool(Path::new("/bin/sh"), &["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err {
            PrepError::ToolFailed { tool, reason } => {
                assert_eq!(tool, "sh");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_tool_combined_keeps_stderr() {
        let out = run_tool_combined(Path::new("/bin/sh"), &["-c", "echo out; echo err >&2"]).unwrap();
        assert_eq!(out, "out\nerr\n");
        assert_eq!(run_tool(Path::new("/bin/sh"), &["-c", "echo out; echo err >&2"]).unwrap(), "out\n");
    }
}
