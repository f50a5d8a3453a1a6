//! Initramfs rebuild tools.

use crate::error::Result;
use crate::host::{find_tool, run_tool, InitramfsRebuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::info;

/// Uncommented `MODULES=(...)` array in `mkinitcpio.conf`.
static MKINITCPIO_MODULES_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(\s*MODULES\s*=\s*\()([^)]*)\)").expect("Invalid mkinitcpio MODULES regex")
});

/// Supported initramfs generators, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitramfsTool {
    /// Debian, Ubuntu, Pop!_OS
    UpdateInitramfs,
    /// Fedora, RHEL, openSUSE
    Dracut,
    /// Arch
    Mkinitcpio,
    Booster,
}

impl InitramfsTool {
    pub const ALL: [InitramfsTool; 4] = [
        InitramfsTool::UpdateInitramfs,
        InitramfsTool::Dracut,
        InitramfsTool::Mkinitcpio,
        InitramfsTool::Booster,
    ];

    /// Executable name.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::UpdateInitramfs => "update-initramfs",
            Self::Dracut => "dracut",
            Self::Mkinitcpio => "mkinitcpio",
            Self::Booster => "booster",
        }
    }

    /// Arguments that regenerate the images of all installed kernels.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::UpdateInitramfs => &["-u", "-k", "all"],
            Self::Dracut => &["--force", "--regenerate-all"],
            Self::Mkinitcpio => &["-P"],
            Self::Booster => &["build"],
        }
    }

    /// First tool found on `PATH`.
    pub fn detect() -> Option<Self> {
        Self::ALL.into_iter().find(|t| which::which(t.binary()).is_ok())
    }

    /// File that lists the early-boot modules, relative to the filesystem root.
    pub fn module_config_path(&self) -> &'static str {
        match self {
            Self::UpdateInitramfs => "etc/initramfs-tools/modules",
            Self::Dracut => "etc/dracut.conf.d/vfio.conf",
            Self::Mkinitcpio => "etc/mkinitcpio.conf",
            Self::Booster => "etc/booster.d/vfio.yaml",
        }
    }

    /// Whether the module config is the tool's main configuration file,
    /// which has to exist already and is edited in place.
    pub fn edits_main_config(&self) -> bool {
        matches!(self, Self::Mkinitcpio)
    }

    /// Module config content that force-loads `modules`, given the current
    /// content of [`module_config_path`](Self::module_config_path).
    ///
    /// Drop-in files are replaced whole. Shared files keep every other line
    /// and only gain the modules they do not list yet.
    pub fn render_module_config(&self, existing: Option<&str>, modules: &[&str]) -> String {
        match self {
            Self::Dracut => format!("force_drivers+=\" {} \"\n", modules.join(" ")),
            Self::Booster => format!("modules_force_load: {}\n", modules.join(",")),
            Self::UpdateInitramfs => append_module_lines(existing.unwrap_or(""), modules),
            Self::Mkinitcpio => prepend_mkinitcpio_modules(existing.unwrap_or(""), modules),
        }
    }
}

/// `/etc/initramfs-tools/modules`: one module per line, `#` comments.
fn append_module_lines(existing: &str, modules: &[&str]) -> String {
    let listed: Vec<&str> = existing
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_whitespace().next())
        .collect();
    let missing: Vec<&str> = modules.iter().copied().filter(|m| !listed.contains(m)).collect();
    if missing.is_empty() {
        return existing.to_string();
    }

    let mut content = existing.to_string();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str("# vfio passthrough (vfioprep)\n");
    for module in missing {
        content.push_str(module);
        content.push('\n');
    }
    content
}

/// `MODULES=(...)` in `mkinitcpio.conf`; missing modules go first so they
/// load before any display driver already listed.
fn prepend_mkinitcpio_modules(existing: &str, modules: &[&str]) -> String {
    let Some(caps) = MKINITCPIO_MODULES_REGEX.captures(existing) else {
        return format!("MODULES=({})\n{}", modules.join(" "), existing);
    };
    let Some(list) = caps.get(2) else {
        return existing.to_string();
    };

    let listed: Vec<&str> = list.as_str().split_whitespace().map(|m| m.trim_matches('"')).collect();
    let missing: Vec<&str> = modules.iter().copied().filter(|m| !listed.contains(m)).collect();
    if missing.is_empty() {
        return existing.to_string();
    }

    let mut entries: Vec<&str> = missing;
    entries.extend(list.as_str().split_whitespace());
    format!(
        "{}{}{}",
        &existing[..list.start()],
        entries.join(" "),
        &existing[list.end()..]
    )
}

impl fmt::Display for InitramfsTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl InitramfsRebuilder for InitramfsTool {
    fn name(&self) -> &str {
        self.binary()
    }

    fn rebuild(&self) -> Result<()> {
        let binary = find_tool(self.binary(), "Rebuild the initramfs by hand before rebooting.")?;
        info!(tool = %self, "Rebuilding initramfs (this can take a while)");
        run_tool(&binary, self.args())?;
        info!(tool = %self, "Initramfs rebuilt");
        Ok(())
    }

    fn script_command(&self) -> String {
        format!("{} {}", self.binary(), self.args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_commands() {
        assert_eq!(InitramfsTool::UpdateInitramfs.script_command(), "update-initramfs -u -k all");
        assert_eq!(InitramfsTool::Mkinitcpio.script_command(), "mkinitcpio -P");
        assert_eq!(InitramfsTool::Booster.script_command(), "booster build");
    }

    #[test]
    fn test_drop_in_module_configs() {
        let modules = ["vfio", "vfio_pci"];
        let booster = InitramfsTool::Booster;
        assert_eq!(booster.module_config_path(), "etc/booster.d/vfio.yaml");
        assert_eq!(
            booster.render_module_config(Some("stale\n"), &modules),
            "modules_force_load: vfio,vfio_pci\n"
        );
        assert!(!booster.edits_main_config());
    }

    #[test]
    fn test_initramfs_tools_modules_appended_once() {
        let tool = InitramfsTool::UpdateInitramfs;
        let existing = "# List of modules\n#vfio\nvfio_pci ids=1002:73bf";
        let content = tool.render_module_config(Some(existing), &["vfio", "vfio_pci"]);
        assert_eq!(
            content,
            "# List of modules\n#vfio\nvfio_pci ids=1002:73bf\n# vfio passthrough (vfioprep)\nvfio\n"
        );
        assert_eq!(tool.render_module_config(Some(&content), &["vfio", "vfio_pci"]), content);
        assert_eq!(tool.render_module_config(None, &["vfio"]), "# vfio passthrough (vfioprep)\nvfio\n");
    }

    #[test]
    fn test_mkinitcpio_modules_prepended() {
        let tool = InitramfsTool::Mkinitcpio;
        let existing = "# MODULES=(example)\nMODULES=(amdgpu vfio)\nHOOKS=(base udev)\n";
        let content = tool.render_module_config(Some(existing), &["vfio", "vfio_iommu_type1", "vfio_pci"]);
        assert_eq!(
            content,
            "# MODULES=(example)\nMODULES=(vfio_iommu_type1 vfio_pci amdgpu vfio)\nHOOKS=(base udev)\n"
        );
        assert_eq!(tool.render_module_config(Some(&content), &["vfio", "vfio_pci"]), content);
        assert!(tool.edits_main_config());
    }

    #[test]
    fn test_mkinitcpio_without_modules_line() {
        let content =
            InitramfsTool::Mkinitcpio.render_module_config(Some("HOOKS=(base udev)\n"), &["vfio", "vfio_pci"]);
        assert_eq!(content, "MODULES=(vfio vfio_pci)\nHOOKS=(base udev)\n");

        let empty = InitramfsTool::Mkinitcpio.render_module_config(Some("MODULES=()\n"), &["vfio"]);
        assert_eq!(empty, "MODULES=(vfio)\n");
    }
}
