//! Passthrough driver binding and early module loading.
//!
//! Writes the modprobe options that make the passthrough driver claim the
//! selected `vendor:device` ids, the modules-load list, and the per-tool
//! initramfs module config that pulls the modules into early boot.

use crate::backup::BackupStore;
use crate::devices::DeviceId;
use crate::error::{PrepError, Result};
use crate::host::InitramfsTool;
use crate::journal::{detail, Action, Category, Details, Journal};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// modprobe options file, relative to the filesystem root.
pub const MODPROBE_CONF: &str = "etc/modprobe.d/vfio.conf";

/// modules-load list, relative to the filesystem root.
pub const MODULES_LOAD_CONF: &str = "etc/modules-load.d/vfio-pci-load.conf";

/// Modules loaded early for passthrough.
pub const VFIO_MODULES: [&str; 3] = ["vfio", "vfio_iommu_type1", "vfio_pci"];

/// Display drivers that must wait for the passthrough driver.
pub const SOFTDEP_DRIVERS: [&str; 6] = ["drm", "amdgpu", "nouveau", "radeon", "nvidia", "i915"];

/// Files written by [`write_module_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleConfigOutcome {
    /// Files created or changed, in write order.
    pub written: Vec<PathBuf>,
    /// Files that already had the wanted content.
    pub unchanged: Vec<PathBuf>,
}

/// `options <driver> ids=...` line for `ids`.
pub fn options_line(ids: &[DeviceId], driver: &str) -> String {
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("options {} ids={} disable_vga=1 disable_idle_d3=1", driver, ids.join(","))
}

/// Merge our options and softdeps into an existing modprobe file.
///
/// The first `options <driver>` line is replaced and later duplicates are
/// commented out. Comments and unrelated lines are kept. Missing softdep
/// lines are appended.
pub fn render_modprobe_conf(existing: &str, ids: &[DeviceId], driver: &str) -> String {
    let options = options_line(ids, driver);
    let options_prefix = format!("options {}", driver);
    let softdeps: Vec<String> =
        SOFTDEP_DRIVERS.iter().map(|d| format!("softdep {} pre: {}", d, driver)).collect();

    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;

    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(&options_prefix) {
            if replaced {
                lines.push(format!("# {} # duplicate disabled by vfioprep", line));
            } else {
                lines.push(options.clone());
                replaced = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }

    if !replaced {
        lines.push(options);
    }
    for softdep in softdeps {
        if !lines.iter().any(|l| l.trim() == softdep) {
            lines.push(softdep);
        }
    }

    lines.join("\n") + "\n"
}

/// modules-load list content.
pub fn render_modules_load() -> String {
    VFIO_MODULES.join("\n") + "\n"
}

/// Configure the passthrough driver to claim `ids` at boot.
///
/// Paths are resolved under `root` (`/` on a live host). Existing files are
/// backed up and every write is recorded as a module-list change before it
/// happens.
pub fn write_module_config(
    ids: &[DeviceId],
    driver: &str,
    root: &Path,
    backups: &BackupStore,
    journal: &mut Journal,
) -> Result<ModuleConfigOutcome> {
    let mut outcome = ModuleConfigOutcome::default();

    let modprobe = root.join(MODPROBE_CONF);
    let existing = read_optional(&modprobe)?;
    let content = render_modprobe_conf(existing.as_deref().unwrap_or(""), ids, driver);
    write_tracked(&modprobe, existing.as_deref(), &content, backups, journal, &mut outcome)?;

    let modules_load = root.join(MODULES_LOAD_CONF);
    let existing = read_optional(&modules_load)?;
    write_tracked(&modules_load, existing.as_deref(), &render_modules_load(), backups, journal, &mut outcome)?;

    info!(ids = ?ids.iter().map(ToString::to_string).collect::<Vec<_>>(), written = outcome.written.len(), "Module configuration done");
    Ok(outcome)
}

/// Make `tool` pull the passthrough modules into the initramfs.
///
/// Drop-in tools (dracut, booster) get a file of their own. initramfs-tools
/// gets the missing modules appended to its modules list, and mkinitcpio gets
/// them added to `MODULES=` in its main config, which must already exist.
/// Edited files are backed up and recorded like every other module-list write.
pub fn write_initramfs_module_config(
    tool: InitramfsTool,
    root: &Path,
    backups: &BackupStore,
    journal: &mut Journal,
) -> Result<ModuleConfigOutcome> {
    let mut outcome = ModuleConfigOutcome::default();
    let path = root.join(tool.module_config_path());
    let existing = read_optional(&path)?;
    if existing.is_none() && tool.edits_main_config() {
        return Err(PrepError::ToolFailed {
            tool: tool.binary().to_string(),
            reason: format!("{} not found; is {} installed?", path.display(), tool),
        });
    }

    let content = tool.render_module_config(existing.as_deref(), &VFIO_MODULES);
    write_tracked(&path, existing.as_deref(), &content, backups, journal, &mut outcome)?;
    Ok(outcome)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PrepError::IoError { path: path.to_path_buf(), source: e }),
    }
}

fn write_tracked(
    path: &Path,
    existing: Option<&str>,
    content: &str,
    backups: &BackupStore,
    journal: &mut Journal,
    outcome: &mut ModuleConfigOutcome,
) -> Result<()> {
    if existing == Some(content) {
        debug!(path = %path.display(), "Already up to date");
        outcome.unchanged.push(path.to_path_buf());
        return Ok(());
    }

    let mut details = Details::new();
    let action = match existing {
        Some(_) => {
            if let Some(backup) = backups.backup(path)? {
                details.insert(detail::BACKUP_PATH.to_string(), backup.display().to_string());
            }
            Action::Modified
        }
        None => Action::Created,
    };
    journal.record(Category::ModuleList, path.display().to_string(), action, details);
    outcome.written.push(path.to_path_buf());

    if backups.is_dry_run() {
        info!(path = %path.display(), %action, "[dry run] Would write");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PrepError::IoError { path: parent.to_path_buf(), source: e })?;
    }
    fs::write(path, content).map_err(|e| PrepError::IoError { path: path.to_path_buf(), source: e })?;
    info!(path = %path.display(), %action, "Wrote module configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids() -> Vec<DeviceId> {
        vec![
            DeviceId { vendor: "1002".into(), device: "73bf".into() },
            DeviceId { vendor: "1002".into(), device: "ab28".into() },
        ]
    }

    #[test]
    fn test_fresh_modprobe_conf() {
        let content = render_modprobe_conf("", &ids(), "vfio-pci");
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("options vfio-pci ids=1002:73bf,1002:ab28 disable_vga=1 disable_idle_d3=1")
        );
        assert!(content.contains("softdep amdgpu pre: vfio-pci\n"));
        assert_eq!(content.lines().count(), 1 + SOFTDEP_DRIVERS.len());
    }

    #[test]
    fn test_existing_modprobe_conf_is_merged() {
        let existing = "# local tweaks\noptions vfio-pci ids=10de:1b80\noptions snd-hda-intel power_save=0\noptions vfio-pci ids=dead:beef\nsoftdep amdgpu pre: vfio-pci\n";
        let content = render_modprobe_conf(existing, &ids(), "vfio-pci");

        assert!(content.starts_with("# local tweaks\noptions vfio-pci ids=1002:73bf,1002:ab28"));
        assert!(content.contains("options snd-hda-intel power_save=0\n"));
        assert!(content.contains("# options vfio-pci ids=dead:beef # duplicate disabled by vfioprep\n"));
        assert_eq!(content.matches("softdep amdgpu pre: vfio-pci").count(), 1);
        assert!(!content.contains("10de:1b80"));
    }

    #[test]
    fn test_write_module_config_records_changes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let modprobe = root.join(MODPROBE_CONF);
        fs::create_dir_all(modprobe.parent().unwrap()).unwrap();
        fs::write(&modprobe, "options vfio-pci ids=10de:1b80\n").unwrap();

        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();
        let outcome = write_module_config(&ids(), "vfio-pci", &root, &backups, &mut journal).unwrap();

        assert_eq!(outcome.written.len(), 2);
        let modprobe_record = journal.find(Category::ModuleList, &modprobe.display().to_string()).unwrap();
        assert_eq!(modprobe_record.action, Action::Modified);
        let backup = modprobe_record.earliest_backup().unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), "options vfio-pci ids=10de:1b80\n");

        let load = root.join(MODULES_LOAD_CONF);
        let load_record = journal.find(Category::ModuleList, &load.display().to_string()).unwrap();
        assert_eq!(load_record.action, Action::Created);
        assert_eq!(fs::read_to_string(load).unwrap(), "vfio\nvfio_iommu_type1\nvfio_pci\n");
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();

        write_module_config(&ids(), "vfio-pci", &root, &backups, &mut journal).unwrap();
        let again = write_module_config(&ids(), "vfio-pci", &root, &backups, &mut journal).unwrap();

        assert!(again.written.is_empty());
        assert_eq!(again.unchanged.len(), 2);
        assert!(journal.records(Category::ModuleList).iter().all(|r| r.history.len() == 1));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let backups = BackupStore::new(tmp.path().join("backups")).dry_run(true);
        let mut journal = Journal::new();

        let outcome = write_module_config(&ids(), "vfio-pci", &root, &backups, &mut journal).unwrap();
        assert_eq!(outcome.written.len(), 2);
        assert!(!root.exists());
    }

    #[test]
    fn test_dracut_drop_in() {
        let tmp = TempDir::new().unwrap();
        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();

        let outcome =
            write_initramfs_module_config(InitramfsTool::Dracut, tmp.path(), &backups, &mut journal).unwrap();
        assert_eq!(outcome.written.len(), 1);
        let content = fs::read_to_string(&outcome.written[0]).unwrap();
        assert_eq!(content, "force_drivers+=\" vfio vfio_iommu_type1 vfio_pci \"\n");
        assert_eq!(journal.records(Category::ModuleList)[0].action, Action::Created);
    }

    #[test]
    fn test_initramfs_tools_modules_backed_up_and_recorded() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let modules = root.join("etc/initramfs-tools/modules");
        let original = "# List of modules that you want to include in your initramfs.\nvfio\n";
        fs::create_dir_all(modules.parent().unwrap()).unwrap();
        fs::write(&modules, original).unwrap();

        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();
        let outcome =
            write_initramfs_module_config(InitramfsTool::UpdateInitramfs, &root, &backups, &mut journal)
                .unwrap();

        assert_eq!(outcome.written, vec![modules.clone()]);
        let content = fs::read_to_string(&modules).unwrap();
        assert!(content.starts_with(original));
        assert!(content.ends_with("vfio_iommu_type1\nvfio_pci\n"));
        assert_eq!(content.matches("\nvfio\n").count(), 1);

        let record = journal.find(Category::ModuleList, &modules.display().to_string()).unwrap();
        assert_eq!(record.action, Action::Modified);
        assert_eq!(fs::read_to_string(record.earliest_backup().unwrap()).unwrap(), original);

        let again =
            write_initramfs_module_config(InitramfsTool::UpdateInitramfs, &root, &backups, &mut journal)
                .unwrap();
        assert!(again.written.is_empty());
        assert_eq!(record_history_len(&journal, &modules), 1);
    }

    #[test]
    fn test_mkinitcpio_conf_backed_up_and_recorded() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let conf = root.join("etc/mkinitcpio.conf");
        let original = "MODULES=(amdgpu)\nBINARIES=()\nHOOKS=(base udev autodetect modconf block filesystems)\n";
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, original).unwrap();

        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();
        write_initramfs_module_config(InitramfsTool::Mkinitcpio, &root, &backups, &mut journal).unwrap();

        let content = fs::read_to_string(&conf).unwrap();
        assert!(content.starts_with("MODULES=(vfio vfio_iommu_type1 vfio_pci amdgpu)\n"));
        assert!(content.ends_with("HOOKS=(base udev autodetect modconf block filesystems)\n"));

        let record = journal.find(Category::ModuleList, &conf.display().to_string()).unwrap();
        assert_eq!(record.action, Action::Modified);
        assert_eq!(fs::read_to_string(record.earliest_backup().unwrap()).unwrap(), original);

        let again = write_initramfs_module_config(InitramfsTool::Mkinitcpio, &root, &backups, &mut journal).unwrap();
        assert_eq!(again.unchanged, vec![conf.clone()]);
        assert_eq!(record_history_len(&journal, &conf), 1);
    }

    #[test]
    fn test_missing_mkinitcpio_conf_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();

        let result = write_initramfs_module_config(InitramfsTool::Mkinitcpio, tmp.path(), &backups, &mut journal);
        assert!(matches!(result, Err(PrepError::ToolFailed { .. })));
        assert!(journal.is_empty());
    }

    fn record_history_len(journal: &Journal, path: &Path) -> usize {
        journal.find(Category::ModuleList, &path.display().to_string()).unwrap().history.len()
    }
}
