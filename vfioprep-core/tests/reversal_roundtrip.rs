//! Setup/cleanup round trips against a throwaway filesystem root.
//!
//! Each test applies a session the way `vfioprep setup` does, persists the
//! journal, loads it back and runs the synthesized reversal. The host is
//! modelled by a temp dir plus in-memory boot and initramfs tools.

use std::cell::{Cell, RefCell};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vfioprep_core::devices::DeviceId;
use vfioprep_core::error::Result;
use vfioprep_core::host::modules::{MODPROBE_CONF, MODULES_LOAD_CONF};
use vfioprep_core::host::{
    apply_boot_parameters, write_initramfs_module_config, write_module_config, BootParameterTool,
    GrubDefault, InitramfsRebuilder, InitramfsTool, Kernelstub,
};
use vfioprep_core::journal::{detail, Action, Category, Details};
use vfioprep_core::reversal::ReversalStep;
use vfioprep_core::{synthesize, BackupStore, Journal, PrepError, ReversalContext};

const GRUB: &str = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\nGRUB_CMDLINE_LINUX=\"\"\n";
const OLD_MODPROBE: &str = "# local tweaks\noptions vfio-pci ids=10de:1b80\n";

/// kernelstub stand-in keeping the command line in memory.
struct MemoryStub {
    params: RefCell<Vec<String>>,
}

impl MemoryStub {
    fn with(params: &[&str]) -> Self {
        Self { params: RefCell::new(params.iter().map(|p| p.to_string()).collect()) }
    }
}

impl BootParameterTool for MemoryStub {
    fn name(&self) -> &str {
        "kernelstub"
    }

    fn current(&self) -> Result<Vec<String>> {
        Ok(self.params.borrow().clone())
    }

    fn add(&self, params: &[String]) -> Result<()> {
        let mut current = self.params.borrow_mut();
        for p in params {
            if !current.contains(p) {
                current.push(p.clone());
            }
        }
        Ok(())
    }

    fn remove(&self, params: &[String]) -> Result<()> {
        self.params.borrow_mut().retain(|p| !params.contains(p));
        Ok(())
    }
}

#[derive(Default)]
struct CountingRebuilder {
    rebuilds: Cell<usize>,
}

impl InitramfsRebuilder for CountingRebuilder {
    fn name(&self) -> &str {
        "counting"
    }

    fn rebuild(&self) -> Result<()> {
        self.rebuilds.set(self.rebuilds.get() + 1);
        Ok(())
    }

    fn script_command(&self) -> String {
        "true".to_string()
    }
}

fn ids() -> Vec<DeviceId> {
    vec![
        DeviceId { vendor: "1002".into(), device: "73bf".into() },
        DeviceId { vendor: "1002".into(), device: "ab28".into() },
    ]
}

struct Host {
    _tmp: TempDir,
    root: PathBuf,
    backups: BackupStore,
    journal_path: PathBuf,
}

impl Host {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("etc/default")).unwrap();
        fs::create_dir_all(root.join("etc/modprobe.d")).unwrap();
        fs::write(root.join("etc/default/grub"), GRUB).unwrap();
        fs::write(root.join(MODPROBE_CONF), OLD_MODPROBE).unwrap();

        let backups = BackupStore::new(tmp.path().join("backups"));
        let journal_path = tmp.path().join("changes.json");
        Self { _tmp: tmp, root, backups, journal_path }
    }

    fn grub(&self) -> GrubDefault {
        GrubDefault::new(self.root.join("etc/default/grub"))
            .with_refresh_command(Some(vec!["true".to_string()]))
    }

    fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.root.join(relative)).ok()
    }

    /// Apply a full session through GRUB and dracut, persisting the journal.
    fn setup_with_grub(&self) {
        let mut journal = Journal::new();
        let params: Vec<String> = vec!["amd_iommu=on".into(), "iommu=pt".into()];
        apply_boot_parameters(&self.grub(), &params, &self.backups, &mut journal).unwrap();
        write_module_config(&ids(), "vfio-pci", &self.root, &self.backups, &mut journal).unwrap();
        write_initramfs_module_config(InitramfsTool::Dracut, &self.root, &self.backups, &mut journal)
            .unwrap();
        journal.persist(&self.journal_path).unwrap();
    }
}

fn exists(path: &Path) -> bool {
    path.exists()
}

#[test]
fn test_setup_then_cleanup_restores_host() {
    let host = Host::new();
    host.setup_with_grub();

    assert!(host.read("etc/default/grub").unwrap().contains("amd_iommu=on iommu=pt"));
    assert!(host.read(MODPROBE_CONF).unwrap().contains("ids=1002:73bf,1002:ab28"));
    assert!(host.read(MODULES_LOAD_CONF).is_some());
    assert!(host.read("etc/dracut.conf.d/vfio.conf").is_some());

    let journal = Journal::load(&host.journal_path).unwrap();
    let procedure = synthesize(&journal);

    let grub = host.grub();
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&grub), initramfs: Some(&rebuilder), dry_run: false };
    let report = procedure.execute(&ctx);

    assert!(report.is_clean(), "warnings: {:?}", report.warnings);
    assert_eq!(host.read("etc/default/grub").unwrap(), GRUB);
    assert_eq!(host.read(MODPROBE_CONF).unwrap(), OLD_MODPROBE);
    assert!(!exists(&host.root.join(MODULES_LOAD_CONF)));
    assert!(!exists(&host.root.join("etc/dracut.conf.d/vfio.conf")));
    assert_eq!(rebuilder.rebuilds.get(), 1);
}

#[test]
fn test_cleanup_runs_twice_without_harm() {
    let host = Host::new();
    host.setup_with_grub();

    let procedure = synthesize(&Journal::load(&host.journal_path).unwrap());
    let grub = host.grub();
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&grub), initramfs: Some(&rebuilder), dry_run: false };

    let first = procedure.execute(&ctx);
    let second = procedure.execute(&ctx);

    assert!(first.is_clean());
    assert!(second.is_clean(), "warnings: {:?}", second.warnings);
    assert_eq!(host.read("etc/default/grub").unwrap(), GRUB);
    assert_eq!(host.read(MODPROBE_CONF).unwrap(), OLD_MODPROBE);
    assert!(host.read(MODULES_LOAD_CONF).is_none());
}

#[test]
fn test_missing_backup_does_not_stop_other_steps() {
    let host = Host::new();
    host.setup_with_grub();

    let journal = Journal::load(&host.journal_path).unwrap();
    let modprobe = host.root.join(MODPROBE_CONF);
    let record = journal.find(Category::ModuleList, &modprobe.display().to_string()).unwrap();
    fs::remove_file(record.earliest_backup().unwrap()).unwrap();

    let grub = host.grub();
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&grub), initramfs: Some(&rebuilder), dry_run: false };
    let report = synthesize(&journal).execute(&ctx);

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].target, modprobe.display().to_string());
    // Everything else was still undone.
    assert_eq!(host.read("etc/default/grub").unwrap(), GRUB);
    assert!(host.read(MODULES_LOAD_CONF).is_none());
    assert!(host.read("etc/dracut.conf.d/vfio.conf").is_none());
    assert_eq!(rebuilder.rebuilds.get(), 1);
}

#[test]
fn test_command_tool_parameters_are_reverted() {
    let host = Host::new();
    let stub = MemoryStub::with(&["quiet", "splash", "iommu=soft"]);

    let mut journal = Journal::new();
    let params: Vec<String> = vec!["amd_iommu=on".into(), "iommu=pt".into()];
    apply_boot_parameters(&stub, &params, &host.backups, &mut journal).unwrap();
    assert_eq!(*stub.params.borrow(), vec!["quiet", "splash", "amd_iommu=on", "iommu=pt"]);
    assert_eq!(journal.session.boot_tool.as_deref(), Some("kernelstub"));
    journal.persist(&host.journal_path).unwrap();

    let procedure = synthesize(&Journal::load(&host.journal_path).unwrap());
    assert!(procedure
        .steps()
        .iter()
        .any(|s| matches!(s, ReversalStep::AddBootParameters { params, .. } if params == &["iommu=soft"])));

    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&stub), initramfs: Some(&rebuilder), dry_run: false };
    let report = procedure.execute(&ctx);

    assert!(report.is_clean(), "warnings: {:?}", report.warnings);
    assert_eq!(*stub.params.borrow(), vec!["quiet", "splash", "iommu=soft"]);
}

#[test]
fn test_reapplying_keeps_pre_session_backup() {
    let host = Host::new();
    host.setup_with_grub();

    // A second setup run continues the persisted journal.
    let mut journal = Journal::load(&host.journal_path).unwrap();
    let other: Vec<DeviceId> = vec![DeviceId { vendor: "10de".into(), device: "2204".into() }];
    write_module_config(&other, "vfio-pci", &host.root, &host.backups, &mut journal).unwrap();
    journal.persist(&host.journal_path).unwrap();

    let grub = host.grub();
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&grub), initramfs: Some(&rebuilder), dry_run: false };
    let report = synthesize(&Journal::load(&host.journal_path).unwrap()).execute(&ctx);

    assert!(report.is_clean(), "warnings: {:?}", report.warnings);
    assert_eq!(host.read(MODPROBE_CONF).unwrap(), OLD_MODPROBE);
}

#[test]
fn test_dry_run_setup_leaves_host_untouched() {
    let host = Host::new();
    let backups = host.backups.clone().dry_run(true);

    let mut journal = Journal::new();
    let params: Vec<String> = vec!["amd_iommu=on".into()];
    apply_boot_parameters(&host.grub(), &params, &backups, &mut journal).unwrap();
    write_module_config(&ids(), "vfio-pci", &host.root, &backups, &mut journal).unwrap();

    assert_eq!(host.read("etc/default/grub").unwrap(), GRUB);
    assert_eq!(host.read(MODPROBE_CONF).unwrap(), OLD_MODPROBE);
    assert!(host.read(MODULES_LOAD_CONF).is_none());
    assert!(!exists(backups.dir()));
    // The plan is still fully described.
    assert_eq!(journal.len(), 3);
}

#[test]
fn test_no_journal_means_nothing_to_clean() {
    let tmp = TempDir::new().unwrap();
    let err = Journal::load(&tmp.path().join("changes.json")).unwrap_err();
    assert!(matches!(err, PrepError::JournalNotFound { .. }));
    assert!(err.is_nothing_to_clean());
}

#[test]
fn test_mkinitcpio_modules_restored() {
    let host = Host::new();
    let conf = host.root.join("etc/mkinitcpio.conf");
    let original = "MODULES=()\nHOOKS=(base udev autodetect modconf block filesystems)\n";
    fs::write(&conf, original).unwrap();

    let mut journal = Journal::new();
    write_initramfs_module_config(InitramfsTool::Mkinitcpio, &host.root, &host.backups, &mut journal).unwrap();
    journal.persist(&host.journal_path).unwrap();
    assert!(host.read("etc/mkinitcpio.conf").unwrap().starts_with("MODULES=(vfio vfio_iommu_type1 vfio_pci)\n"));

    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: None, initramfs: Some(&rebuilder), dry_run: false };
    let report = synthesize(&Journal::load(&host.journal_path).unwrap()).execute(&ctx);

    assert!(report.is_clean(), "warnings: {:?}", report.warnings);
    assert_eq!(host.read("etc/mkinitcpio.conf").unwrap(), original);
    assert_eq!(rebuilder.rebuilds.get(), 1);
}

/// Executable `kernelstub` that logs its arguments and prints `-p` output to stderr.
fn fake_kernelstub(dir: &Path, print_output: &str) -> PathBuf {
    let binary = dir.join("kernelstub");
    let script = format!(
        "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = \"-p\" ]; then\n  printf '%s\\n' '{}' >&2\nfi\n",
        dir.join("calls").display(),
        print_output
    );
    fs::write(&binary, script).unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    binary
}

fn kernelstub_session() -> Journal {
    let mut journal = Journal::new();
    let tool = Details::from([(detail::TOOL.to_string(), "kernelstub".to_string())]);
    journal.record(Category::BootParameterTool, "amd_iommu=on", Action::Added, tool.clone());
    journal.record(Category::BootParameterTool, "iommu=pt", Action::Added, tool);
    journal
}

#[test]
fn test_kernelstub_cleanup_deletes_added_options() {
    let tmp = TempDir::new().unwrap();
    let stub = Kernelstub::new(fake_kernelstub(
        tmp.path(),
        "Kernel Boot Options:.quiet splash amd_iommu=on iommu=pt",
    ));
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&stub), initramfs: Some(&rebuilder), dry_run: false };

    let report = synthesize(&kernelstub_session()).execute(&ctx);

    assert!(report.is_clean(), "warnings: {:?}", report.warnings);
    let calls = fs::read_to_string(tmp.path().join("calls")).unwrap();
    assert_eq!(calls, "-p\n--delete-options amd_iommu=on\n--delete-options iommu=pt\n");
}

#[test]
fn test_kernelstub_unreadable_output_still_deletes_and_warns() {
    let tmp = TempDir::new().unwrap();
    let stub = Kernelstub::new(fake_kernelstub(tmp.path(), "kernelstub : INFO Nothing to report"));
    let rebuilder = CountingRebuilder::default();
    let ctx = ReversalContext { boot_tool: Some(&stub), initramfs: Some(&rebuilder), dry_run: false };

    let report = synthesize(&kernelstub_session()).execute(&ctx);

    let calls = fs::read_to_string(tmp.path().join("calls")).unwrap();
    assert!(calls.contains("--delete-options amd_iommu=on\n"));
    assert!(calls.contains("--delete-options iommu=pt\n"));
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].target, "amd_iommu=on iommu=pt");
    assert_eq!(rebuilder.rebuilds.get(), 1);
}
