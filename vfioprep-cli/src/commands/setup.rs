//! `vfioprep setup` command

use super::capture;
use crate::prompt::{confirm, TerminalChooser};
use anyhow::{bail, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use vfioprep_core::devices::{
    device_ids, select_primary, verify_host_retains_display, Device, GroupMode, TargetSelection,
};
use vfioprep_core::host::{
    apply_boot_parameters, detect_boot_tool, required_kernel_parameters, write_initramfs_module_config,
    write_module_config, BootParameterTool, CpuVendor, InitramfsRebuilder, InitramfsTool,
};
use vfioprep_core::reversal::{write_script, ScriptOptions};
use vfioprep_core::{paths, synthesize, BackupStore, Config, Journal, PrepError};

/// Journal plus where it goes; persisted after every mutation step.
struct Session {
    journal: Journal,
    journal_path: PathBuf,
    script_path: PathBuf,
    dry_run: bool,
}

impl Session {
    fn open(output_dir: &Path, dry_run: bool) -> Result<Self> {
        let journal_path = paths::journal_path_in(output_dir);
        let mut journal = match Journal::load(&journal_path) {
            Ok(journal) => {
                println!(
                    "{} Continuing the session recorded in {} ({} change(s))",
                    "→".cyan().bold(),
                    journal_path.display(),
                    journal.len()
                );
                journal
            }
            Err(e) if e.is_nothing_to_clean() => Journal::new(),
            Err(e) => return Err(e.into()),
        };
        journal.session.dry_run = dry_run;

        Ok(Self {
            journal,
            journal_path,
            script_path: paths::reversal_script_path_in(output_dir),
            dry_run,
        })
    }

    /// Persist the journal. A dry run never overwrites the real journal.
    fn checkpoint(&self) -> Result<()> {
        if !self.dry_run {
            self.journal.persist(&self.journal_path)?;
        }
        Ok(())
    }

    fn finish(
        &self,
        boot_tool: Option<&dyn BootParameterTool>,
        initramfs: Option<&dyn InitramfsRebuilder>,
    ) -> Result<()> {
        let procedure = synthesize(&self.journal);
        let options = ScriptOptions { boot_tool, initramfs };

        if self.dry_run {
            println!();
            println!("{}", "Dry run: nothing was changed. Cleanup would run:".bold());
            for (i, step) in procedure.steps().iter().enumerate() {
                println!("  {}. {}", i + 1, step);
            }
            return Ok(());
        }

        self.checkpoint()?;
        write_script(&procedure, &self.script_path, &options)?;
        println!("{} Journal:         {}", "✓".green().bold(), self.journal_path.display());
        println!("{} Reversal script: {}", "✓".green().bold(), self.script_path.display());
        Ok(())
    }
}

/// Prepare the host for passing the selected GPU to a guest.
pub fn setup(config: &Config, dry_run: bool, yes: bool) -> Result<()> {
    let output_dir = config.output_dir();
    let backups = BackupStore::new(paths::backups_dir_in(&output_dir)).dry_run(dry_run);
    let mut session = Session::open(&output_dir, dry_run)?;

    let snapshot = capture(config)?;
    let displays = snapshot.displays();
    let primary = select_primary(&displays, &config.preferred_vendor, &mut TerminalChooser)?;

    println!("{} Passthrough GPU: {}", "→".cyan().bold(), primary.display_name().bold());
    if !verify_host_retains_display(&displays, &primary, &config.passthrough_driver) {
        println!(
            "{} No other GPU with a working driver will remain for the host display.",
            "⚠".yellow().bold()
        );
        ask(yes, "Continue without a host display?", "host display check")?;
    }

    let mode = if config.whole_group { GroupMode::WholeGroup } else { GroupMode::Slot };
    let boot_tool = detect_boot_tool();
    let initramfs = InitramfsTool::detect();
    let params = required_kernel_parameters(CpuVendor::detect()?, &config.passthrough_driver);

    let selection = match snapshot.resolve(&primary, mode) {
        Ok(selection) => selection,
        Err(e @ PrepError::NoIsolationData { .. }) => {
            println!("{} {}", "⚠".yellow().bold(), e);
            ask(yes, "Configure the IOMMU kernel parameters now?", "IOMMU enablement")?;

            let result = enable_iommu(&mut session, boot_tool.as_deref(), &params, &backups);
            session.finish(boot_tool.as_deref(), None)?;
            result?;
            println!();
            println!("Reboot, then run `vfioprep setup` again to configure passthrough.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_selection(&selection);
    ask(yes, "Apply passthrough configuration for these devices?", "confirmation")?;

    record_selection(&mut session.journal, &primary, &selection);
    let result = apply(&mut session, config, &selection, &params, boot_tool.as_deref(), initramfs, &backups);
    // Whatever happened, the journal must reflect it.
    session.finish(boot_tool.as_deref(), initramfs.as_ref().map(|t| t as &dyn InitramfsRebuilder))?;
    result?;

    if !dry_run {
        println!();
        println!("{} Host prepared. Reboot to hand {} to vfio.", "✓".green().bold(), primary.address);
        println!("Run `vfioprep cleanup` (or the reversal script) to undo.");
    }
    Ok(())
}

fn ask(yes: bool, question: &str, step: &str) -> Result<()> {
    if yes || confirm(question)? {
        return Ok(());
    }
    Err(PrepError::UserAborted { step: step.to_string() }.into())
}

fn print_selection(selection: &TargetSelection) {
    println!("Devices in IOMMU group {}:", selection.group_id);
    for device in selection.members() {
        println!("  {} {} {}", "•".dimmed(), device.address.to_string().bold(), device.display_name());
    }
    for warning in selection.warnings() {
        println!("{} {}", "⚠".yellow().bold(), warning);
    }
}

fn record_selection(journal: &mut Journal, primary: &Device, selection: &TargetSelection) {
    journal.session.selected_device = Some(primary.address.to_string());
    journal.session.device_description = Some(primary.display_name());
    journal.session.device_ids = device_ids(selection).iter().map(ToString::to_string).collect();
    journal.session.isolation_group = Some(selection.group_id);
}

fn enable_iommu(
    session: &mut Session,
    boot_tool: Option<&dyn BootParameterTool>,
    params: &[String],
    backups: &BackupStore,
) -> Result<()> {
    let Some(tool) = boot_tool else {
        println!(
            "{} No supported boot loader tool found. Add these kernel parameters by hand: {}",
            "⚠".yellow().bold(),
            params.join(" ")
        );
        return Ok(());
    };

    let outcome = apply_boot_parameters(tool, params, backups, &mut session.journal);
    session.checkpoint()?;
    let outcome = outcome?;
    if outcome.changed() {
        println!("{} Kernel parameters set via {}: {}", "✓".green().bold(), tool.name(), params.join(" "));
    } else {
        println!("{} Kernel parameters already present", "✓".green().bold());
    }
    Ok(())
}

fn apply(
    session: &mut Session,
    config: &Config,
    selection: &TargetSelection,
    params: &[String],
    boot_tool: Option<&dyn BootParameterTool>,
    initramfs: Option<InitramfsTool>,
    backups: &BackupStore,
) -> Result<()> {
    let root = Path::new("/");

    enable_iommu(session, boot_tool, params, backups)?;

    let ids = device_ids(selection);
    let written = write_module_config(&ids, &config.passthrough_driver, root, backups, &mut session.journal);
    session.checkpoint()?;
    for path in written?.written {
        println!("{} Wrote {}", "✓".green().bold(), path.display());
    }

    let Some(tool) = initramfs else {
        println!(
            "{} No initramfs generator found; rebuild the initramfs by hand before rebooting.",
            "⚠".yellow().bold()
        );
        return Ok(());
    };

    let early_modules = write_initramfs_module_config(tool, root, backups, &mut session.journal);
    session.checkpoint()?;
    for path in early_modules?.written {
        println!("{} Wrote {}", "✓".green().bold(), path.display());
    }

    if session.dry_run {
        println!("{} Would rebuild the initramfs with {}", "→".cyan().bold(), tool);
        return Ok(());
    }

    println!("{} Rebuilding the initramfs with {} (this can take a while)...", "→".cyan().bold(), tool);
    if let Err(e) = tool.rebuild() {
        bail!("{}. The configuration is in place; rebuild the initramfs by hand before rebooting.", e);
    }
    println!("{} Initramfs rebuilt", "✓".green().bold());
    Ok(())
}
