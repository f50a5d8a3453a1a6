//! `vfioprep cleanup` command

use crate::prompt::confirm;
use anyhow::{bail, Result};
use colored::Colorize;
use vfioprep_core::host::{boot_tool_by_name, detect_boot_tool, BootParameterTool, InitramfsRebuilder, InitramfsTool};
use vfioprep_core::{paths, synthesize, Config, Journal, ReversalContext};

/// Revert every change recorded in the persisted journal.
pub fn cleanup(config: &Config, dry_run: bool, yes: bool) -> Result<()> {
    let journal_path = paths::journal_path_in(&config.output_dir());
    let journal = match Journal::load(&journal_path) {
        Ok(journal) => journal,
        Err(e) if e.is_nothing_to_clean() => {
            println!("Nothing to clean up: no recorded changes at {}", journal_path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_session(&journal);
    let procedure = synthesize(&journal);
    if procedure.is_empty() {
        println!("Nothing to clean up: the journal records no changes");
        return Ok(());
    }

    println!("{}", "Reversal steps:".bold());
    for (i, step) in procedure.steps().iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
    println!();

    if !dry_run && !yes && !confirm("Revert these changes?")? {
        println!("Aborted.");
        return Ok(());
    }

    // Prefer the mechanism the session used; detection may pick another one.
    let boot_tool: Option<Box<dyn BootParameterTool>> = journal
        .session
        .boot_tool
        .as_deref()
        .and_then(boot_tool_by_name)
        .or_else(detect_boot_tool);
    let initramfs = InitramfsTool::detect();

    let ctx = ReversalContext {
        boot_tool: boot_tool.as_deref(),
        initramfs: initramfs.as_ref().map(|t| t as &dyn InitramfsRebuilder),
        dry_run,
    };
    let report = procedure.execute(&ctx);

    for done in &report.completed {
        println!("{} {}", "✓".green().bold(), done);
    }
    for notice in &report.notices {
        println!("{} {}", "ℹ".blue().bold(), notice);
    }

    if !report.is_clean() {
        println!();
        println!("{}", "Some steps need manual attention:".yellow().bold());
        for warning in &report.warnings {
            println!("  {} {}", "⚠".yellow().bold(), warning);
        }
        bail!(
            "cleanup finished with {} warning(s); the journal at {} was kept so cleanup can be re-run",
            report.warnings.len(),
            journal_path.display()
        );
    }

    println!();
    if dry_run {
        println!("Dry run: nothing was changed.");
    } else {
        println!("{} Host configuration reverted. Reboot to return the GPU to the host.", "✓".green().bold());
    }
    Ok(())
}

fn print_session(journal: &Journal) {
    let session = &journal.session;
    if let Some(device) = &session.selected_device {
        let description = session.device_description.as_deref().unwrap_or("");
        println!("{} Session for {} {}", "→".cyan().bold(), device.bold(), description);
    }
    if !session.device_ids.is_empty() {
        println!("  ids: {}", session.device_ids.join(", "));
    }
    if let Some(group) = session.isolation_group {
        println!("  IOMMU group: {}", group);
    }
    if let Some(started) = session.started_at {
        println!("  started: {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    let counts: Vec<String> =
        journal.counts().into_iter().map(|(category, n)| format!("{} {}", n, category)).collect();
    if !counts.is_empty() {
        println!("  recorded: {}", counts.join(", "));
    }
    let backups = journal.all_backup_paths();
    if !backups.is_empty() {
        println!("  backups:");
        for backup in backups {
            println!("    {}", backup.display());
        }
    }
    println!();
}
