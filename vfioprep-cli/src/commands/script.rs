//! `vfioprep script` command

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use vfioprep_core::host::{boot_tool_by_name, BootParameterTool, InitramfsRebuilder, InitramfsTool};
use vfioprep_core::reversal::{write_script, ScriptOptions};
use vfioprep_core::{paths, synthesize, Config, Journal};

/// Regenerate the reversal script from the persisted journal.
pub fn script(config: &Config, output: Option<PathBuf>, stdout: bool) -> Result<()> {
    let output_dir = config.output_dir();
    let journal_path = paths::journal_path_in(&output_dir);
    let journal = Journal::load(&journal_path)
        .with_context(|| "run `vfioprep setup` first; the script is generated from its journal")?;

    let procedure = synthesize(&journal);
    let boot_tool: Option<Box<dyn BootParameterTool>> =
        journal.session.boot_tool.as_deref().and_then(boot_tool_by_name);
    let initramfs = InitramfsTool::detect();
    let options = ScriptOptions {
        boot_tool: boot_tool.as_deref(),
        initramfs: initramfs.as_ref().map(|t| t as &dyn InitramfsRebuilder),
    };

    if stdout {
        print!("{}", procedure.render_script(&options));
        return Ok(());
    }

    let path = output.unwrap_or_else(|| paths::reversal_script_path_in(&output_dir));
    write_script(&procedure, &path, &options)?;
    println!(
        "{} Wrote {} ({} step(s))",
        "✓".green().bold(),
        path.display(),
        procedure.steps().len()
    );
    println!("Run it as root; set DRY_RUN=true to preview.");
    Ok(())
}
