//! `vfioprep config` command

use anyhow::Result;
use colored::Colorize;
use vfioprep_core::{paths, Config};

/// Print the effective configuration, optionally saving it.
pub fn show_config(config: &Config, save: bool) -> Result<()> {
    let output_dir = config.output_dir();

    println!("{:<20} {}", "preferred_vendor", config.preferred_vendor);
    println!("{:<20} {}", "passthrough_driver", config.passthrough_driver);
    println!("{:<20} {}", "whole_group", config.whole_group);
    println!("{:<20} {:?}", "enumeration_source", config.enumeration_source);
    println!("{:<20} {}", "output_dir", output_dir.display());
    println!();
    println!("{:<20} {}", "journal", paths::journal_path_in(&output_dir).display());
    println!("{:<20} {}", "backups", paths::backups_dir_in(&output_dir).display());
    println!("{:<20} {}", "reversal script", paths::reversal_script_path_in(&output_dir).display());

    if save {
        config.save()?;
        println!();
        println!("{} Saved to {}", "✓".green().bold(), Config::config_path().display());
    }
    Ok(())
}
