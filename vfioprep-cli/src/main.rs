use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vfioprep_core::{Config, EnumerationSourceKind, Verbosity};

mod commands;
mod prompt;

const AFTER_HELP: &str = "\
vfioprep assumes a single operator running one session at a time. The change
journal and the files it edits are not locked; do not run setup or cleanup
concurrently on the same host. External tools (lspci, kernelstub, update-grub,
initramfs generators) are run to completion without a timeout.";

#[derive(Parser)]
#[command(name = "vfioprep")]
#[command(about = "Prepare a Linux host for GPU passthrough and revert it again", long_about = None)]
#[command(after_help = AFTER_HELP)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct GlobalArgs {
    /// Show info and debug log events
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory for the journal, backups and reversal script
    #[arg(long, global = true, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// PCI vendor id of the GPU to pass through (e.g. 1002, 10de)
    #[arg(long, global = true)]
    vendor: Option<String>,

    /// Device enumeration source
    #[arg(long, global = true, value_parser = ["lspci", "sysfs"])]
    source: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List display controllers with their ids, driver and IOMMU group
    Gpus,

    /// List IOMMU groups and their members
    Groups,

    /// Configure the host to hand the selected GPU to a guest
    Setup {
        /// Pass through every device in the GPU's IOMMU group
        #[arg(long)]
        whole_group: bool,

        /// Show what would change without touching the host
        #[arg(long)]
        dry_run: bool,

        /// Answer yes to every confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Revert every change recorded by setup
    Cleanup {
        /// Show the reversal steps without running them
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Regenerate the reversal script from the recorded changes
    Script {
        /// Write the script here instead of the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the script to stdout
        #[arg(long, conflicts_with = "output")]
        stdout: bool,
    },

    /// Show the effective configuration
    Config {
        /// Persist the effective configuration as the new default
        #[arg(long)]
        save: bool,
    },
}

impl GlobalArgs {
    fn verbosity(&self) -> Verbosity {
        if self.verbose {
            Verbosity::Verbose
        } else if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    /// Config file values overridden by command-line flags.
    fn config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        if let Some(vendor) = &self.vendor {
            config.preferred_vendor = vendor.clone();
        }
        if let Some(source) = self.source.as_deref().and_then(EnumerationSourceKind::parse) {
            config.enumeration_source = source;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.display().to_string());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    vfioprep_core::init_observability(cli.global.verbosity());

    let mut config = cli.global.config()?;

    match cli.command {
        Commands::Gpus => commands::gpus(&config)?,

        Commands::Groups => commands::groups(&config)?,

        Commands::Setup { whole_group, dry_run, yes } => {
            config.whole_group |= whole_group;
            commands::setup(&config, dry_run, yes)?;
        }

        Commands::Cleanup { dry_run, yes } => commands::cleanup(&config, dry_run, yes)?,

        Commands::Script { output, stdout } => commands::script(&config, output, stdout)?,

        Commands::Config { save } => commands::show_config(&config, save)?,
    }

    Ok(())
}
