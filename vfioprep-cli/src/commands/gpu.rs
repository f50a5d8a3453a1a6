//! `vfioprep gpus` command

use super::{capture, or_dash};
use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use vfioprep_core::devices::{host_display, select_primary, Device};
use vfioprep_core::Config;

#[derive(Tabled)]
struct GpuRow {
    #[tabled(rename = "PCI ADDRESS")]
    address: String,
    #[tabled(rename = "VENDOR")]
    vendor: String,
    #[tabled(rename = "IDS")]
    ids: String,
    #[tabled(rename = "MODEL")]
    model: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
    #[tabled(rename = "IOMMU")]
    group: String,
}

/// List display controllers.
pub fn gpus(config: &Config) -> Result<()> {
    let snapshot = capture(config)?;
    let displays = snapshot.displays();

    if displays.is_empty() {
        println!("No GPUs detected");
        return Ok(());
    }

    let rows: Vec<GpuRow> = displays
        .iter()
        .map(|d| GpuRow {
            address: d.address.to_string(),
            vendor: d.vendor_name().to_string(),
            ids: d.id().to_string(),
            model: truncate(&d.description, 40),
            driver: or_dash(d.driver.as_deref()),
            group: or_dash(d.isolation_group),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    println!();
    println!("Total: {} GPU(s)", displays.len());

    if snapshot.isolation.is_none() {
        println!(
            "{} IOMMU is not active; enable it in firmware and run `vfioprep setup` to add the kernel parameters",
            "⚠".yellow().bold()
        );
    }

    // Preview only; never prompts.
    let mut no_prompt = |_: &[Device]| -> vfioprep_core::Result<usize> {
        Err(vfioprep_core::PrepError::UserAborted { step: "preview".to_string() })
    };
    match select_primary(&displays, &config.preferred_vendor, &mut no_prompt) {
        Ok(primary) => {
            println!("Passthrough candidate: {}", primary.display_name().bold());
            match host_display(&displays, &primary, &config.passthrough_driver) {
                Some(host) => println!("Host keeps: {}", host.display_name()),
                None => println!(
                    "{} No other GPU with a working driver would remain for the host",
                    "⚠".yellow().bold()
                ),
            }
        }
        Err(e) if e.is_user_aborted() => {
            println!("Several GPUs match vendor {}; setup will ask which one to use", config.preferred_vendor)
        }
        Err(e) => println!("{} {}", "⚠".yellow().bold(), e),
    }

    Ok(())
}

/// Truncate string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
