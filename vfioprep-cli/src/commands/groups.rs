//! `vfioprep groups` command

use super::{capture, or_dash};
use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use vfioprep_core::Config;

#[derive(Tabled)]
struct MemberRow {
    #[tabled(rename = "GROUP")]
    group: u32,
    #[tabled(rename = "PCI ADDRESS")]
    address: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "IDS")]
    ids: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
}

/// List isolation groups and their members.
pub fn groups(config: &Config) -> Result<()> {
    let snapshot = capture(config)?;

    let Some(map) = &snapshot.isolation else {
        println!("{} No IOMMU groups found: the IOMMU is not active.", "⚠".yellow().bold());
        println!("Enable VT-d / AMD-Vi in firmware, then add intel_iommu=on or amd_iommu=on");
        println!("to the kernel command line (`vfioprep setup` does this) and reboot.");
        return Ok(());
    };

    let mut rows = Vec::new();
    for group in map.groups() {
        for address in &group.members {
            let row = match snapshot.devices.get(address) {
                Some(d) => MemberRow {
                    group: group.id,
                    address: address.to_string(),
                    class: d.class.to_string(),
                    ids: d.id().to_string(),
                    description: d.description.clone(),
                    driver: or_dash(d.driver.as_deref()),
                },
                None => MemberRow {
                    group: group.id,
                    address: address.to_string(),
                    class: "-".to_string(),
                    ids: "-".to_string(),
                    description: "(not reported by enumeration)".to_string(),
                    driver: "-".to_string(),
                },
            };
            rows.push(row);
        }
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    println!();
    println!("Total: {} group(s)", map.len());

    Ok(())
}
