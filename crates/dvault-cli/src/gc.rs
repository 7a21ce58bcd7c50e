//! # Garbage Collection
//!
//! Explicit reclaim on the daemon plus the byte/number formatting shared
//! by the reporting commands.

use anyhow::Result;
use dvault_ipc::client::DaemonClient;
use dvault_manifest::{GcReport, StoreStatus};

pub async fn run(client: &mut DaemonClient) -> Result<()> {
    let before = client.status().await?;
    let report = client.gc().await?;
    let after = client.status().await?;

    println!();
    println!("  dvault Garbage Collection");
    println!("  =========================");
    print_report(&report);
    println!();
    println!(
        "  Available: {} -> {}",
        format_bytes(before.available_bytes),
        format_bytes(after.available_bytes)
    );
    println!();
    Ok(())
}

fn print_report(report: &GcReport) {
    println!();
    if report.versions_removed == 0 && report.blocks_freed == 0 {
        println!("  Nothing to reclaim.");
        return;
    }
    println!("    Versions removed:  {}", format_number(report.versions_removed));
    println!("    Scripts cascaded:  {}", format_number(report.scripts_cascaded));
    println!(
        "    Blocks freed:      {} ({})",
        format_number(report.blocks_freed),
        format_bytes(report.bytes_freed)
    );
}

pub fn print_status(status: &StoreStatus) {
    println!();
    println!("  dvault Store Status");
    println!("  ===================");
    println!();
    println!("    Reserved:   {}", format_bytes(status.reserved_capacity));
    println!("    Used:       {}", format_bytes(status.used_bytes));
    println!("    Available:  {}", format_bytes(status.available_bytes));
    if status.reserved_capacity > 0 {
        let pct = (status.used_bytes as f64 / status.reserved_capacity as f64) * 100.0;
        println!("    Fill:       {:.1}%", pct);
    }
    println!();
    println!("    Files:        {}", format_number(status.file_count));
    println!("    Directories:  {}", format_number(status.directory_count));
    println!(
        "    Versions:     {} ({} as scripts)",
        format_number(status.version_count),
        format_number(status.script_count)
    );
    println!(
        "    Blocks:       {} ({} orphaned)",
        format_number(status.block_count),
        format_number(status.orphan_blocks)
    );
    if status.open_uploads > 0 {
        println!("    Uploads:      {} in progress", status.open_uploads);
    }
    println!();
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.00 GB");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }
}
