use prettytable::{Cell, Row, Table};

use crate::storage::BackupRecord;
use crate::utils::time::fmt_utc;

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Numbered listing used by the restore picker.
pub fn print_backups(records: &[BackupRecord]) {
    if records.is_empty() {
        tracing::info!("<no backups found>");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("#"),
        Cell::new("Tier"),
        Cell::new("Backup"),
        Cell::new("Host"),
        Cell::new("Size"),
        Cell::new("Created (UTC)"),
        Cell::new("Codec"),
    ]));
    for (i, r) in records.iter().enumerate() {
        // archives copied between tiers keep their name-embedded time even
        // when the filesystem mtime was not preserved
        let shown_time = match &r.parsed {
            Some(p) if r.mtime == 0 => p.timestamp,
            _ => r.mtime,
        };
        let when = fmt_utc(shown_time).unwrap_or_else(|_| shown_time.to_string());
        let host = match &r.parsed {
            Some(p) => format!("{} ({})", p.hostname, p.proxmox_type.wire_name()),
            None => "-".to_string(),
        };
        let mut codec = r
            .manifest
            .as_ref()
            .map(|m| m.compression_type.as_str())
            .unwrap_or("-")
            .to_string();
        if r.parsed.as_ref().is_some_and(|p| p.encrypted) {
            codec.push_str(" +age");
        }
        table.add_row(Row::new(vec![
            Cell::new(&(i + 1).to_string()),
            Cell::new(r.tier),
            Cell::new(r.file_name()),
            Cell::new(&host),
            Cell::new(&human_size(r.size)),
            Cell::new(&when),
            Cell::new(&codec),
        ]));
    }
    table.printstd();
}

/// Categories found in an archive, with selection markers.
pub fn print_categories(present: &[String], selected: Option<&std::collections::HashSet<String>>) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Category"),
        Cell::new("Description"),
        Cell::new("Selected"),
    ]));
    for id in present {
        let label = crate::commands::restore::categories::by_id(id)
            .map(|c| c.label)
            .unwrap_or("-");
        let mark = match selected {
            Some(set) if set.contains(id) => "yes",
            Some(_) => "",
            None => "-",
        };
        table.add_row(Row::new(vec![
            Cell::new(id),
            Cell::new(label),
            Cell::new(mark),
        ]));
    }
    table.printstd();
}
