use std::fmt::Write;

use super::PackRecord;

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Human-readable binary size with three decimals, e.g. `1.500 GiB`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.3} {}", UNITS[unit])
}

/// Render the repository README: front matter, then one table row per pack.
///
/// Rows are sorted by filename, newest first. `url_for` maps a pack file name
/// to its public download URL.
pub fn render_readme<F>(records: &[PackRecord], url_for: F) -> String
where
    F: Fn(&str) -> String,
{
    let mut rows: Vec<&PackRecord> = records.iter().collect();
    rows.sort_by(|a, b| b.filename.cmp(&a.filename));

    let mut out = String::from("---\nlicense: other\n---\n\n");
    out.push_str("| Filename | Size | Link |\n");
    out.push_str("|:---------|:-----|:-----|\n");
    for record in rows {
        let _ = writeln!(
            out,
            "| {} | {} | [Download]({}) |",
            record.filename,
            format_size(record.size),
            url_for(&record.filename)
        );
    }
    out
}
