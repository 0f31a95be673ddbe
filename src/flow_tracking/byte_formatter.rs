const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Renders a byte count with binary (1024) scaling and at most two decimals, trailing zeros
/// trimmed: `1536` becomes `"1.5 KB"`, `1048576` becomes `"1 MB"`.
pub fn format_bytes(bytes: u64) -> String {
    let mut order = 0;
    let mut size = bytes as f64;

    while size >= 1024.0 && order < UNITS.len() - 1 {
        order += 1;
        size /= 1024.0;
    }

    let rendered = format!("{:.2}", size);
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[order])
}
