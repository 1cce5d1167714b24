//! Human-readable sizes and durations used in responses and file names.

/// Format a byte count with binary units, e.g. `10 MB` or `1.5 GB`.
///
/// Keeps at most two decimals and drops trailing zeros.
pub fn format_bytes(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = size as f64;
    let mut unit = 0;
    while value > 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", round2(value));
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compact recording length used in client file names: `4m5s`, `1h2m3s`.
pub fn format_duration(seconds: u64) -> String {
    let hrs = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hrs > 0 {
        format!("{hrs}h{mins}m{secs}s")
    } else {
        format!("{mins}m{secs}s")
    }
}
