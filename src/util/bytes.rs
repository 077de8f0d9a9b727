//! Human-readable byte counts for cache usage reports.

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count into IEC units with trailing zeros trimmed.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes} B");
    }

    let precision = if value >= 10.0 { 1 } else { 2 };
    let rendered = format!("{value:.precision$}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered} {}", UNITS[unit])
}

/// `used` against `budget`, e.g. `12.5 MiB of 100 MiB (12.5%)`.
pub fn format_usage(used: u64, budget: u64) -> String {
    let percent = if budget == 0 {
        0.0
    } else {
        used as f64 / budget as f64 * 100.0
    };
    format!(
        "{} of {} ({percent:.1}%)",
        format_bytes(used),
        format_bytes(budget)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100 MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024 + 512 * 1024 * 1024), "5.5 GiB");
    }

    #[test]
    fn usage_reports_share_of_budget() {
        let mib = 1024 * 1024;
        assert_eq!(format_usage(25 * mib, 100 * mib), "25 MiB of 100 MiB (25.0%)");
        assert_eq!(format_usage(0, 0), "0 B of 0 B (0.0%)");
    }
}
