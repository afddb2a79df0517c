use chrono::{DateTime, Utc};

/// Whole seconds from `from` to `to`, clamped at zero so clock skew never
/// yields a negative outage.
pub fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{elapsed_seconds, format_duration};

    #[test]
    fn formats_compound_durations() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(3_600), "1h");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
        assert_eq!(format_duration(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn elapsed_never_goes_negative() {
        let earlier = Utc.with_ymd_and_hms(2026, 2, 20, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 2, 20, 10, 1, 30).unwrap();

        assert_eq!(elapsed_seconds(earlier, later), 90);
        assert_eq!(elapsed_seconds(later, earlier), 0);
    }
}
