use chrono::{DateTime, Duration, NaiveDate, Utc};

// Parse a window bound like "2d", "YYYY-MM-DD", or RFC3339 into a UTC timestamp.
// Relative forms are taken back from `now`. Returns None if unparseable.
pub fn parse_window_str(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // "2d" / "6h" -> now - span
    if let Some(span) = parse_span(s) {
        return Some(now - span);
    }
    // "YYYY-MM-DD"
    if let Some(dt) = parse_date_midnight(s) {
        return Some(dt);
    }
    // RFC3339
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

// Span strings from config and CLI: "30m", "1h", "1d", "2w".
pub fn parse_span(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.len() < 2 { return None; }
    let (num, unit) = s.split_at(s.len() - 1);
    let n = num.parse::<i64>().ok()?;
    if n <= 0 { return None; }
    match unit.to_ascii_lowercase().as_str() {
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        "d" => Some(Duration::days(n)),
        "w" => Some(Duration::weeks(n)),
        _ => None,
    }
}

pub fn format_span(d: Duration) -> String {
    let mins = d.num_minutes();
    if mins % (60 * 24 * 7) == 0 { return format!("{}w", mins / (60 * 24 * 7)); }
    if mins % (60 * 24) == 0 { return format!("{}d", mins / (60 * 24)); }
    if mins % 60 == 0 { return format!("{}h", mins / 60); }
    format!("{}m", mins)
}

pub fn parse_date_midnight(s: &str) -> Option<DateTime<Utc>> {
    let nd = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let dt = nd.and_hms_opt(0, 0, 0)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

// Timestamps as the upstream API wants them: RFC3339 with a trailing Z.
pub fn rfc3339_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn date_only(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}
