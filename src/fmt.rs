use chrono::{DateTime, Local, NaiveDate};

use crate::models::parse_timestamp;

/// Format an amount in soles with thousands separators: S/ 1,234.56
pub fn money(val: f64) -> String {
    let negative = val < 0.0;
    let abs = if val.is_finite() { val.abs() } else { 0.0 };
    let cents = format!("{:.2}", abs);
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative && cents != "0.00" {
        format!("-S/ {with_commas}.{dec_part}")
    } else {
        format!("S/ {with_commas}.{dec_part}")
    }
}

/// `dd/mm/yyyy`. Plain `YYYY-MM-DD` dates are shown as-is without any
/// timezone shift; timestamps are converted to local time first.
pub fn date(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "-".to_string();
    };
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.format("%d/%m/%Y").to_string();
    }
    match parse_timestamp(raw) {
        Some(ts) => DateTime::<Local>::from(ts).format("%d/%m/%Y").to_string(),
        None => raw.to_string(),
    }
}

/// `dd/mm/yyyy HH:MM` in local time.
pub fn datetime(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "-".to_string();
    };
    match parse_timestamp(raw) {
        Some(ts) => DateTime::<Local>::from(ts).format("%d/%m/%Y %H:%M").to_string(),
        None => raw.to_string(),
    }
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Shorten to `max` characters, appending `...` when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(1234.56), "S/ 1,234.56");
        assert_eq!(money(-500.00), "-S/ 500.00");
        assert_eq!(money(0.0), "S/ 0.00");
        assert_eq!(money(-0.001), "S/ 0.00");
        assert_eq!(money(1000000.99), "S/ 1,000,000.99");
        assert_eq!(money(42.10), "S/ 42.10");
        assert_eq!(money(f64::NAN), "S/ 0.00");
    }

    #[test]
    fn plain_dates_are_not_shifted() {
        assert_eq!(date(Some("2024-03-01")), "01/03/2024");
        assert_eq!(date(None), "-");
        assert_eq!(date(Some("  ")), "-");
        assert_eq!(date(Some("ayer")), "ayer");
    }

    #[test]
    fn timestamps_are_formatted() {
        assert_eq!(date(Some("2024-03-01T12:00:00Z")), {
            let ts = parse_timestamp("2024-03-01T12:00:00Z").unwrap();
            DateTime::<Local>::from(ts).format("%d/%m/%Y").to_string()
        });
        assert_eq!(datetime(Some("")), "-");
        assert!(datetime(Some("2024-03-01 08:30:00")).contains("2024"));
    }

    #[test]
    fn truncate_appends_ellipsis() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
