use chrono::{DateTime, Utc};
use colored::Colorize;
use core::fmt;
use once_cell::sync::Lazy;
use regex::Regex;

pub static SUCCESS: Lazy<colored::ColoredString> = Lazy::new(|| "[GOPM]".green());
pub static FAIL: Lazy<colored::ColoredString> = Lazy::new(|| "[GOPM]".red());
pub static WARN: Lazy<colored::ColoredString> = Lazy::new(|| "[GOPM]".yellow());
pub static WARN_STAR: Lazy<colored::ColoredString> = Lazy::new(|| "*".yellow());

#[derive(Clone, Debug)]
pub struct ColoredString(pub colored::ColoredString);

impl serde::Serialize for ColoredString {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let re = Regex::new(r"\x1B\[([0-9;]+)m").unwrap();
        let colored_string = &self.0;
        let stripped_string = re.replace_all(colored_string, "").to_string();
        serializer.serialize_str(&stripped_string)
    }
}

impl From<colored::ColoredString> for ColoredString {
    fn from(cs: colored::ColoredString) -> Self {
        ColoredString(cs)
    }
}

impl fmt::Display for ColoredString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-readable age of a timestamp, e.g. "3d", "2h", "5m", "10s".
pub fn format_duration(datetime: DateTime<Utc>) -> String {
    let current_time = Utc::now();
    let duration = current_time.signed_duration_since(datetime);
    format_duration_ms(duration.num_milliseconds().max(0) as u64)
}

/// Human-readable rendering of a millisecond duration, e.g. "1h30m".
pub fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m{secs}s")
    } else {
        format!("{secs}s")
    }
}

pub fn format_memory(bytes: u64) -> String {
    const UNIT: f64 = 1024.0;
    const SUFFIX: [&str; 4] = ["b", "kb", "mb", "gb"];

    let size = bytes as f64;
    let base = size.log10() / UNIT.log10();

    if size <= 0.0 {
        return "0b".to_string();
    }

    let mut buffer = ryu::Buffer::new();
    let result = buffer
        .format((UNIT.powf(base - base.floor()) * 10.0).round() / 10.0)
        .trim_end_matches(".0");

    [result, SUFFIX[base.floor() as usize]].join("")
}

/// Parse memory string like "100M", "1G", "500K" to bytes (binary units, case-insensitive).
pub fn parse_memory(mem_str: &str) -> Result<u64, String> {
    let mem_str = mem_str.trim().to_uppercase();
    let re = Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?)B?$").unwrap();

    match re.captures(&mem_str) {
        Some(caps) => {
            let num_str = &caps[1];
            let num: f64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number format: {}", num_str))?;
            let unit = caps.get(2).map_or("", |m| m.as_str());

            let multiplier: u64 = match unit {
                "" | "B" => 1,
                "K" => 1024,
                "M" => 1024 * 1024,
                "G" => 1024 * 1024 * 1024,
                "T" => 1024_u64.pow(4),
                _ => return Err(format!("Unknown unit: {}", unit)),
            };

            let result = num * multiplier as f64;
            if result > u64::MAX as f64 || result < 0.0 {
                return Err(format!("Memory value too large: {}{}", num, unit));
            }

            Ok(result as u64)
        }
        None => Err(format!(
            "Invalid memory format: {}. Use format like '100M', '1G', '500K'",
            mem_str
        )),
    }
}

/// Parse duration strings like "500ms", "5s", "1m30s", "2h" into milliseconds.
///
/// New per SPEC_FULL §6 ("Size and duration literals"), written in the same
/// regex-capture idiom as [`parse_memory`] above.
pub fn parse_duration(dur_str: &str) -> Result<u64, String> {
    let dur_str = dur_str.trim();
    if dur_str.is_empty() {
        return Err("Empty duration string".to_string());
    }

    let re = Regex::new(r"(\d+)(ms|s|m|h)").unwrap();
    let mut total_ms: u64 = 0;
    let mut matched_any = false;

    for caps in re.captures_iter(dur_str) {
        matched_any = true;
        let value: u64 = caps[1]
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", &caps[1]))?;

        let unit_ms: u64 = match &caps[2] {
            "ms" => 1,
            "s" => 1000,
            "m" => 60 * 1000,
            "h" => 60 * 60 * 1000,
            unit => return Err(format!("Unknown duration unit: {}", unit)),
        };

        total_ms += value * unit_ms;
    }

    if !matched_any {
        return Err(format!(
            "Invalid duration format: {}. Use format like '500ms', '5s', '1m30s', '2h'",
            dur_str
        ));
    }

    Ok(total_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), 5000);
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1m30s").unwrap(), 90_000);
        assert_eq!(parse_duration("2h").unwrap(), 2 * 60 * 60 * 1000);
        assert_eq!(parse_duration("500ms").unwrap(), 500);
    }

    #[test]
    fn rejects_garbage_duration() {
        assert!(parse_duration("banana").is_err());
    }

    #[test]
    fn parses_memory_suffixes() {
        assert_eq!(parse_memory("1K").unwrap(), 1024);
        assert_eq!(parse_memory("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("100").unwrap(), 100);
    }
}
