//! ==============================================================================
//! format.rs - display helpers for the fleet view
//! ==============================================================================
//!
//! hashrates, device uptimes, time since last update, share counters.
//!
//! ==============================================================================

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::FormatError;

const UNITS: [&str; 9] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s", "ZH/s", "YH/s"];
const MULTIPLIERS: [f64; 9] = [1.0, 1e3, 1e6, 1e9, 1e12, 1e15, 1e18, 1e21, 1e24];

fn hashrate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([\d.]+)\s*([KMGTPEZY]?[Hh]?[/s]+)$").expect("valid hashrate regex"))
}

fn uptime_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+d \d{2}:\d{2}:\d{2})\s+(\d+d \d{2}:\d{2}:\d{2})").expect("valid uptime regex")
    })
}

/// "2.5GH/s" -> 2.5e9 hashes per second
pub fn parse_hashrate(text: &str) -> Result<f64, FormatError> {
    let caps = hashrate_pattern()
        .captures(text)
        .ok_or_else(|| FormatError::InvalidHashrate(text.to_string()))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| FormatError::InvalidHashrate(text.to_string()))?;
    let unit = caps[2].to_uppercase();

    let multiplier = UNITS
        .iter()
        .position(|u| u.to_uppercase() == unit)
        .map(|i| MULTIPLIERS[i])
        .ok_or(FormatError::InvalidUnit(unit))?;

    Ok(value * multiplier)
}

/// 2.5e9 -> "2.50GH/s"
pub fn format_hashrate(hashes_per_second: f64) -> String {
    let mut value = hashes_per_second;
    let mut index = 0;
    while value >= 1000.0 && index < UNITS.len() - 1 {
        value /= 1000.0;
        index += 1;
    }
    format!("{value:.2}{}", UNITS[index])
}

/// devices report uptime as two "Nd HH:MM:SS" blocks; split them
pub fn split_time_string(text: &str) -> Result<(String, String), FormatError> {
    let caps = uptime_pair_pattern()
        .captures(text.trim())
        .ok_or_else(|| FormatError::InvalidTime(text.to_string()))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// "002d 03:04:05" -> "2d 3h4m"
///
/// seconds are dropped unless hours and minutes are both zero, or
/// `strip_secs` is false.
pub fn compact_uptime(text: &str, strip_secs: bool) -> Result<String, FormatError> {
    let invalid = || FormatError::InvalidTime(text.to_string());

    let (days, clock) = text.trim().split_once(' ').ok_or_else(invalid)?;
    let days = days.strip_suffix('d').ok_or_else(invalid)?;
    if !days.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let days = days.trim_start_matches('0');

    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid())?;
    let [hours, minutes, seconds] = parts[..] else {
        return Err(invalid());
    };

    let mut strip_secs = strip_secs;
    let mut compact = if hours > 0 {
        format!("{hours}h{minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        strip_secs = false;
        String::new()
    };

    if !days.is_empty() {
        compact = format!("{days}d {compact}");
    }
    if !strip_secs {
        compact.push_str(&format!("{seconds}s"));
    }
    Ok(compact)
}

/// device uptime field rendered compactly, falling back to the raw text
pub fn display_uptime(raw: &str) -> String {
    split_time_string(raw)
        .and_then(|(uptime, _)| compact_uptime(&uptime, true))
        .or_else(|_| compact_uptime(raw, true))
        .unwrap_or_else(|_| raw.to_string())
}

/// time between `then` and `now`, compacted ("3m", "1d 2h5m")
pub fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total = (now - then).num_seconds().unsigned_abs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let text = format!("{days}d {hours}:{minutes:02}:{seconds:02}");
    compact_uptime(&text, true).unwrap_or(text)
}

/// "1/200/0.5%" -> "1/200 (0.5%)"
pub fn format_share(share: &str) -> String {
    match share.split('/').collect::<Vec<_>>()[..] {
        [rejected, accepted, percentage] => format!("{rejected}/{accepted} ({percentage})"),
        _ => share.to_string(),
    }
}
