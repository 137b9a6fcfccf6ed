//! Timestamp helpers shared by the progress record, backups and the lock file.

use chrono::{DateTime, Local, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

/// Layout of backup suffixes and backup set ids (second resolution)
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current local time as `YYYYmmdd_HHMMSS`
pub fn stamp_now() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

/// Human readable rendering of a unix timestamp in local time
pub fn display_unix(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Local.timestamp_opt(s, 0).single())
        .map(|dt: DateTime<Local>| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// True if `s` looks like a stamp produced by [`stamp_now`], optionally
/// followed by a `-N` collision suffix
pub fn is_stamp(s: &str) -> bool {
    let base = match s.split_once('-') {
        Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
        Some(_) => return false,
        None => s,
    };
    let bytes = base.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}
