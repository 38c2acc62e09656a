//! `parseResolutionHeight` (spec §4.6, §9c). Named labels map to a
//! fixed height; numeric forms (`1080`, `1080p`) are parsed with a
//! regex. The threshold comparison is inclusive (`≤`), matching the
//! newer of the two historical variants per spec §9 open question (c).

use std::sync::LazyLock;

use regex::Regex;

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?i)\d+p?$").unwrap());

pub fn parse_resolution_height(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    match trimmed.to_uppercase().as_str() {
        "4K" | "UHD" => return Some(2160),
        "8K" => return Some(4320),
        "FHD" => return Some(1080),
        "HD" => return Some(720),
        "SD" => return Some(480),
        _ => {}
    }

    if NUMERIC.is_match(trimmed) {
        let digits = trimmed.trim_end_matches(['p', 'P']);
        return digits.parse().ok();
    }

    None
}

/// True when `resolution` is known and at or below `max_height` (spec
/// §9c: inclusive).
pub fn is_low_resolution(resolution: Option<&str>, max_height: i32) -> bool {
    resolution
        .and_then(parse_resolution_height)
        .is_some_and(|height| height > 0 && height <= max_height)
}
