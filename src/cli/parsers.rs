//! Shared CLI argument parsers.

use clap::ValueEnum;
use std::time::Duration;
use vmorch_protocol::StorageLocation;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a size with an optional binary suffix (e.g., "512M", "10G", "4096").
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'K' | 'k')) => (&s[..i], 10),
        Some((i, 'M' | 'm')) => (&s[..i], 20),
        Some((i, 'G' | 'g')) => (&s[..i], 30),
        Some((i, 'T' | 't')) => (&s[..i], 40),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {}", s))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size too large: {}", s))
}

/// Storage location argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LocationArg {
    /// The user's files.
    MyFiles,
    /// The downloads folder.
    Downloads,
    /// Removable media.
    Removable,
}

impl From<LocationArg> for StorageLocation {
    fn from(arg: LocationArg) -> Self {
        match arg {
            LocationArg::MyFiles => StorageLocation::MyFiles,
            LocationArg::Downloads => StorageLocation::Downloads,
            LocationArg::Removable => StorageLocation::Removable,
        }
    }
}
