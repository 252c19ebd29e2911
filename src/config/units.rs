// Parsing of human-friendly values found in process configuration files

use crate::error::{ConfigError, ConfigErrorKind};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

/// Default timestamp pattern for captured log lines
pub const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DD HH:mm:ss Z";

/// Memory limit as written in a config file: a byte count or a suffixed string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(i64),
    Text(String),
}

impl MemoryLimit {
    /// Resolve the limit to a positive number of bytes
    pub fn to_bytes(&self) -> Result<u64, ConfigError> {
        match self {
            MemoryLimit::Bytes(n) if *n > 0 => Ok(*n as u64),
            MemoryLimit::Bytes(n) => Err(ConfigError::new(
                ConfigErrorKind::InvalidMemoryLimit,
                format!("memory limit must be positive, got {}", n),
            )),
            MemoryLimit::Text(s) => parse_memory(s),
        }
    }
}

/// Parse strings such as `"1G"`, `"512M"`, `"300K"`, `"2gb"` or `"1048576"`
pub fn parse_memory(input: &str) -> Result<u64, ConfigError> {
    let invalid = || {
        ConfigError::new(
            ConfigErrorKind::InvalidMemoryLimit,
            format!("cannot parse memory limit '{}'", input),
        )
    };

    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();
    let without_b = match upper.strip_suffix('B') {
        Some(rest) if rest.ends_with(['K', 'M', 'G']) => rest,
        _ => upper.as_str(),
    };

    let (digits, multiplier) = match without_b.chars().last() {
        Some('K') => (&without_b[..without_b.len() - 1], 1024u64),
        Some('M') => (&without_b[..without_b.len() - 1], 1024 * 1024),
        Some('G') => (&without_b[..without_b.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (without_b, 1),
        _ => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes == 0 {
        return Err(ConfigError::new(
            ConfigErrorKind::InvalidMemoryLimit,
            "memory limit must be positive",
        ));
    }
    Ok(bytes)
}

// Longest tokens first so that `YYYY` wins over `YY`.
const MOMENT_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("SSS", "%3f"),
    ("A", "%p"),
    ("a", "%P"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
];

/// Translate a moment-style pattern (`YYYY-MM-DD HH:mm:ss Z`) to strftime.
///
/// Text inside `[...]` is copied literally, as are characters that are not
/// tokens. A pattern that already contains `%` is assumed to be strftime.
pub fn to_strftime(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }

    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;

    'outer: while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            if let Some(end) = stripped.find(']') {
                out.push_str(&stripped[..end]);
                rest = &stripped[end + 1..];
                continue;
            }
        }

        for (token, replacement) in MOMENT_TOKENS {
            if let Some(stripped) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = stripped;
                continue 'outer;
            }
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }

    out
}

/// Translate and validate a date format, returning the strftime form
pub fn resolve_date_format(pattern: &str) -> Result<String, ConfigError> {
    if pattern.trim().is_empty() {
        return Err(ConfigError::new(
            ConfigErrorKind::InvalidDateFormat,
            "date format must not be empty when timestamps are enabled",
        ));
    }

    let strftime = to_strftime(pattern);
    if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::new(
            ConfigErrorKind::InvalidDateFormat,
            format!("unsupported date format '{}'", pattern),
        ));
    }
    Ok(strftime)
}
