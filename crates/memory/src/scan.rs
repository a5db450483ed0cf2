//! Byte-pattern scanning
//!
//! Patterns are raw byte strings in which [`WILDCARD`] (`0x2A`, `'*'`)
//! matches any byte. Gamedata files may also carry the text form
//! `"55 48 ? 89 ??"`, which [`parse_pattern`] converts to raw bytes.

use crate::error::ResolveError;

/// Byte that matches anything in a pattern
pub const WILDCARD: u8 = 0x2A;

/// Parse a text pattern into raw pattern bytes
///
/// Supports:
/// - Hex bytes: "55 48 89 E5"
/// - Wildcards: "55 ? 89 E5" or "55 ?? 89 E5"
/// - Escaped strings: "\x55\x2A\x89"
pub fn parse_pattern(text: &str) -> Result<Vec<u8>, ResolveError> {
    let text = text.trim();
    if text.starts_with("\\x") {
        return parse_escaped(text);
    }

    let mut result = Vec::new();
    for part in text.split_whitespace() {
        if part == "?" || part == "??" {
            result.push(WILDCARD);
        } else {
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| ResolveError::InvalidSignature(format!("Invalid hex byte: {}", part)))?;
            result.push(byte);
        }
    }

    if result.is_empty() {
        return Err(ResolveError::InvalidSignature(
            "Empty signature pattern".to_string(),
        ));
    }

    Ok(result)
}

fn parse_escaped(text: &str) -> Result<Vec<u8>, ResolveError> {
    let result = text
        .split("\\x")
        .filter(|part| !part.is_empty())
        .map(|part| {
            u8::from_str_radix(part, 16)
                .map_err(|_| ResolveError::InvalidSignature(format!("Invalid hex byte: {}", part)))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    if result.is_empty() {
        return Err(ResolveError::InvalidSignature(
            "Empty signature pattern".to_string(),
        ));
    }
    Ok(result)
}

/// Render pattern bytes as text, wildcards shown as `?`
pub fn format_pattern(pattern: &[u8]) -> String {
    pattern
        .iter()
        .map(|b| {
            if *b == WILDCARD {
                "?".to_string()
            } else {
                format!("{:02X}", b)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Check whether `pattern` matches `data` starting at its first byte
#[inline]
pub fn matches_at(data: &[u8], pattern: &[u8]) -> bool {
    data.len() >= pattern.len()
        && pattern
            .iter()
            .zip(data)
            .all(|(expected, actual)| *expected == WILDCARD || expected == actual)
}

/// Offset of the first match of `pattern` inside `data`
pub fn find_in_slice(data: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || data.len() < pattern.len() {
        return None;
    }
    (0..=data.len() - pattern.len()).find(|&offset| matches_at(&data[offset..], pattern))
}

/// Scan raw memory for a pattern
///
/// Returns the address of the first match.
///
/// # Safety
/// `[start, start + size)` must be valid and readable.
pub unsafe fn scan(start: *const u8, size: usize, pattern: &[u8]) -> Option<*const u8> {
    if start.is_null() || size == 0 {
        return None;
    }
    let data = std::slice::from_raw_parts(start, size);
    find_in_slice(data, pattern).map(|offset| start.add(offset))
}
