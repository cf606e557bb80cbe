//! Path validation applied by every backend before any I/O.
//!
//! The rules: no absolute paths, no parent-directory traversal segments
//! (including URL-encoded forms), no null bytes. Violations fail with
//! [`StoreError::PathTraversal`](crate::StoreError::PathTraversal) and are
//! never retried or caught inside the kernel.

use crate::{Result, StoreError};

/// Validate a backend-relative path.
///
/// Checks the raw string and its percent-decoded form, so `%2e%2e%2f` is
/// rejected exactly like `../`.
pub fn validate_path(path: &str) -> Result<()> {
    let reject = || StoreError::PathTraversal { path: path.to_string() };

    if path.is_empty() {
        return Err(reject());
    }
    for candidate in [path.to_string(), percent_decode(path)] {
        if candidate.contains('\0') {
            return Err(reject());
        }
        if is_absolute(&candidate) {
            return Err(reject());
        }
        if candidate
            .split(['/', '\\'])
            .any(|segment| segment == "..")
        {
            return Err(reject());
        }
    }
    Ok(())
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    // Windows drive prefix, e.g. `C:\` or `c:/`.
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Decode `%XX` escapes; malformed escapes pass through untouched.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Minimal glob matcher used by listing: `*` matches any run of characters,
/// `?` matches exactly one; everything else matches literally.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    fn inner(name: &[char], pattern: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some('*'), _) => {
                inner(name, &pattern[1..])
                    || (!name.is_empty() && inner(&name[1..], pattern))
            }
            (Some('?'), Some(_)) => inner(&name[1..], &pattern[1..]),
            (Some(p), Some(n)) if p == n => inner(&name[1..], &pattern[1..]),
            _ => false,
        }
    }
    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    inner(&name, &pattern)
}
