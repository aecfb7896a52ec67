//! Storage name derivation.
//!
//! A storage name is `<token>-<sanitized display name>`. The token is made of
//! decimal digits only, so the first `-` in a storage name always terminates the
//! token and the display name is recovered exactly even when it contains `-`
//! itself.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Character separating the token from the display name.
pub const SEPARATOR: char = '-';

/// Substituted when sanitization leaves nothing usable.
pub const PLACEHOLDER_NAME: &str = "file";

/// Longest sanitized display name kept in a storage name, in bytes.
const MAX_NAME_BYTES: usize = 200;

/// Longest extension preserved when a long name is shortened.
const MAX_EXTENSION_BYTES: usize = 16;

/// Characters that are unsafe in file names on at least one common platform.
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Generates collision-free storage names.
///
/// Tokens are microsecond timestamps forced to be strictly increasing, so two
/// names produced by the same policy never share a token even when uploads land
/// within the same clock tick.
#[derive(Debug, Default)]
pub struct NamingPolicy {
    last_token: AtomicI64,
}

impl NamingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a fresh storage name for a client-supplied display name.
    pub fn storage_name_for(&self, display_name: &str) -> String {
        let token = self.next_token();
        format!("{}{}{}", token, SEPARATOR, sanitize(display_name))
    }

    fn next_token(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_token
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

/// Make a client-supplied name safe to use as a file name.
///
/// Path separators, reserved characters, and control characters become `_`.
/// Surrounding whitespace and trailing dots are dropped, and overly long names
/// are shortened while keeping their extension. Names that end up empty (or
/// consist only of dots) are replaced by [`PLACEHOLDER_NAME`].
pub fn sanitize(display_name: &str) -> String {
    let replaced: String = display_name
        .chars()
        .map(|c| {
            if c.is_control() || RESERVED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return PLACEHOLDER_NAME.to_string();
    }

    shorten(trimmed)
}

fn shorten(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES => name.split_at(dot),
        _ => (name, ""),
    };

    let mut cut = MAX_NAME_BYTES - extension.len();
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stem[..cut], extension)
}

/// Split a storage name into its token and display name.
///
/// Returns `None` for names that were not produced by a [`NamingPolicy`]
/// (no separator, or a prefix that is not all digits).
pub fn split_storage_name(storage_name: &str) -> Option<(&str, &str)> {
    let (token, display) = storage_name.split_once(SEPARATOR)?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) || display.is_empty() {
        return None;
    }
    Some((token, display))
}

/// Recover the display name encoded in a storage name.
///
/// Files placed in the store by other means keep their own name.
pub fn display_name_of(storage_name: &str) -> &str {
    split_storage_name(storage_name)
        .map(|(_, display)| display)
        .unwrap_or(storage_name)
}

/// Whether `name` can refer to a stored file at all.
///
/// Rejects anything that could escape the store directory or address the
/// hidden staging area.
pub fn is_valid_storage_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && name != ".."
}
