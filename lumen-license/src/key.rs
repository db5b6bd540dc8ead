//! License key syntax checks.
//!
//! Keys are formatted as 3 to 6 dash-separated groups of four characters
//! from `[A-Z0-9]`, e.g. `ABCD-1234-EFGH`. Input is trimmed and uppercased
//! before checking. When checksums are required, the final character of the
//! key is a Luhn mod-36 check character over everything before it.
//!
//! Validation is purely local; it exists so that obviously malformed input
//! never costs a round trip to the authority.

use crate::error::{LicenseError, LicenseResult};

const GROUP_LEN: usize = 4;
const MIN_GROUPS: usize = 3;
const MAX_GROUPS: usize = 6;
const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Shape rules for license keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFormat {
    /// Whether the last character must be a Luhn mod-36 check character.
    pub require_checksum: bool,
}

impl KeyFormat {
    /// Key format with a trailing check character.
    #[must_use]
    pub fn with_checksum() -> Self {
        Self {
            require_checksum: true,
        }
    }
}

/// Validates and normalizes raw license key strings.
#[derive(Debug, Clone, Default)]
pub struct LicenseKeyValidator {
    format: KeyFormat,
}

impl LicenseKeyValidator {
    /// Creates a validator for the given key format.
    #[must_use]
    pub fn new(format: KeyFormat) -> Self {
        Self { format }
    }

    /// Returns the configured key format.
    #[must_use]
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// Validates `raw` and returns the normalized key.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidFormat`] describing the first problem found.
    pub fn validate(&self, raw: &str) -> LicenseResult<String> {
        let key = raw.trim().to_ascii_uppercase();
        if key.is_empty() {
            return Err(LicenseError::InvalidFormat("key is empty".to_string()));
        }

        let groups: Vec<&str> = key.split('-').collect();
        if groups.len() < MIN_GROUPS || groups.len() > MAX_GROUPS {
            return Err(LicenseError::InvalidFormat(format!(
                "expected {MIN_GROUPS} to {MAX_GROUPS} groups, found {}",
                groups.len()
            )));
        }

        for (i, group) in groups.iter().enumerate() {
            if group.len() != GROUP_LEN {
                return Err(LicenseError::InvalidFormat(format!(
                    "group {} must be {GROUP_LEN} characters",
                    i + 1
                )));
            }
            if let Some(c) = group.chars().find(|c| !c.is_ascii_alphanumeric()) {
                return Err(LicenseError::InvalidFormat(format!(
                    "unexpected character {c:?} in group {}",
                    i + 1
                )));
            }
        }

        if self.format.require_checksum {
            let body: String = key.chars().filter(|c| *c != '-').collect();
            let (payload, check) = body.split_at(body.len() - 1);
            let expected = check_char(payload)?;
            if check.chars().next() != Some(expected) {
                return Err(LicenseError::InvalidFormat("checksum mismatch".to_string()));
            }
        }

        Ok(key)
    }
}

/// Computes the Luhn mod-36 check character for `body`.
///
/// Dashes are ignored; any other non-alphanumeric character is an error.
///
/// # Errors
///
/// Returns [`LicenseError::InvalidFormat`] if `body` contains a character
/// outside `[0-9A-Z]` (case-insensitive) and `-`.
pub fn check_char(body: &str) -> LicenseResult<char> {
    let n = ALPHABET.len() as u32;
    let mut factor = 2;
    let mut sum = 0;

    for c in body.chars().rev().filter(|c| *c != '-') {
        let code = code_point(c.to_ascii_uppercase()).ok_or_else(|| {
            LicenseError::InvalidFormat(format!("unexpected character {c:?}"))
        })?;
        let addend = factor * code;
        factor = if factor == 2 { 1 } else { 2 };
        sum += addend / n + addend % n;
    }

    let check = (n - sum % n) % n;
    Ok(ALPHABET[check as usize] as char)
}

fn code_point(c: char) -> Option<u32> {
    ALPHABET.iter().position(|b| *b as char == c).map(|p| p as u32)
}
