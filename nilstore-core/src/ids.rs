//! Validated identifiers and user input parsing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid deal id {0:?}: expected decimal digits")]
    InvalidDealId(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("invalid file path {0:?}")]
    InvalidPath(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("unknown route preference {0:?}")]
    InvalidPreference(String),

    #[error("file is empty")]
    EmptyFile,
}

/// On-chain deal identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DealId(pub u64);

impl FromStr for DealId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidDealId(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(DealId)
            .map_err(|_| ValidationError::InvalidDealId(s.to_string()))
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode a hex string (optional `0x` prefix) into exactly `N` bytes.
pub fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N], ValidationError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| ValidationError::InvalidHex(e.to_string()))?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ValidationError::WrongLength {
            expected: N,
            actual,
        })
}

/// Reduce a user supplied path to the basename stored in the file table.
pub fn basename(path: &str) -> Result<String, ValidationError> {
    let name = path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deal_id_accepts_digits() {
        assert_eq!("42".parse::<DealId>().unwrap(), DealId(42));
        assert_eq!(" 7 ".parse::<DealId>().unwrap(), DealId(7));
    }

    #[test]
    fn test_deal_id_rejects_non_digits() {
        for bad in ["", "-1", "12a", "0x10", "1.5", "99999999999999999999999"] {
            assert!(bad.parse::<DealId>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_parse_hex_array() {
        let parsed: [u8; 2] = parse_hex_array("0xabcd").unwrap();
        assert_eq!(parsed, [0xab, 0xcd]);
        let parsed: [u8; 2] = parse_hex_array("ABCD").unwrap();
        assert_eq!(parsed, [0xab, 0xcd]);

        assert_eq!(
            parse_hex_array::<4>("0xabcd"),
            Err(ValidationError::WrongLength {
                expected: 4,
                actual: 2
            })
        );
        assert!(matches!(
            parse_hex_array::<1>("zz"),
            Err(ValidationError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/tmp/data/report.pdf").unwrap(), "report.pdf");
        assert_eq!(basename("C:\\files\\a.txt").unwrap(), "a.txt");
        assert_eq!(basename("plain").unwrap(), "plain");
        assert!(basename("dir/").is_err());
        assert!(basename("").is_err());
    }
}
