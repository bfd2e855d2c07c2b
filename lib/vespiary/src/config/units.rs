// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-size parsing for config values like `limits.memory`.

use crate::{Error, Result};

/// Parses a human byte quantity (`512MiB`, `4GB`, `1073741824`) into
/// bytes. Binary suffixes are powers of 1024, decimal suffixes powers
/// of 1000; a bare number is bytes.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Config("empty size value".to_string()));
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let number: u64 = digits.parse().map_err(|_| {
        Error::Config(format!("invalid size value {value:?}"))
    })?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "MB" => 1000u64.pow(2),
        "GB" => 1000u64.pow(3),
        "TB" => 1000u64.pow(4),
        "KiB" => 1024,
        "MiB" => 1024u64.pow(2),
        "GiB" => 1024u64.pow(3),
        "TiB" => 1024u64.pow(4),
        other => {
            return Err(Error::Config(format!(
                "unknown size suffix {other:?} in {value:?}"
            )))
        }
    };

    number.checked_mul(multiplier).ok_or_else(|| {
        Error::Config(format!("size value {value:?} overflows"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_byte_size("512MiB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("4GB").unwrap(), 4_000_000_000);
        assert_eq!(parse_byte_size("1073741824").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("2TiB").unwrap(), 2u64 << 40);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("MiB").is_err());
        assert!(parse_byte_size("12parsecs").is_err());
    }
}
