//! # Hex Encoding/Decoding Utilities
//!
//! Hex conversion helpers used throughout the telegram pipeline. Two decode
//! flavours exist: the strict one for wire data and keys, and a lenient one
//! for telegrams pasted from logs, which may contain `#`, `|`, `_` and
//! whitespace as cosmetic separators.

use thiserror::Error;

/// Errors that can occur during hex operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("Invalid hex character: {0}")]
    InvalidCharacter(char),

    #[error("Odd number of hex characters: {0}")]
    OddLength(usize),
}

/// Encode bytes to lowercase hex.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Encode bytes to uppercase hex. DIF/VIF keys use this form.
pub fn encode_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Decode a hex string containing only hex digits.
///
/// Rejects odd-length input and any non-hex character.
pub fn decode_hex_strict(s: &str) -> Result<Vec<u8>, HexError> {
    if s.len() % 2 != 0 {
        return Err(HexError::OddLength(s.len()));
    }
    hex::decode(s).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, .. } => HexError::InvalidCharacter(c),
        hex::FromHexError::OddLength => HexError::OddLength(s.len()),
        hex::FromHexError::InvalidStringLength => HexError::OddLength(s.len()),
    })
}

/// Decode a hex string, ignoring `#`, `|`, `_` and whitespace.
///
/// This is the format telegrams are logged in, where `|` and `_` mark
/// logical frame boundaries.
pub fn decode_hex_flex(s: &str) -> Result<Vec<u8>, HexError> {
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '#' | '|' | '_') && !c.is_whitespace())
        .collect();
    decode_hex_strict(&cleaned)
}

/// True if the string contains only hex digits.
pub fn is_hex_string_strict(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Reverse a BCD hex string pairwise: `102030405060` becomes `605040302010`.
pub fn reverse_bcd(s: &str) -> String {
    if s.len() % 2 != 0 {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    for i in (0..s.len()).step_by(2).rev() {
        out.push(bytes[i] as char);
        out.push(bytes[i + 1] as char);
    }
    out
}

/// Heuristic: does this hex string encode printable ascii?
///
/// Trailing NUL bytes are accepted since some meters pad id strings.
pub fn is_likely_ascii(s: &str) -> bool {
    let Ok(bytes) = decode_hex_strict(s) else {
        return false;
    };
    let mut seen_text_end = false;
    for b in bytes {
        if b == 0 {
            seen_text_end = true;
            continue;
        }
        if seen_text_end || !(0x20..=0x7e).contains(&b) {
            return false;
        }
    }
    true
}

/// Reverse a hex string byte-wise and decode it as ascii, dropping
/// non-printable characters. A 32-bit enhanced id `44434241` turns into
/// `ABCD`.
pub fn reverse_binary_ascii_safe_to_string(s: &str) -> String {
    let Ok(bytes) = decode_hex_strict(s) else {
        return s.to_string();
    };
    bytes
        .iter()
        .rev()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|b| *b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = [0x68u8, 0x31, 0x31, 0x68, 0x00, 0xff];
        assert_eq!(decode_hex_strict(&encode_hex(&data)).unwrap(), data);
    }

    #[test]
    fn test_strict_rejects() {
        assert_eq!(decode_hex_strict("abc"), Err(HexError::OddLength(3)));
        assert_eq!(
            decode_hex_strict("zz"),
            Err(HexError::InvalidCharacter('z'))
        );
    }

    #[test]
    fn test_flex_ignores_separators() {
        assert_eq!(
            decode_hex_flex("2E 44|2D2C_67#67").unwrap(),
            vec![0x2e, 0x44, 0x2d, 0x2c, 0x67, 0x67]
        );
    }

    #[test]
    fn test_reverse_bcd() {
        assert_eq!(reverse_bcd("102030405060"), "605040302010");
        assert_eq!(reverse_bcd("74140000"), "00001474");
    }

    #[test]
    fn test_ascii_reversal() {
        assert!(is_likely_ascii("44434241"));
        assert_eq!(reverse_binary_ascii_safe_to_string("44434241"), "ABCD");
        assert!(!is_likely_ascii("01029f"));
    }
}
