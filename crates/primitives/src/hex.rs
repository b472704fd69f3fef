//! Hex helpers. Block hashes and txids are displayed byte-reversed.

use exploder_consensus::Hash256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex character"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, HexError> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return Err(HexError::InvalidLength);
    }
    let raw = input.as_bytes();
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let high = hex_value(pair[0]).ok_or(HexError::InvalidHex)?;
        let low = hex_value(pair[1]).ok_or(HexError::InvalidHex)?;
        out.push((high << 4) | low);
    }
    Ok(out)
}

/// Display form of a wire-order hash (reversed).
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    bytes_to_hex(&reversed)
}

/// Parses a 64-character display hash back into wire order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let bytes = hex_to_bytes(input)?;
    if bytes.len() != 32 {
        return Err(HexError::InvalidLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Ok(hash)
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + value - 10) as char,
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_display_is_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0x6f;
        hash[31] = 0x01;
        let text = hash256_to_hex(&hash);
        assert!(text.starts_with("01"));
        assert!(text.ends_with("6f"));
        assert_eq!(hash256_from_hex(&text).unwrap(), hash);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(hex_to_bytes("abc"), Err(HexError::InvalidLength));
        assert_eq!(hex_to_bytes("zz"), Err(HexError::InvalidHex));
        assert_eq!(hash256_from_hex("00ff"), Err(HexError::InvalidLength));
        assert_eq!(hex_to_bytes("0A0b").unwrap(), vec![0x0a, 0x0b]);
    }
}
