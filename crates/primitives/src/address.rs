//! Base58Check addresses.

use exploder_consensus::ChainParams;

use crate::hash::sha256d;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid address length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "invalid address checksum"),
            AddressError::UnknownPrefix => write!(f, "address version does not match network"),
        }
    }
}

impl std::error::Error for AddressError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressKind {
    PubKeyHash,
    ScriptHash,
}

/// Base58Check of `version || payload`.
pub fn encode_address(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(version);
    data.extend_from_slice(payload);
    base58check_encode(&data)
}

pub fn decode_address(address: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let payload = base58check_decode(address)?;
    let Some((version, hash)) = payload.split_first() else {
        return Err(AddressError::InvalidLength);
    };
    if hash.len() != 20 {
        return Err(AddressError::InvalidLength);
    }
    Ok((*version, hash.to_vec()))
}

/// Checks that `address` is well formed and belongs to the configured network.
pub fn validate_address(address: &str, params: &ChainParams) -> Result<AddressKind, AddressError> {
    let (version, _) = decode_address(address)?;
    if version == params.pubkey_hash_version {
        Ok(AddressKind::PubKeyHash)
    } else if version == params.script_hash_version {
        Ok(AddressKind::ScriptHash)
    } else {
        Err(AddressError::UnknownPrefix)
    }
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[0xa9, 0x14]);
    script.extend_from_slice(hash);
    script.push(0x87);
    script
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    let checksum = sha256d(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

pub fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = base58_decode(input)?;
    if bytes.len() < 4 {
        return Err(AddressError::InvalidLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    let digest = sha256d(payload);
    if checksum != &digest[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    let mut bytes: Vec<u8> = Vec::new();
    for ch in input.bytes() {
        let mut carry = u32::from(base58_value(ch).ok_or(AddressError::InvalidCharacter)?);
        for byte in bytes.iter_mut().rev() {
            let value = u32::from(*byte) * 58 + carry;
            *byte = (value & 0xff) as u8;
            carry = value >> 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let leading_zeros = input.bytes().take_while(|b| *b == b'1').count();
    let mut out = vec![0u8; leading_zeros];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn base58_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut digits = vec![0u8];
    for byte in data {
        let mut carry = u32::from(*byte);
        for digit in digits.iter_mut().rev() {
            let value = u32::from(*digit) * 256 + carry;
            *digit = (value % 58) as u8;
            carry = value / 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0u8).count();
    // An all-zero input leaves a single zero digit that the '1' prefix already covers.
    let skip = usize::from(digits.len() == 1 && digits[0] == 0);
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for digit in digits.into_iter().skip(skip) {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_value(byte: u8) -> Option<u8> {
    ALPHABET
        .iter()
        .position(|value| *value == byte)
        .map(|pos| pos as u8)
}
