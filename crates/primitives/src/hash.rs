use exploder_consensus::Hash256;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;

use crate::hex::{bytes_to_hex, hash256_to_hex};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double SHA-256 as hex, byte-reversed when `reverse` is set (block and tx ids).
pub fn sha256d_hex(data: &[u8], reverse: bool) -> String {
    let digest = sha256d(data);
    if reverse {
        hash256_to_hex(&digest)
    } else {
        bytes_to_hex(&digest)
    }
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = sha256(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(
            sha256d_hex(b"", false),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
        assert_eq!(
            sha256d_hex(b"", true),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn hash160_of_empty_input() {
        assert_eq!(
            bytes_to_hex(&hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }
}
