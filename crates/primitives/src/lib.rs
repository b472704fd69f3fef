//! Wire encoding, hashing and the raw header/transaction layouts.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod hex;
pub mod outpoint;
pub mod transaction;

pub use address::{decode_address, encode_address, validate_address, AddressError, AddressKind};
pub use block::{BlockHeader, HEADER_SIZE};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{hash160, sha256, sha256d, sha256d_hex};
pub use hex::{bytes_to_hex, hash256_from_hex, hash256_to_hex, hex_to_bytes, HexError};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
