//! Network parameters, monetary units and the issuance schedule.

pub mod money;
pub mod params;
pub mod rewards;

pub use money::{amount_from_coins, format_amount, parse_amount, Amount, AmountError, COIN};
pub use params::{chain_params, ChainParams, Network};
pub use rewards::{block_subsidy, supply_at_height};

/// 32-byte hash in wire (little-endian) byte order.
pub type Hash256 = [u8; 32];
