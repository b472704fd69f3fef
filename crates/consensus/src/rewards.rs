//! Block subsidy and cumulative issuance.

use crate::money::Amount;
use crate::params::ChainParams;

pub fn block_subsidy(height: u32, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// Total coins issued by blocks `0..=height`.
pub fn supply_at_height(height: u32, params: &ChainParams) -> Amount {
    let interval = u64::from(params.subsidy_halving_interval);
    let mut remaining = u64::from(height) + 1;
    let mut subsidy = params.initial_subsidy;
    let mut supply: Amount = 0;
    while remaining > 0 && subsidy > 0 {
        let blocks = remaining.min(interval);
        supply = supply.saturating_add(subsidy.saturating_mul(blocks as Amount));
        remaining -= blocks;
        subsidy >>= 1;
    }
    supply
}
