//! Difficulty order resolution
//!
//! Classifies a solved header by the most-global tier whose difficulty target
//! its hash satisfies. A header meeting the Prime target is a Prime block even
//! though it also meets every easier target below it.

use crate::types::{Hash32, Header, Tier, HIERARCHY_DEPTH};
use crate::{Error, Result};
use num_bigint::BigUint;
use std::sync::LazyLock;

static TWO_POW_256: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(1u8) << 256usize);

/// Target for a difficulty, `floor(2^256 / difficulty)`; `None` for zero difficulty
pub fn target_for_difficulty(difficulty: &BigUint) -> Option<BigUint> {
    if *difficulty == BigUint::default() {
        return None;
    }
    Some(&*TWO_POW_256 / difficulty)
}

/// Resolve the order of a hash against per-tier difficulties
pub fn order_for_hash(hash: &Hash32, difficulty: &[BigUint; HIERARCHY_DEPTH]) -> Result<Tier> {
    let blockhash = BigUint::from_bytes_be(hash);
    for tier in Tier::ALL {
        if let Some(target) = target_for_difficulty(&difficulty[tier.index()]) {
            if blockhash <= target {
                return Ok(tier);
            }
        }
    }
    Err(Error::invalid_order("block does not satisfy minimum difficulty"))
}

/// Resolve the order of a solved header
pub fn resolve(header: Option<&Header>) -> Result<Tier> {
    let header = header.ok_or_else(|| Error::invalid_order("no header provided"))?;
    order_for_hash(&header.hash(), &header.difficulty)
}
