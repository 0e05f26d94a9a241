//! ASERT difficulty: per-block exponential retargeting from an anchor.
//!
//! next_target = clamp(anchor_target * 2^((dt - spacing*(dh+1)) / half_life), 1, pow_limit)
//!
//! The exponent is evaluated in 2^16 fixed point: the integer part becomes
//! a shift, the fractional part a cubic polynomial approximation of 2^x.

use crate::consensus::params::ChainParams;
use crate::errors::PowError;
use crate::primitives::uint256::{compact_to_target, target_to_compact};
use crate::primitives::U256;

/// The difficulty anchor: the chain's block at height 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsertAnchor {
    pub height: i64,
    pub bits: u32,
    pub time: i64,
}

/// Expected compact bits for a header at `eval_height` carrying
/// `eval_time`, relative to the anchor.
///
/// Reproducibility: the result depends only on
/// (anchor, eval_time, eval_height) and the network constants.
pub fn next_bits_asert(
    anchor: &AsertAnchor,
    eval_height: i64,
    eval_time: i64,
    params: &ChainParams,
) -> Result<u32, PowError> {
    let anchor_target = compact_to_target(anchor.bits)?;

    let time_diff = eval_time - anchor.time;
    let height_diff = eval_height - anchor.height;

    // 2^16 fixed-point exponent; i64 is ample (|time_diff| < 2^33).
    let exponent =
        ((time_diff - params.target_spacing_secs * (height_diff + 1)) * 65536)
            / params.asert_half_life_secs;

    // arithmetic shift floors toward -inf, leaving frac in [0, 65536)
    let shifts = exponent >> 16;
    let frac = (exponent - (shifts << 16)) as u64;
    debug_assert!(frac < 65536);

    // factor = 65536 * 2^(frac/65536), cubic approximation
    let factor: u64 = 65536
        + ((195_766_423_245_049u64 * frac
            + 971_821_376u64 * frac * frac
            + 5127u64 * frac * frac * frac
            + (1u64 << 47))
            >> 48);

    let (scaled, carry) = anchor_target.mul_u64(factor);
    let next = apply_shift(scaled, carry, shifts - 16, &params.pow_limit);

    let next = if next > params.pow_limit {
        params.pow_limit
    } else if next.is_zero() {
        U256::ONE
    } else {
        next
    };
    Ok(target_to_compact(&next))
}

/// Shift a 256-bit value with a 64-bit overflow limb by `net` bits
/// (positive = left). Saturates to pow_limit when bits would overflow.
fn apply_shift(value: U256, carry: u64, net: i64, pow_limit: &U256) -> U256 {
    if net >= 0 {
        if carry != 0 {
            return *pow_limit;
        }
        match value.checked_shl(net.min(256) as u32) {
            Some(v) => v,
            None => *pow_limit,
        }
    } else {
        let rs = (-net).min(320) as u32;
        let mut out = value.shr(rs);
        if carry != 0 {
            // carry contributes carry * 2^(256 - rs)
            if rs > 256 {
                let cv = U256::from_u64(carry).shr(rs - 256);
                out = out.saturating_add(&cv);
            } else {
                match U256::from_u64(carry).checked_shl(256 - rs) {
                    Some(cv) => out = out.saturating_add(&cv),
                    None => return *pow_limit,
                }
            }
        }
        out
    }
}
