//! Compact ("nBits") encoding of 256-bit proof-of-work targets.
//!
//! The compact form packs a base-256 float into 32 bits: the high byte is the
//! size in bytes, bit 23 is the sign, and the low 23 bits are the mantissa.

use primitive_types::U256;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// A decoded compact target. `negative` and `overflow` are reported next to
/// the magnitude so callers can reject them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub value: U256,
    pub negative: bool,
    pub overflow: bool,
}

impl CompactTarget {
    pub fn is_usable(&self) -> bool {
        !self.negative && !self.overflow && !self.value.is_zero()
    }
}

pub fn decode_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let word = bits & MANTISSA_MASK;

    let value = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        let shift = 8 * (size - 3);
        if shift >= 256 {
            U256::zero()
        } else {
            U256::from(word) << shift as usize
        }
    };

    let negative = word != 0 && (bits & SIGN_BIT) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

    CompactTarget {
        value,
        negative,
        overflow,
    }
}

pub fn encode_compact(value: U256) -> u32 {
    let mut size = (value.bits() as u32 + 7) / 8;
    let mut compact = if size <= 3 {
        (value.low_u64() << (8 * (3 - size))) as u32
    } else {
        (value >> (8 * (size - 3)) as usize).low_u64() as u32
    };

    // The sign bit is not part of the magnitude; move up one byte instead.
    if compact & SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Work represented by a target: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    let target = decode_compact(bits);
    if !target.is_usable() {
        return U256::zero();
    }
    // 2^256 / (t + 1) == (~t / (t + 1)) + 1 without needing 257 bits.
    (!target.value / (target.value + U256::one())) + U256::one()
}
