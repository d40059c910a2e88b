//! Limb decomposition and range checks.
//!
//! Digests, curve-point encodings and voting power enter the execution trace
//! as 32-bit limbs and the Groth16 public inputs as 64-bit words over the
//! BW6-761 scalar field.  Every limb is range-checked on the way back out: a
//! wide cell decodes to the same bytes as its low bits plus a carry into
//! the next limb, so an unchecked limb lets two cell vectors name one value.

use thiserror::Error;

use crate::types::Digest;

/// Bits per trace limb.
pub const LIMB_BITS: u32 = 32;
/// Limbs per 32-byte digest in the trace.
pub const DIGEST_LIMBS: usize = 32 * 8 / LIMB_BITS as usize;

/// A limb sequence that does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimbError {
    /// Limb `index` does not fit in the declared width.
    #[error("limb {index} = {value} exceeds {bits} bits")]
    OutOfRange {
        /// Position in the sequence.
        index: usize,
        /// Offending value.
        value: u64,
        /// Declared width.
        bits: u32,
    },
    /// The sequence has the wrong number of limbs.
    #[error("expected {expected} limbs, found {found}")]
    Length {
        /// Required count.
        expected: usize,
        /// Supplied count.
        found: usize,
    },
    /// A flag cell holds something other than 0 or 1.
    #[error("flag cell holds {0}")]
    NotBoolean(u64),
    /// A cell that must be zero-padding is not.
    #[error("padding cell {0} is non-zero")]
    NonZeroPadding(usize),
}

/// Fails unless `value < 2^bits`.
pub fn range_check(index: usize, value: u64, bits: u32) -> Result<u64, LimbError> {
    if bits < 64 && value >> bits != 0 {
        return Err(LimbError::OutOfRange { index, value, bits });
    }
    Ok(value)
}

/// Splits `bytes` into little-endian 32-bit limbs.  The length must be a
/// multiple of four.
pub fn bytes_to_limbs(bytes: &[u8]) -> Vec<u64> {
    assert!(bytes.len() % 4 == 0, "limb input must be word aligned");
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
        .collect()
}

/// Inverse of [`bytes_to_limbs`], range-checking every limb.
pub fn limbs_to_bytes(limbs: &[u64]) -> Result<Vec<u8>, LimbError> {
    let mut out = Vec::with_capacity(limbs.len() * 4);
    for (index, &limb) in limbs.iter().enumerate() {
        let limb = range_check(index, limb, LIMB_BITS)? as u32;
        out.extend_from_slice(&limb.to_le_bytes());
    }
    Ok(out)
}

/// Decodes exactly `N` bytes from limbs.
pub fn limbs_to_array<const N: usize>(limbs: &[u64]) -> Result<[u8; N], LimbError> {
    if limbs.len() * 4 != N {
        return Err(LimbError::Length {
            expected: N / 4,
            found: limbs.len(),
        });
    }
    let bytes = limbs_to_bytes(limbs)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Splits an integer into `count` 32-bit limbs, least significant first.
///
/// # Panics
///
/// Panics if `value` needs more than `count` limbs.
pub fn int_to_limbs(value: u128, count: usize) -> Vec<u64> {
    let mut rest = value;
    let limbs = (0..count)
        .map(|_| {
            let limb = (rest & 0xffff_ffff) as u64;
            rest >>= LIMB_BITS;
            limb
        })
        .collect();
    assert!(rest == 0, "value does not fit in {count} limbs");
    limbs
}

/// Recombines 32-bit limbs into an integer, range-checking each limb.
pub fn limbs_to_int(limbs: &[u64]) -> Result<u128, LimbError> {
    if limbs.len() > 4 {
        return Err(LimbError::Length {
            expected: 4,
            found: limbs.len(),
        });
    }
    let mut value = 0u128;
    for (index, &limb) in limbs.iter().enumerate().rev() {
        value = (value << LIMB_BITS) | range_check(index, limb, LIMB_BITS)? as u128;
    }
    Ok(value)
}

/// Reads a boolean flag cell.
pub fn flag(value: u64) -> Result<bool, LimbError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LimbError::NotBoolean(other)),
    }
}

/// Splits a digest into four little-endian 64-bit words, the limb width used
/// for Groth16 public inputs.
pub fn digest_words(digest: &Digest) -> [u64; 4] {
    let mut out = [0u64; 4];
    for (word, chunk) in out.iter_mut().zip(digest.chunks_exact(8)) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        *word = u64::from_le_bytes(buf);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_decomposes_into_eight_limbs() {
        let mut digest = [0u8; 32];
        digest[0] = 0x01;
        digest[4] = 0xff;
        digest[31] = 0x80;
        let limbs = bytes_to_limbs(&digest);
        assert_eq!(limbs.len(), DIGEST_LIMBS);
        assert_eq!(limbs[0], 1);
        assert_eq!(limbs[1], 0xff);
        assert_eq!(limbs[7], 0x8000_0000);
        assert_eq!(limbs_to_array::<32>(&limbs).unwrap(), digest);
    }

    #[test]
    fn oversized_limb_is_rejected() {
        let mut limbs = bytes_to_limbs(&[7u8; 32]);
        limbs[3] = 1 << 32;
        assert_eq!(
            limbs_to_array::<32>(&limbs),
            Err(LimbError::OutOfRange {
                index: 3,
                value: 1 << 32,
                bits: 32
            })
        );
    }

    #[test]
    fn unchecked_wide_cells_would_alias() {
        // [2^32 + 5, 0] and [5, 1] both sum to 2^32 + 5 when recombined
        // without a range check.
        let wide = [(1u64 << 32) + 5, 0];
        let carried = [5u64, 1];
        let unchecked = |limbs: &[u64]| limbs[0] as u128 + ((limbs[1] as u128) << 32);
        assert_eq!(unchecked(&wide), unchecked(&carried));
        assert_eq!(limbs_to_int(&carried), Ok((1u128 << 32) + 5));
        assert!(matches!(
            limbs_to_int(&wide),
            Err(LimbError::OutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn integers_and_flags() {
        let limbs = int_to_limbs(u64::MAX as u128 * 3, 4);
        assert_eq!(limbs_to_int(&limbs).unwrap(), u64::MAX as u128 * 3);
        assert_eq!(flag(1), Ok(true));
        assert_eq!(flag(2), Err(LimbError::NotBoolean(2)));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn int_overflow_is_fatal() {
        int_to_limbs(1u128 << 64, 2);
    }

    proptest! {
        #[test]
        fn limbs_are_canonical_and_injective(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let la = bytes_to_limbs(&a);
            prop_assert!(la.iter().all(|&l| l >> LIMB_BITS == 0));
            prop_assert_eq!(limbs_to_array::<32>(&la).unwrap(), a);
            if a != b {
                prop_assert_ne!(la, bytes_to_limbs(&b));
            }
        }

        #[test]
        fn words_recompose(d in any::<[u8; 32]>()) {
            let words = digest_words(&d);
            let mut back = Vec::new();
            for w in words {
                back.extend_from_slice(&w.to_le_bytes());
            }
            prop_assert_eq!(back, d.to_vec());
        }
    }
}
