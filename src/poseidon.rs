//! Poseidon over the BLS12-377 base field.
//!
//! The wrapped circuit runs over BW6-761, whose scalar field is this base
//! field, so anything hashed here can be recomputed in-circuit at native
//! cost.  Hash-to-curve candidates and validator-set commitments both go
//! through [`hash`] natively and [`hash_var`] inside the circuit.

use std::sync::OnceLock;

use ark_bls12_377::Fq;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_crypto_primitives::sponge::poseidon::{
    find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge,
};
use ark_crypto_primitives::sponge::{CryptographicSponge, FieldBasedCryptographicSponge};
use ark_ff::{BigInteger, PrimeField};
use ark_r1cs_std::fields::fp::FpVar;
use ark_relations::r1cs::{ConstraintSystemRef, SynthesisError};
use blake2::digest::{consts::U32, Digest as _};

use crate::types::Digest;

type Blake2b256 = blake2::Blake2b<U32>;

const FULL_ROUNDS: u64 = 8;
const PARTIAL_ROUNDS: u64 = 60;
const ALPHA: u64 = 5;
const RATE: usize = 2;
const CAPACITY: usize = 1;

/// Sponge parameters, derived once from the Grain LFSR.
pub fn config() -> &'static PoseidonConfig<Fq> {
    static CONFIG: OnceLock<PoseidonConfig<Fq>> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let (ark, mds) = find_poseidon_ark_and_mds::<Fq>(
            Fq::MODULUS_BIT_SIZE as u64,
            RATE,
            FULL_ROUNDS,
            PARTIAL_ROUNDS,
            0,
        );
        PoseidonConfig::new(
            FULL_ROUNDS as usize,
            PARTIAL_ROUNDS as usize,
            ALPHA,
            mds,
            ark,
            RATE,
            CAPACITY,
        )
    })
}

/// Absorbs `inputs` and squeezes one element.
pub fn hash(inputs: &[Fq]) -> Fq {
    let mut sponge = PoseidonSponge::new(config());
    sponge.absorb(&inputs);
    sponge
        .squeeze_native_field_elements(1)
        .pop()
        .unwrap_or_default()
}

/// In-circuit counterpart of [`hash`].
pub fn hash_var(
    cs: ConstraintSystemRef<Fq>,
    inputs: &[FpVar<Fq>],
) -> Result<FpVar<Fq>, SynthesisError> {
    let mut sponge = PoseidonSpongeVar::new(cs, config());
    sponge.absorb(&inputs)?;
    sponge
        .squeeze_field_elements(1)?
        .pop()
        .ok_or(SynthesisError::Unsatisfiable)
}

/// Maps arbitrary bytes (a domain tag, a validator identity) into the field
/// through BLAKE2b.
pub fn bytes_to_field(bytes: &[u8]) -> Fq {
    let mut hasher = Blake2b256::new();
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
    Fq::from_le_bytes_mod_order(&hasher.finalize())
}

/// Low 256 bits of `value`, little-endian.
pub fn field_to_digest(value: &Fq) -> Digest {
    let bytes = value.into_bigint().to_bytes_le();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[..32]);
    out
}

/// Packs bytes into little-endian 64-bit words, zero-padding the last one.
pub fn byte_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_r1cs_std::{alloc::AllocVar, R1CSVar};
    use ark_relations::r1cs::ConstraintSystem;

    #[test]
    fn gadget_matches_the_native_sponge() {
        let inputs: Vec<Fq> = (1..=5u64).map(Fq::from).collect();
        let cs = ConstraintSystem::<Fq>::new_ref();
        let vars = inputs
            .iter()
            .map(|x| FpVar::new_witness(cs.clone(), || Ok(*x)))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let out = hash_var(cs.clone(), &vars).unwrap();
        assert_eq!(out.value().unwrap(), hash(&inputs));
        assert!(cs.is_satisfied().unwrap());
    }

    #[test]
    fn order_and_values_matter() {
        let a = hash(&[Fq::from(1u64), Fq::from(2u64)]);
        assert_ne!(a, hash(&[Fq::from(2u64), Fq::from(1u64)]));
        assert_ne!(a, hash(&[Fq::from(1u64), Fq::from(3u64)]));
    }

    #[test]
    fn words_are_little_endian_and_padded() {
        let words = byte_words(&[1, 0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(words, vec![1, 2]);
        assert_ne!(bytes_to_field(b"a"), bytes_to_field(b"a\0"));
    }
}
