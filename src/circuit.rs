//! R1CS circuit for wrapped proofs, over BW6-761.
//!
//! [`TransitionCircuit`] replays up to `max_steps` certificates: chain-state
//! contiguity, the validator-set commitment, quorum arithmetic and the BLS
//! signatures themselves.  The BW6-761 scalar field is the BLS12-377 base
//! field, so G1 and G2 coordinates are native field elements here.
//!
//! Public inputs (see [`public_inputs`]):
//!
//! ```text
//! kind tag
//! start: epoch, height, root[4], set[4], pending flag, pending[4]
//! end:   epoch, height, root[4], set[4], pending flag, pending[4]
//! ```
//!
//! Digests enter as four 64-bit little-endian words.  Every word, epoch,
//! height and voting power is range-checked by bit decomposition; the
//! scalar field is larger than any of them, so an unchecked value could wrap.
//!
//! For each active step the circuit
//!
//! 1. recomputes the Poseidon commitment of the witnessed members (identity,
//!    affine key, power) and compares it with the set the step must be
//!    signed by;
//! 2. sums the keys of the flagged signers and checks `3·signed ≥ 2·total`;
//! 3. hashes the signing message to G1 with the same try-and-increment as
//!    [`crate::bls::hash_to_g1`], taking the counter and `y` as hints.
//!
//! One witnessed signature sum `S` then closes every step at once:
//!
//! ```text
//! e(S, -g₂) · Π e(Hᵢ, apkᵢ) == 1
//! ```
//!
//! Padding steps contribute `e(g₁, g₂)` and the prover adds `g₁` to `S` for
//! each of them.

use ark_bls12_377::constraints::{Fq12Var, Fq2Var, G1Var, G2Var, PairingVar};
use ark_bls12_377::{g1, g2, Bls12_377, Fq, G1Projective, G2Affine, G2Projective};
use ark_ec::{short_weierstrass::SWCurveConfig, AffineRepr, CurveConfig, Group};
use ark_ff::{BigInteger, BitIteratorLE, PrimeField, Zero};
use ark_r1cs_std::{
    alloc::{AllocVar, AllocationMode},
    boolean::Boolean,
    eq::EqGadget,
    fields::{fp::FpVar, FieldVar},
    groups::CurveVar,
    pairing::PairingVar as PairingGadget,
    select::CondSelectGadget,
    R1CSVar, ToBitsGadget,
};
use ark_relations::ns;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use serde::{Deserialize, Serialize};

use crate::bls::{self, HashHint, Signature, SIG_DOMAIN};
use crate::limbs::digest_words;
use crate::poseidon::{self, bytes_to_field};
use crate::types::{
    signing_message, ChainState, Digest, ProofKind, QuorumCertificate, ValidatorInfo,
    ValidatorSet, VerifiedHead, SIGNING_MESSAGE_BYTES, VALIDATOR_SET_DOMAIN,
};

/// Width of the quorum margin `3·signed − 2·total`.  Enough for 4096
/// validators of `u64::MAX` power each.
const MARGIN_BITS: usize = 80;
/// Bits of the try-and-increment counter.
const COUNTER_BITS: usize = 8;
/// Largest committee a circuit shape may declare.
pub const MAX_CIRCUIT_VALIDATORS: usize = 4096;
/// Number of field elements in the public-input vector.
pub const PUBLIC_INPUT_LEN: usize = 1 + 2 * 16;

/// Fixed dimensions a setup is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitShape {
    /// Certificates per wrapped proof.
    pub max_steps: usize,
    /// Members per validator set.
    pub max_validators: usize,
}

impl CircuitShape {
    /// Rejects shapes the circuit cannot be built for.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_steps == 0 {
            return Err("max_steps must be at least 1".into());
        }
        if self.max_validators == 0 || self.max_validators > MAX_CIRCUIT_VALIDATORS {
            return Err(format!(
                "max_validators must be in 1..={MAX_CIRCUIT_VALIDATORS}"
            ));
        }
        Ok(())
    }
}

/// Public-input vector for a wrapped proof from `start` to `end`.
pub fn public_inputs(kind: ProofKind, start: &ChainState, end: &ChainState) -> Vec<Fq> {
    let mut out = Vec::with_capacity(PUBLIC_INPUT_LEN);
    out.push(Fq::from(kind.tag()));
    push_state(&mut out, start);
    push_state(&mut out, end);
    out
}

fn push_state(out: &mut Vec<Fq>, state: &ChainState) {
    out.push(Fq::from(state.head.epoch));
    out.push(Fq::from(state.head.height));
    out.extend(digest_words(&state.head.state_root).map(Fq::from));
    out.extend(digest_words(&state.head.validator_set_commitment).map(Fq::from));
    out.push(Fq::from(state.pending_set.is_some() as u64));
    out.extend(digest_words(&state.pending_set.unwrap_or([0u8; 32])).map(Fq::from));
}

/// One member of a signing set, as the commitment absorbs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberWitness {
    /// Identity mapped into the field.
    pub identity: Fq,
    /// Affine public key.
    pub key: G2Affine,
    /// Voting power.
    pub power: u64,
}

impl From<&ValidatorInfo> for MemberWitness {
    fn from(info: &ValidatorInfo) -> Self {
        Self {
            identity: bytes_to_field(info.identity.as_bytes()),
            key: info.public_key.to_affine(),
            power: info.voting_power,
        }
    }
}

/// Witness for one certificate in a transition.
#[derive(Debug, Clone, Default)]
pub struct CircuitStep {
    /// Epoch of the ledger info.
    pub epoch: u64,
    /// Height of the ledger info.
    pub height: u64,
    /// Certified root.
    pub state_root: Digest,
    /// Consensus digest, signed but not carried into the chain state.
    pub consensus_digest: Digest,
    /// Commitment of the signing set.
    pub signing_set: Digest,
    /// Announced next set.
    pub next_set: Option<Digest>,
    /// Members of the signing set, in set order.
    pub members: Vec<MemberWitness>,
    /// Signer bits, in set order.
    pub signers: Vec<bool>,
    /// Aggregate signature over [`Self::message`].
    pub signature: Option<Signature>,
}

impl CircuitStep {
    /// Step for `qc`, signed by `set`.
    pub fn from_certificate(qc: &QuorumCertificate, set: &ValidatorSet) -> Self {
        let li = &qc.ledger_info;
        Self {
            epoch: li.epoch,
            height: li.height,
            state_root: li.state_root,
            consensus_digest: li.consensus_digest,
            signing_set: set.commitment(),
            next_set: li.next_set_commitment(),
            members: set.iter().map(MemberWitness::from).collect(),
            signers: (0..set.len()).map(|i| qc.signer_mask.get(i)).collect(),
            signature: Some(qc.aggregate_signature.clone()),
        }
    }

    /// Bytes the signers signed.
    pub fn message(&self) -> Vec<u8> {
        signing_message(
            self.epoch,
            self.height,
            &self.state_root,
            &self.consensus_digest,
            self.next_set.as_ref(),
        )
    }
}

fn zero_state() -> ChainState {
    ChainState {
        head: VerifiedHead {
            epoch: 0,
            height: 0,
            state_root: [0u8; 32],
            validator_set_commitment: [0u8; 32],
        },
        pending_set: None,
    }
}

/// Enforces `value < 2^bits`.
fn enforce_bits(
    cs: &ConstraintSystemRef<Fq>,
    value: &FpVar<Fq>,
    bits: usize,
) -> Result<(), SynthesisError> {
    let native: Option<Vec<bool>> = value.value().ok().map(|v| v.into_bigint().to_bits_le());
    let decomposition = (0..bits)
        .map(|i| {
            Boolean::new_witness(cs.clone(), || {
                native
                    .as_ref()
                    .map(|b| b[i])
                    .ok_or(SynthesisError::AssignmentMissing)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Boolean::le_bits_to_fp_var(&decomposition)?.enforce_equal(value)
}

fn alloc_u64(
    cs: &ConstraintSystemRef<Fq>,
    value: u64,
    mode: AllocationMode,
) -> Result<FpVar<Fq>, SynthesisError> {
    let var = FpVar::new_variable(cs.clone(), || Ok(Fq::from(value)), mode)?;
    enforce_bits(cs, &var, 64)?;
    Ok(var)
}

fn alloc_digest(
    cs: &ConstraintSystemRef<Fq>,
    digest: &Digest,
    mode: AllocationMode,
) -> Result<Vec<FpVar<Fq>>, SynthesisError> {
    digest_words(digest)
        .into_iter()
        .map(|w| alloc_u64(cs, w, mode))
        .collect()
}

fn select_words(
    cond: &Boolean<Fq>,
    a: &[FpVar<Fq>],
    b: &[FpVar<Fq>],
) -> Result<Vec<FpVar<Fq>>, SynthesisError> {
    a.iter()
        .zip(b)
        .map(|(x, y)| FpVar::conditionally_select(cond, x, y))
        .collect()
}

fn enforce_words_equal(
    a: &[FpVar<Fq>],
    b: &[FpVar<Fq>],
    cond: &Boolean<Fq>,
) -> Result<(), SynthesisError> {
    for (x, y) in a.iter().zip(b) {
        x.conditional_enforce_equal(y, cond)?;
    }
    Ok(())
}

/// Enforces, when `cond` holds, that the low 256 bits of `value` are the
/// digest `words`.  The decomposition is the canonical one, so a word
/// representation that sums to the same field element is still rejected.
fn enforce_field_digest(
    value: &FpVar<Fq>,
    words: &[FpVar<Fq>],
    cond: &Boolean<Fq>,
) -> Result<(), SynthesisError> {
    let bits = value.to_bits_le()?;
    for (chunk, word) in bits.chunks(64).zip(words) {
        Boolean::le_bits_to_fp_var(chunk)?.conditional_enforce_equal(word, cond)?;
    }
    Ok(())
}

/// An optional digest: flag plus words, with the words forced to zero when
/// the flag is clear.
fn alloc_optional_digest(
    cs: &ConstraintSystemRef<Fq>,
    digest: Option<&Digest>,
    mode: AllocationMode,
) -> Result<(Boolean<Fq>, Vec<FpVar<Fq>>), SynthesisError> {
    let flag = Boolean::new_variable(cs.clone(), || Ok(digest.is_some()), mode)?;
    let words = alloc_digest(cs, digest.unwrap_or(&[0u8; 32]), mode)?;
    for word in &words {
        word.conditional_enforce_equal(&FpVar::zero(), &flag.not())?;
    }
    Ok((flag, words))
}

/// Allocates a G2 key from its affine coordinates, checking it is on the
/// curve.  Returns the point and the four coordinate limbs the commitment
/// absorbs.
fn alloc_key(
    cs: &ConstraintSystemRef<Fq>,
    key: G2Affine,
) -> Result<(G2Var, [FpVar<Fq>; 4]), SynthesisError> {
    let x = Fq2Var::new_witness(ns!(cs, "key x"), || Ok(key.x))?;
    let y = Fq2Var::new_witness(ns!(cs, "key y"), || Ok(key.y))?;
    let rhs = x.square()? * &x + g2::Config::COEFF_B;
    y.square()?.enforce_equal(&rhs)?;
    let coords = [x.c0.clone(), x.c1.clone(), y.c0.clone(), y.c1.clone()];
    Ok((G2Var::new(x, y, Fq2Var::one()), coords))
}

fn cofactor_bits() -> Vec<Boolean<Fq>> {
    BitIteratorLE::new(g1::Config::COFACTOR)
        .map(Boolean::constant)
        .collect()
}

/// In-circuit [`crate::bls::hash_to_g1`] over the message `words`.
///
/// The counter and `y` come from `hint`.  Any counter whose candidate is on
/// the curve, and either square root, satisfies the constraints; each such
/// point is still a Poseidon output the prover cannot steer.
fn hash_to_g1_var(
    cs: &ConstraintSystemRef<Fq>,
    words: &[FpVar<Fq>],
    hint: &HashHint,
) -> Result<G1Var, SynthesisError> {
    let mut inputs = vec![
        FpVar::constant(bytes_to_field(SIG_DOMAIN)),
        FpVar::constant(Fq::from(SIGNING_MESSAGE_BYTES as u64)),
    ];
    inputs.extend_from_slice(words);
    let base = poseidon::hash_var(cs.clone(), &inputs)?;

    let counter = FpVar::new_witness(ns!(cs, "counter"), || Ok(Fq::from(hint.counter as u64)))?;
    enforce_bits(cs, &counter, COUNTER_BITS)?;
    let x = poseidon::hash_var(cs.clone(), &[base, counter])?;
    let y = FpVar::new_witness(ns!(cs, "y"), || Ok(hint.point.y))?;
    let rhs = x.square()? * &x + g1::Config::COEFF_B;
    y.square()?.enforce_equal(&rhs)?;

    let point = G1Var::new(x, y, FpVar::one());
    point.scalar_mul_le(cofactor_bits().iter())
}

#[derive(Clone)]
struct StateVar {
    epoch: FpVar<Fq>,
    height: FpVar<Fq>,
    root: Vec<FpVar<Fq>>,
    set: Vec<FpVar<Fq>>,
    pending_flag: Boolean<Fq>,
    pending: Vec<FpVar<Fq>>,
}

impl StateVar {
    fn alloc(
        cs: &ConstraintSystemRef<Fq>,
        state: &ChainState,
        mode: AllocationMode,
    ) -> Result<Self, SynthesisError> {
        let epoch = alloc_u64(cs, state.head.epoch, mode)?;
        let height = alloc_u64(cs, state.head.height, mode)?;
        let root = alloc_digest(cs, &state.head.state_root, mode)?;
        let set = alloc_digest(cs, &state.head.validator_set_commitment, mode)?;
        let (pending_flag, pending) = alloc_optional_digest(cs, state.pending_set.as_ref(), mode)?;
        Ok(Self {
            epoch,
            height,
            root,
            set,
            pending_flag,
            pending,
        })
    }

    fn select(cond: &Boolean<Fq>, a: &Self, b: &Self) -> Result<Self, SynthesisError> {
        Ok(Self {
            epoch: FpVar::conditionally_select(cond, &a.epoch, &b.epoch)?,
            height: FpVar::conditionally_select(cond, &a.height, &b.height)?,
            root: select_words(cond, &a.root, &b.root)?,
            set: select_words(cond, &a.set, &b.set)?,
            pending_flag: Boolean::conditionally_select(cond, &a.pending_flag, &b.pending_flag)?,
            pending: select_words(cond, &a.pending, &b.pending)?,
        })
    }

    fn enforce_equal(&self, other: &Self) -> Result<(), SynthesisError> {
        let always = Boolean::TRUE;
        self.epoch.enforce_equal(&other.epoch)?;
        self.height.enforce_equal(&other.height)?;
        enforce_words_equal(&self.root, &other.root, &always)?;
        enforce_words_equal(&self.set, &other.set, &always)?;
        self.pending_flag.enforce_equal(&other.pending_flag)?;
        enforce_words_equal(&self.pending, &other.pending, &always)
    }
}

/// Allocates step `i`'s activity flag.  Step 0 is always active and an
/// active step must follow an active one.
fn alloc_active(
    cs: &ConstraintSystemRef<Fq>,
    index: usize,
    active: bool,
    prev_active: &Boolean<Fq>,
) -> Result<Boolean<Fq>, SynthesisError> {
    let flag = Boolean::new_witness(cs.clone(), || Ok(active))?;
    if index == 0 {
        flag.enforce_equal(&Boolean::TRUE)?;
    }
    flag.and(&prev_active.not())?
        .enforce_equal(&Boolean::FALSE)?;
    Ok(flag)
}

/// What one step hands to the closing pairing check.
struct SignedStep {
    hashed: G1Var,
    aggregate_key: G2Var,
}

/// Certificates replayed against chain-state rules, set commitments, quorum
/// arithmetic and their BLS signatures.
#[derive(Debug, Clone)]
pub struct TransitionCircuit {
    shape: CircuitShape,
    kind: ProofKind,
    start: ChainState,
    end: ChainState,
    steps: Vec<CircuitStep>,
}

impl TransitionCircuit {
    /// Circuit for `steps` taking `start` to `end`.
    pub fn new(
        shape: CircuitShape,
        start: ChainState,
        end: ChainState,
        steps: Vec<CircuitStep>,
    ) -> Self {
        Self {
            shape,
            kind: ProofKind::WrappedSuccinct,
            start,
            end,
            steps,
        }
    }

    /// Shape-only instance for parameter generation.
    pub fn blank(shape: CircuitShape) -> Self {
        Self::new(shape, zero_state(), zero_state(), Vec::new())
    }

    #[cfg(test)]
    fn with_kind(mut self, kind: ProofKind) -> Self {
        self.kind = kind;
        self
    }

    /// The signature sum the closing pairing check expects: every active
    /// step's aggregate, plus `g₁` per padding step.
    fn signature_sum(&self) -> G1Projective {
        (0..self.shape.max_steps).fold(G1Projective::zero(), |acc, i| {
            acc + match self.steps.get(i) {
                Some(step) => step
                    .signature
                    .as_ref()
                    .map_or_else(G1Projective::zero, Signature::point),
                None => G1Projective::generator(),
            }
        })
    }

    /// Members, commitment, quorum and message hash of one step.
    fn sign_step(
        &self,
        cs: &ConstraintSystemRef<Fq>,
        step: &CircuitStep,
        active: &Boolean<Fq>,
        set_used: &[FpVar<Fq>],
        message_words: &[FpVar<Fq>],
    ) -> Result<SignedStep, SynthesisError> {
        let zero = FpVar::<Fq>::zero();
        let mut chain = poseidon::hash_var(
            cs.clone(),
            &[FpVar::constant(bytes_to_field(VALIDATOR_SET_DOMAIN))],
        )?;
        let mut count = FpVar::<Fq>::zero();
        let mut signed = FpVar::<Fq>::zero();
        let mut total = FpVar::<Fq>::zero();
        let mut aggregate_key = G2Var::zero();
        let mut prev_member = Boolean::TRUE;

        for j in 0..self.shape.max_validators {
            let member = step.members.get(j);
            let is_member = Boolean::new_witness(ns!(cs, "member"), || Ok(member.is_some()))?;
            is_member
                .and(&prev_member.not())?
                .enforce_equal(&Boolean::FALSE)?;

            let identity = FpVar::new_witness(ns!(cs, "identity"), || {
                Ok(member.map_or(Fq::zero(), |m| m.identity))
            })?;
            let (key, coords) =
                alloc_key(cs, member.map_or_else(G2Affine::generator, |m| m.key))?;
            let power = alloc_u64(cs, member.map_or(0, |m| m.power), AllocationMode::Witness)?;
            let bit = Boolean::new_witness(ns!(cs, "signer"), || {
                Ok(step.signers.get(j).copied().unwrap_or(false))
            })?;

            power.conditional_enforce_equal(&zero, &is_member.not())?;
            bit.and(&is_member.not())?
                .enforce_equal(&Boolean::FALSE)?;

            let [x0, x1, y0, y1] = coords;
            let link = poseidon::hash_var(
                cs.clone(),
                &[chain.clone(), identity, x0, x1, y0, y1, power.clone()],
            )?;
            chain = FpVar::conditionally_select(&is_member, &link, &chain)?;
            count += FpVar::from(is_member.clone());

            signed += FpVar::from(bit.clone()) * &power;
            total += &power;
            aggregate_key += bit.select(&key, &G2Var::zero())?;
            prev_member = is_member;
        }

        let commitment = poseidon::hash_var(cs.clone(), &[chain, count])?;
        enforce_field_digest(&commitment, set_used, active)?;

        // Quorum: 3·signed ≥ 2·total, total > 0.
        total.conditional_enforce_not_equal(&zero, active)?;
        let margin = signed * Fq::from(3u64) - total * Fq::from(2u64);
        let margin = FpVar::conditionally_select(active, &margin, &zero)?;
        enforce_bits(cs, &margin, MARGIN_BITS)?;

        let hint = bls::hash_hint(SIG_DOMAIN, &step.message())
            .map_err(|_| SynthesisError::Unsatisfiable)?;
        let hashed = hash_to_g1_var(cs, message_words, &hint)?;
        hashed
            .is_zero()?
            .conditional_enforce_equal(&Boolean::FALSE, active)?;

        Ok(SignedStep {
            hashed: active.select(&hashed, &G1Var::constant(G1Projective::generator()))?,
            aggregate_key: active.select(
                &aggregate_key,
                &G2Var::constant(G2Projective::generator()),
            )?,
        })
    }
}

impl ConstraintSynthesizer<Fq> for TransitionCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fq>) -> Result<(), SynthesisError> {
        if self.steps.len() > self.shape.max_steps {
            return Err(SynthesisError::Unsatisfiable);
        }
        let tag = FpVar::new_input(ns!(cs, "kind"), || Ok(Fq::from(self.kind.tag())))?;
        tag.enforce_equal(&FpVar::constant(Fq::from(
            ProofKind::WrappedSuccinct.tag(),
        )))?;
        let start = StateVar::alloc(&cs, &self.start, AllocationMode::Input)?;
        let end = StateVar::alloc(&cs, &self.end, AllocationMode::Input)?;

        let zero = FpVar::<Fq>::zero();
        let mut cur = start;
        let mut prev_active = Boolean::TRUE;
        let mut signed_steps = Vec::with_capacity(self.shape.max_steps);
        for i in 0..self.shape.max_steps {
            let step = self.steps.get(i).cloned().unwrap_or_default();
            let active = alloc_active(&cs, i, i < self.steps.len(), &prev_active)?;

            let epoch = alloc_u64(&cs, step.epoch, AllocationMode::Witness)?;
            let height = alloc_u64(&cs, step.height, AllocationMode::Witness)?;
            let root = alloc_digest(&cs, &step.state_root, AllocationMode::Witness)?;
            let consensus = alloc_digest(&cs, &step.consensus_digest, AllocationMode::Witness)?;
            let set_used = alloc_digest(&cs, &step.signing_set, AllocationMode::Witness)?;
            let (next_flag, next) =
                alloc_optional_digest(&cs, step.next_set.as_ref(), AllocationMode::Witness)?;

            // Position: same epoch with nothing pending, or the next epoch
            // once its set is pending.
            let same_epoch = epoch
                .is_eq(&cur.epoch)?
                .and(&cur.pending_flag.not())?;
            let next_epoch = epoch
                .is_eq(&(&cur.epoch + FpVar::one()))?
                .and(&cur.pending_flag)?;
            same_epoch
                .or(&next_epoch)?
                .conditional_enforce_equal(&Boolean::TRUE, &active)?;
            let height_gap = &height - &cur.height - FpVar::one();
            let height_gap =
                FpVar::conditionally_select(&active.and(&same_epoch)?, &height_gap, &zero)?;
            enforce_bits(&cs, &height_gap, 64)?;

            let expected_set = select_words(&cur.pending_flag, &cur.pending, &cur.set)?;
            enforce_words_equal(&set_used, &expected_set, &active)?;

            let mut words = Vec::with_capacity(SIGNING_MESSAGE_BYTES / 8);
            words.push(epoch.clone());
            words.push(height.clone());
            words.extend(root.iter().cloned());
            words.extend(consensus.iter().cloned());
            words.push(FpVar::from(next_flag.clone()));
            words.extend(next.iter().cloned());
            signed_steps.push(self.sign_step(&cs, &step, &active, &set_used, &words)?);

            let advanced = StateVar {
                epoch,
                height,
                root,
                set: set_used,
                pending_flag: next_flag,
                pending: next,
            };
            cur = StateVar::select(&active, &advanced, &cur)?;
            prev_active = active;
        }
        cur.enforce_equal(&end)?;

        let signature_sum = G1Var::new_witness(ns!(cs, "signature sum"), || {
            Ok(self.signature_sum())
        })?;
        signature_sum.is_zero()?.enforce_equal(&Boolean::FALSE)?;

        let mut g1s = vec![<PairingVar as PairingGadget<Bls12_377>>::prepare_g1(
            &signature_sum,
        )?];
        let mut g2s = vec![<PairingVar as PairingGadget<Bls12_377>>::prepare_g2(
            &G2Var::constant(-G2Projective::generator()),
        )?];
        for signed in &signed_steps {
            g1s.push(<PairingVar as PairingGadget<Bls12_377>>::prepare_g1(
                &signed.hashed,
            )?);
            g2s.push(<PairingVar as PairingGadget<Bls12_377>>::prepare_g2(
                &signed.aggregate_key,
            )?);
        }
        <PairingVar as PairingGadget<Bls12_377>>::product_of_pairings(&g1s, &g2s)?
            .enforce_equal(&Fq12Var::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::verify_certificate;
    use crate::simulate::Committee;
    use ark_bls12_377::Fq2;
    use ark_relations::r1cs::ConstraintSystem;
    use std::collections::HashMap;

    const SHAPE: CircuitShape = CircuitShape {
        max_steps: 2,
        max_validators: 4,
    };

    fn satisfied<C: ConstraintSynthesizer<Fq>>(circuit: C) -> bool {
        let cs = ConstraintSystem::<Fq>::new_ref();
        match circuit.generate_constraints(cs.clone()) {
            Ok(()) => cs.is_satisfied().unwrap(),
            Err(_) => false,
        }
    }

    struct Fixture {
        first: Committee,
        start: ChainState,
        end: ChainState,
        steps: Vec<CircuitStep>,
    }

    /// A boundary certificate of epoch 0 announcing a new committee, then
    /// the first certificate of epoch 1.
    fn epoch_change() -> Fixture {
        let first = Committee::new(b"circuit-a", &[1, 1, 1, 1]);
        let second = Committee::new(b"circuit-b", &[2, 2, 2]);
        let mut sets: HashMap<Digest, ValidatorSet> = first.registry();
        sets.extend(second.registry());

        let start = first.genesis_state();
        let boundary = first.certify(
            first.ledger_info(0, 3, Some(second.set().clone())),
            &[0, 1, 2],
        );
        let opening = second.certify(second.ledger_info(1, 0, None), &[1, 2]);
        let (mid, _) = verify_certificate(&start, &boundary, &sets).unwrap();
        let (end, _) = verify_certificate(&mid, &opening, &sets).unwrap();
        let steps = vec![
            CircuitStep::from_certificate(&boundary, first.set()),
            CircuitStep::from_certificate(&opening, second.set()),
        ];
        Fixture {
            first,
            start,
            end,
            steps,
        }
    }

    /// One step at `(0, height)` with root `root`, signed by `signers` of
    /// `committee`, and the state it leads to.
    fn single(
        committee: &Committee,
        height: u64,
        root: Digest,
        signers: &[usize],
    ) -> (ChainState, CircuitStep) {
        let mut li = committee.ledger_info(0, height, None);
        li.state_root = root;
        let qc = committee.certify(li, signers);
        let step = CircuitStep::from_certificate(&qc, committee.set());
        let end = committee
            .genesis_state()
            .advance(0, height, root, step.signing_set, None);
        (end, step)
    }

    #[test]
    fn epoch_change_is_satisfied() {
        let f = epoch_change();
        assert!(satisfied(TransitionCircuit::new(SHAPE, f.start, f.end, f.steps)));
    }

    #[test]
    fn padding_steps_are_satisfied() {
        let committee = Committee::new(b"circuit-pad", &[1, 1, 1]);
        let (end, step) = single(&committee, 4, [4; 32], &[0, 1]);
        assert!(satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn public_input_vector_matches_the_allocation() {
        let f = epoch_change();
        let cs = ConstraintSystem::<Fq>::new_ref();
        TransitionCircuit::new(SHAPE, f.start, f.end, f.steps)
            .generate_constraints(cs.clone())
            .unwrap();
        assert_eq!(cs.num_instance_variables(), PUBLIC_INPUT_LEN + 1);
        let expected = public_inputs(ProofKind::WrappedSuccinct, &f.start, &f.end);
        let assigned = cs.borrow().unwrap().instance_assignment[1..].to_vec();
        assert_eq!(assigned, expected);
    }

    #[test]
    fn unsigned_step_is_unsatisfied() {
        let committee = Committee::new(b"circuit-one", &[1]);
        let (end, mut step) = single(&committee, 7, [0xab; 32], &[0]);
        step.signature = None;
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn signature_over_another_root_is_unsatisfied() {
        let committee = Committee::new(b"circuit-one", &[1]);
        let (_, honest) = single(&committee, 7, [0x01; 32], &[0]);
        let (end, mut forged) = single(&committee, 7, [0xab; 32], &[0]);
        forged.signature = honest.signature;
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![forged]
        )));
    }

    #[test]
    fn invented_power_is_unsatisfied() {
        let committee = Committee::new(b"circuit-power", &[1, 1, 10]);
        // Members 0 and 1 hold 2 of 12; claiming power 100 each would pass
        // the quorum arithmetic on its own.
        let (end, mut step) = single(&committee, 2, [2; 32], &[0, 1]);
        step.members[0].power = 100;
        step.members[1].power = 100;
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn substituted_key_is_unsatisfied() {
        let committee = Committee::new(b"circuit-key", &[1, 1, 1]);
        let outsider = Committee::new(b"circuit-outsider", &[1, 1, 1]);
        let (end, mut step) = single(&committee, 2, [2; 32], &[0, 1, 2]);
        let mut li = committee.ledger_info(0, 2, None);
        li.state_root = [2; 32];
        let theirs =
            CircuitStep::from_certificate(&outsider.certify(li, &[0, 1, 2]), outsider.set());
        // The outsiders' keys and signature agree with each other and with
        // the message, but not with the committed set.
        for (mine, other) in step.members.iter_mut().zip(&theirs.members) {
            mine.key = other.key;
        }
        step.signature = theirs.signature;
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn dropped_member_is_unsatisfied() {
        let f = epoch_change();
        let mut steps = f.steps;
        steps[0].members.pop();
        steps[0].signers.pop();
        assert!(!satisfied(TransitionCircuit::new(SHAPE, f.start, f.end, steps)));
    }

    #[test]
    fn missing_quorum_is_unsatisfied() {
        let f = epoch_change();
        let (end, step) = single(&f.first, 1, [1; 32], &[0, 1]);
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            f.start,
            end,
            vec![step]
        )));
    }

    #[test]
    fn wrong_signing_set_is_unsatisfied() {
        let f = epoch_change();
        let mut steps = f.steps;
        steps[1].signing_set = f.start.head.validator_set_commitment;
        assert!(!satisfied(TransitionCircuit::new(SHAPE, f.start, f.end, steps)));
    }

    #[test]
    fn repeated_height_is_unsatisfied() {
        let committee = Committee::new(b"circuit-height", &[1, 1, 1]);
        let (end, step) = single(&committee, 0, [9; 32], &[0, 1, 2]);
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn skipping_the_pending_set_is_unsatisfied() {
        let committee = Committee::new(b"circuit-skip", &[1, 1, 1]);
        let qc = committee.certify_all(committee.ledger_info(1, 0, None));
        let step = CircuitStep::from_certificate(&qc, committee.set());
        let end = committee.genesis_state().advance(
            1,
            0,
            qc.ledger_info.state_root,
            step.signing_set,
            None,
        );
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            vec![step]
        )));
    }

    #[test]
    fn end_state_must_match() {
        let f = epoch_change();
        let mut end = f.end;
        end.head.height = 1;
        assert!(!satisfied(TransitionCircuit::new(SHAPE, f.start, end, f.steps)));
    }

    #[test]
    fn native_kind_tag_is_unsatisfied() {
        let f = epoch_change();
        let circuit =
            TransitionCircuit::new(SHAPE, f.start, f.end, f.steps).with_kind(ProofKind::Native);
        assert!(!satisfied(circuit));
    }

    #[test]
    fn too_many_steps_fail_synthesis() {
        let committee = Committee::new(b"circuit-many", &[1]);
        let steps: Vec<_> = (1..=3)
            .map(|h| single(&committee, h, [h as u8; 32], &[0]).1)
            .collect();
        let (end, _) = single(&committee, 3, [3; 32], &[0]);
        assert!(!satisfied(TransitionCircuit::new(
            SHAPE,
            committee.genesis_state(),
            end,
            steps
        )));
    }

    #[test]
    fn bit_decomposition_bounds_the_value() {
        let cs = ConstraintSystem::<Fq>::new_ref();
        let fits = FpVar::new_witness(cs.clone(), || Ok(Fq::from(u64::MAX))).unwrap();
        enforce_bits(&cs, &fits, 64).unwrap();
        assert!(cs.is_satisfied().unwrap());

        let cs = ConstraintSystem::<Fq>::new_ref();
        let wide = FpVar::new_witness(cs.clone(), || Ok(Fq::from(u64::MAX) + Fq::from(1u64)))
            .unwrap();
        enforce_bits(&cs, &wide, 64).unwrap();
        assert!(!cs.is_satisfied().unwrap());

        let cs = ConstraintSystem::<Fq>::new_ref();
        let negative = FpVar::new_witness(cs.clone(), || Ok(-Fq::from(1u64))).unwrap();
        enforce_bits(&cs, &negative, MARGIN_BITS).unwrap();
        assert!(!cs.is_satisfied().unwrap());
    }

    #[test]
    fn field_digest_rejects_aliased_words() {
        let value = Fq::from((5u128 << 64) | 7);
        let check = |words: [Fq; 4]| {
            let cs = ConstraintSystem::<Fq>::new_ref();
            let value = FpVar::new_witness(cs.clone(), || Ok(value)).unwrap();
            let words: Vec<_> = words
                .iter()
                .map(|w| FpVar::new_witness(cs.clone(), || Ok(*w)).unwrap())
                .collect();
            enforce_field_digest(&value, &words, &Boolean::TRUE).unwrap();
            cs.is_satisfied().unwrap()
        };
        let two_64 = Fq::from(1u128 << 64);
        assert!(check([Fq::from(7u64), Fq::from(5u64), Fq::zero(), Fq::zero()]));
        // Same field element as a sum of words, different limbs.
        assert!(!check([
            Fq::from(7u64) + two_64,
            Fq::from(4u64),
            Fq::zero(),
            Fq::zero()
        ]));
    }

    #[test]
    fn off_curve_key_is_unsatisfied() {
        let committee = Committee::new(b"circuit-curve", &[1]);
        let key = committee.set().get(0).unwrap().public_key.to_affine();

        let cs = ConstraintSystem::<Fq>::new_ref();
        alloc_key(&cs, key).unwrap();
        assert!(cs.is_satisfied().unwrap());

        let cs = ConstraintSystem::<Fq>::new_ref();
        let shifted = G2Affine::new_unchecked(key.x, key.y + Fq2::from(1u64));
        alloc_key(&cs, shifted).unwrap();
        assert!(!cs.is_satisfied().unwrap());
    }

    #[test]
    fn hash_gadget_matches_the_native_hash() {
        let message = signing_message(3, 4, &[5; 32], &[6; 32], Some(&[7; 32]));
        let hint = bls::hash_hint(SIG_DOMAIN, &message).unwrap();
        let cs = ConstraintSystem::<Fq>::new_ref();
        let words: Vec<_> = poseidon::byte_words(&message)
            .into_iter()
            .map(|w| FpVar::new_witness(cs.clone(), || Ok(Fq::from(w))).unwrap())
            .collect();
        let hashed = hash_to_g1_var(&cs, &words, &hint).unwrap();
        assert!(cs.is_satisfied().unwrap());
        assert_eq!(
            hashed.value().unwrap(),
            bls::hash_to_g1(SIG_DOMAIN, &message).unwrap()
        );
    }
}
