//! Direct verification of quorum certificates.
//!
//! A certificate is checked in three steps against the set that must sign
//! its position: voting power over the signer mask, aggregation of the
//! signers' keys, and one multi-pairing over the canonical message.  The
//! functions here are pure; the engine owns the state they are applied to.

use std::collections::HashMap;

use tracing::trace;

use crate::bls::{PublicKey, Signature, SignatureCheck};
use crate::error::VerifyErrorKind;
use crate::quorum::{check_quorum, QuorumTally};
use crate::types::{ChainState, Digest, QuorumCertificate, SignerMask, ValidatorSet};

/// Access to validator sets by commitment.
pub trait SetLookup {
    /// The set committed to by `commitment`, if known.
    fn validator_set(&self, commitment: &Digest) -> Option<&ValidatorSet>;
}

impl SetLookup for HashMap<Digest, ValidatorSet> {
    fn validator_set(&self, commitment: &Digest) -> Option<&ValidatorSet> {
        self.get(commitment)
    }
}

/// Values established while verifying one certificate.
#[derive(Debug, Clone)]
pub struct StepWitness {
    /// Commitment of the set that signed.
    pub signing_set: Digest,
    /// Power behind the signature.
    pub tally: QuorumTally,
    /// Sum of the signers' keys.
    pub aggregate_key: PublicKey,
}

/// Every check of [`verify_step`] except the pairing, which is returned
/// prepared so that callers holding many steps can batch it.
pub fn prepare_step<S: SetLookup + ?Sized>(
    state: &ChainState,
    epoch: u64,
    height: u64,
    message: &[u8],
    mask: &SignerMask,
    signature: &Signature,
    sets: &S,
) -> Result<(StepWitness, SignatureCheck), VerifyErrorKind> {
    let signing_set = state
        .signing_set_for(epoch, height)
        .ok_or(VerifyErrorKind::StaleOrNonContiguous { epoch, height })?;
    let set = sets
        .validator_set(&signing_set)
        .ok_or(VerifyErrorKind::UnknownValidatorSet)?;
    let tally = check_quorum(set, mask)?;
    let aggregate_key = tally.aggregate_key(set);
    let check = aggregate_key
        .prepare(message, signature)
        .map_err(|_| VerifyErrorKind::SignatureInvalid)?;
    Ok((
        StepWitness {
            signing_set,
            tally,
            aggregate_key,
        },
        check,
    ))
}

/// Verifies a signature over `message` at position `(epoch, height)`.
///
/// Checks run in a fixed order: contiguity, set availability, quorum power,
/// then the pairing.  The first failure is returned.
pub fn verify_step<S: SetLookup + ?Sized>(
    state: &ChainState,
    epoch: u64,
    height: u64,
    message: &[u8],
    mask: &SignerMask,
    signature: &Signature,
    sets: &S,
) -> Result<StepWitness, VerifyErrorKind> {
    let (witness, check) = prepare_step(state, epoch, height, message, mask, signature, sets)?;
    check
        .verify()
        .map_err(|_| VerifyErrorKind::SignatureInvalid)?;
    trace!(
        epoch,
        height,
        signers = witness.tally.signers.len(),
        signed_power = %witness.tally.signed_power,
        "certificate step verified"
    );
    Ok(witness)
}

/// Verifies `qc` against `state` and returns the state it advances to.
pub fn verify_certificate<S: SetLookup + ?Sized>(
    state: &ChainState,
    qc: &QuorumCertificate,
    sets: &S,
) -> Result<(ChainState, StepWitness), VerifyErrorKind> {
    let li = &qc.ledger_info;
    let witness = verify_step(
        state,
        li.epoch,
        li.height,
        &li.signing_message(),
        &qc.signer_mask,
        &qc.aggregate_signature,
        sets,
    )?;
    let next = state.advance(
        li.epoch,
        li.height,
        li.state_root,
        witness.signing_set,
        li.next_set_commitment(),
    );
    Ok((next, witness))
}
