//! Batch-proof verification, dispatched on the proof kind.

use std::sync::Arc;

use tracing::debug;

use crate::error::VerifyErrorKind;
use crate::setup::VerifierKeys;
use crate::transparent::TransparentProof;
use crate::types::{BatchProof, ChainState, ProofKind, ValidatorSet};
use crate::wrapped::WrappedEnvelope;

/// What a successful verification established beyond the end state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationOutcome {
    /// Certificates covered, when the proof reveals them.
    pub certificates: Option<usize>,
    /// Validator sets disclosed by the proof.
    pub disclosed_sets: Vec<ValidatorSet>,
}

/// A verification algorithm for one [`ProofKind`].
pub trait ProofVerifier: Send + Sync {
    /// Kind this verifier accepts.
    fn kind(&self) -> ProofKind;

    /// Checks `proof` as a transition from `start` to `end`.  Range and
    /// start-state checks have already been done by the caller.
    fn verify(
        &self,
        proof: &BatchProof,
        start: &ChainState,
        end: &ChainState,
    ) -> Result<VerificationOutcome, VerifyErrorKind>;
}

/// Verifier for transparent proofs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransparentVerifier;

impl ProofVerifier for TransparentVerifier {
    fn kind(&self) -> ProofKind {
        ProofKind::Native
    }

    fn verify(
        &self,
        proof: &BatchProof,
        start: &ChainState,
        end: &ChainState,
    ) -> Result<VerificationOutcome, VerifyErrorKind> {
        let inner = TransparentProof::from_bytes(&proof.proof_bytes)?;
        let certificates = inner.verify(&proof.statement_digest(), start, end)?;
        Ok(VerificationOutcome {
            certificates: Some(certificates),
            disclosed_sets: inner.validator_sets,
        })
    }
}

/// Verifier for Groth16-wrapped proofs.
#[derive(Debug, Clone, Default)]
pub struct SuccinctVerifier {
    keys: Option<Arc<VerifierKeys>>,
}

impl SuccinctVerifier {
    /// Verifier holding `keys`.
    pub fn new(keys: Arc<VerifierKeys>) -> Self {
        Self { keys: Some(keys) }
    }

    /// `true` once keys are loaded.
    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }
}

impl ProofVerifier for SuccinctVerifier {
    fn kind(&self) -> ProofKind {
        ProofKind::WrappedSuccinct
    }

    fn verify(
        &self,
        proof: &BatchProof,
        start: &ChainState,
        end: &ChainState,
    ) -> Result<VerificationOutcome, VerifyErrorKind> {
        let keys = self.keys.as_ref().ok_or_else(|| {
            VerifyErrorKind::SetupMissing("no verifying keys loaded".into())
        })?;
        let envelope = WrappedEnvelope::from_bytes(&proof.proof_bytes)?;
        envelope.verify(keys, start, end)?;
        debug!("wrapped proof verified");
        Ok(VerificationOutcome {
            certificates: None,
            disclosed_sets: Vec::new(),
        })
    }
}

/// Routes each proof to the verifier for its kind after the checks common
/// to both.
#[derive(Debug, Clone, Default)]
pub struct DualProofVerifier {
    transparent: TransparentVerifier,
    succinct: SuccinctVerifier,
}

impl DualProofVerifier {
    /// Dispatcher with optional wrapped-proof keys.
    pub fn new(keys: Option<Arc<VerifierKeys>>) -> Self {
        Self {
            transparent: TransparentVerifier,
            succinct: SuccinctVerifier { keys },
        }
    }

    /// `true` if wrapped proofs can be verified.
    pub fn accepts_wrapped(&self) -> bool {
        self.succinct.has_keys()
    }

    /// Verifies `proof` against `state` and returns the state it proves.
    ///
    /// Order: range monotonicity, then that the proof starts at `state`,
    /// then the kind-specific algorithm.
    pub fn verify(
        &self,
        proof: &BatchProof,
        state: &ChainState,
    ) -> Result<(ChainState, VerificationOutcome), VerifyErrorKind> {
        if !proof.is_monotonic() {
            return Err(VerifyErrorKind::NonMonotonicBatch);
        }
        let start = ChainState::from_batch_start(proof);
        if start != *state {
            return Err(VerifyErrorKind::StaleProof);
        }
        let end = ChainState::from_batch_end(proof);
        let verifier: &dyn ProofVerifier = match proof.proof_kind {
            ProofKind::Native => &self.transparent,
            ProofKind::WrappedSuccinct => &self.succinct,
        };
        debug_assert_eq!(verifier.kind(), proof.proof_kind);
        let outcome = verifier.verify(proof, &start, &end)?;
        Ok((end, outcome))
    }
}
