//! The verification engine: owner of the verified head.
//!
//! [`VerificationEngine`] is initialised once from a trusted genesis and only
//! ever moves forward.  Certificates go through [`verify_and_advance`] and
//! batch proofs through [`submit`]; both check the input against the current
//! state without touching it and commit the resulting state in one
//! assignment, so a rejected call leaves the engine bit-for-bit unchanged.
//!
//! The registry of validator sets is bounded to the active set and the set
//! pending for the next epoch.  Sets disclosed by a certificate or a
//! transparent proof are registered on acceptance; sets behind a wrapped
//! proof must be supplied through [`register_validator_set`].
//!
//! [`verify_and_advance`]: VerificationEngine::verify_and_advance
//! [`submit`]: VerificationEngine::submit
//! [`register_validator_set`]: VerificationEngine::register_validator_set

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span};

use crate::checkpoint::{write_checkpoint, CheckpointError, EngineCheckpoint};
use crate::error::{VerifyError, VerifyErrorKind};
use crate::native::verify_certificate;
use crate::setup::VerifierKeys;
use crate::types::{
    BatchProof, ChainState, Digest, LedgerInfo, ProofKind, PublicInputs, QuorumCertificate,
    ValidatorSet, VerifiedHead,
};
use crate::verifier::DualProofVerifier;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of accepted updates kept for diagnostics.
    pub window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { window: 64 }
    }
}

/// How an update reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    /// A single quorum certificate.
    Certificate,
    /// A batch proof of the given kind.
    Proof(ProofKind),
}

/// One accepted update, as kept in the history window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedUpdate {
    /// Entry point that accepted it.
    pub source: UpdateSource,
    /// Head after the update.
    pub head: VerifiedHead,
    /// Transition it established.
    pub public_inputs: PublicInputs,
}

/// Metadata about one accepted batch proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Algorithm that verified the proof.
    pub kind: ProofKind,
    /// Head before the proof.
    pub previous: VerifiedHead,
    /// Head after the proof.
    pub head: VerifiedHead,
    /// Certificates covered; `None` when the proof does not reveal it.
    pub certificates: Option<usize>,
    /// Time spent verifying, in microseconds.
    pub elapsed_us: u64,
}

/// Single owner of the verified head and the sets needed to extend it.
#[derive(Debug)]
pub struct VerificationEngine {
    state: ChainState,
    sets: HashMap<Digest, ValidatorSet>,
    history: VecDeque<AcceptedUpdate>,
    config: EngineConfig,
    verifier: DualProofVerifier,
}

impl VerificationEngine {
    /// Starts from a trusted genesis ledger info certified by `set`.
    ///
    /// The genesis is not verified.  If it names a next validator set, that
    /// set is pending from the start.
    pub fn genesis(ledger_info: &LedgerInfo, set: ValidatorSet, config: EngineConfig) -> Self {
        let state = ChainState {
            head: VerifiedHead {
                epoch: ledger_info.epoch,
                height: ledger_info.height,
                state_root: ledger_info.state_root,
                validator_set_commitment: set.commitment(),
            },
            pending_set: ledger_info.next_set_commitment(),
        };
        let mut sets = HashMap::from([(set.commitment(), set)]);
        if let Some(next) = &ledger_info.next_validator_set {
            sets.insert(next.commitment(), next.clone());
        }
        info!(
            epoch = state.head.epoch,
            height = state.head.height,
            validator_set = %hex::encode(state.head.validator_set_commitment),
            "engine initialised from genesis"
        );
        Self {
            state,
            sets,
            history: VecDeque::new(),
            config,
            verifier: DualProofVerifier::default(),
        }
    }

    /// Rebuilds an engine from a checkpoint.
    pub fn restore(checkpoint: EngineCheckpoint, config: EngineConfig) -> Result<Self, CheckpointError> {
        checkpoint.validate()?;
        let sets = checkpoint
            .validator_sets
            .into_iter()
            .map(|set| (set.commitment(), set))
            .collect();
        let mut history: VecDeque<AcceptedUpdate> = checkpoint.history.into();
        while history.len() > config.window {
            history.pop_front();
        }
        info!(
            epoch = checkpoint.state.head.epoch,
            height = checkpoint.state.head.height,
            "engine restored from checkpoint"
        );
        Ok(Self {
            state: checkpoint.state,
            sets,
            history,
            config,
            verifier: DualProofVerifier::default(),
        })
    }

    /// Enables wrapped-proof verification with `keys`.
    pub fn with_verifier_keys(mut self, keys: Arc<VerifierKeys>) -> Self {
        self.verifier = DualProofVerifier::new(Some(keys));
        self
    }

    /// Latest verified head.
    pub fn head(&self) -> VerifiedHead {
        self.state.head
    }

    /// Head plus pending set.
    pub fn chain_state(&self) -> ChainState {
        self.state
    }

    /// The set that certified the head, if registered.
    pub fn active_validator_set(&self) -> Option<&ValidatorSet> {
        self.sets.get(&self.state.head.validator_set_commitment)
    }

    /// The set committed for the next epoch, if any and registered.
    pub fn pending_validator_set(&self) -> Option<&ValidatorSet> {
        self.state.pending_set.and_then(|c| self.sets.get(&c))
    }

    /// Public inputs of the most recent accepted update.
    pub fn last_public_inputs(&self) -> Option<&PublicInputs> {
        self.history.back().map(|u| &u.public_inputs)
    }

    /// Accepted updates in the window, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &AcceptedUpdate> {
        self.history.iter()
    }

    /// All registered sets.
    pub fn known_sets(&self) -> Vec<ValidatorSet> {
        self.sets.values().cloned().collect()
    }

    /// `true` if wrapped proofs can be verified.
    pub fn accepts_wrapped(&self) -> bool {
        self.verifier.accepts_wrapped()
    }

    /// Supplies the full set behind the active or pending commitment.
    ///
    /// Any other set fails with `UnknownValidatorSet`.  Returns `true` if the
    /// set was not registered before.
    pub fn register_validator_set(&mut self, set: ValidatorSet) -> Result<bool, VerifyError> {
        let commitment = set.commitment();
        if commitment != self.state.head.validator_set_commitment
            && Some(commitment) != self.state.pending_set
        {
            return Err(self.reject(VerifyErrorKind::UnknownValidatorSet));
        }
        let fresh = self.sets.insert(commitment, set).is_none();
        if fresh {
            debug!(validator_set = %hex::encode(commitment), "validator set registered");
        }
        Ok(fresh)
    }

    /// Verifies `qc` against the head and advances on success.
    pub fn verify_and_advance(&mut self, qc: &QuorumCertificate) -> Result<VerifiedHead, VerifyError> {
        let li = &qc.ledger_info;
        let span = info_span!("verify_certificate", epoch = li.epoch, height = li.height);
        let _enter = span.enter();

        let (next, _) = verify_certificate(&self.state, qc, &self.sets)
            .map_err(|kind| self.reject(kind))?;
        let public_inputs = self.state.public_inputs_to(&next);
        self.commit(
            next,
            UpdateSource::Certificate,
            public_inputs,
            li.next_validator_set.iter().cloned(),
        );
        Ok(self.state.head)
    }

    /// Verifies `proof` against the head and advances on success.
    pub fn submit(&mut self, proof: &BatchProof) -> Result<VerifiedHead, VerifyError> {
        self.submit_with_report(proof).map(|report| report.head)
    }

    /// As [`Self::submit`], returning what the verification established.
    pub fn submit_with_report(&mut self, proof: &BatchProof) -> Result<VerificationReport, VerifyError> {
        let span = info_span!(
            "submit",
            kind = %proof.proof_kind,
            end_epoch = proof.end_epoch,
            end_height = proof.end_height
        );
        let _enter = span.enter();
        let started = Instant::now();

        let (next, outcome) = self
            .verifier
            .verify(proof, &self.state)
            .map_err(|kind| self.reject(kind))?;
        let elapsed_us = started.elapsed().as_micros() as u64;
        let previous = self.state.head;
        self.commit(
            next,
            UpdateSource::Proof(proof.proof_kind),
            proof.public_inputs,
            outcome.disclosed_sets,
        );
        Ok(VerificationReport {
            kind: proof.proof_kind,
            previous,
            head: self.state.head,
            certificates: outcome.certificates,
            elapsed_us,
        })
    }

    /// Snapshot of the current state.
    pub fn checkpoint(&self) -> EngineCheckpoint {
        let mut sets: Vec<ValidatorSet> = self.sets.values().cloned().collect();
        sets.sort_by_key(ValidatorSet::commitment);
        EngineCheckpoint::new(self.state, sets, self.history.iter().cloned().collect())
    }

    /// Writes [`Self::checkpoint`] into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<PathBuf, CheckpointError> {
        let path = write_checkpoint(dir, &self.checkpoint())?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(path)
    }

    fn reject(&self, kind: VerifyErrorKind) -> VerifyError {
        let err = VerifyError::new(kind, self.state.head);
        err.log();
        err
    }

    fn commit(
        &mut self,
        next: ChainState,
        source: UpdateSource,
        public_inputs: PublicInputs,
        disclosed: impl IntoIterator<Item = ValidatorSet>,
    ) {
        let position = |s: &ChainState| (s.head.epoch, s.head.height);
        let advanced = position(&next) > position(&self.state);
        if !advanced {
            error!(
                from = ?position(&self.state),
                to = ?position(&next),
                "verified update does not advance the head"
            );
        }
        assert!(advanced, "verified update must advance the head");

        let mut sets = std::mem::take(&mut self.sets);
        for set in disclosed {
            sets.entry(set.commitment()).or_insert(set);
        }
        sets.retain(|commitment, _| {
            *commitment == next.head.validator_set_commitment || Some(*commitment) == next.pending_set
        });

        self.state = next;
        self.sets = sets;
        self.history.push_back(AcceptedUpdate {
            source,
            head: next.head,
            public_inputs,
        });
        while self.history.len() > self.config.window {
            self.history.pop_front();
        }
        info!(
            epoch = next.head.epoch,
            height = next.head.height,
            pending = next.pending_set.is_some(),
            ?source,
            "head advanced"
        );
    }
}
