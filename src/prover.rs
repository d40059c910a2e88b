//! Off-chain proving pipeline.
//!
//! [`ProvingPipeline::prove`] checks a run of certificates natively, builds
//! the execution trace, and emits a [`BatchProof`] of the requested kind.
//! Work is bounded by the configured batch size and deadline, and can be
//! cancelled from another thread through a [`CancellationToken`].  A proof
//! finished after the deadline is discarded rather than returned.
//!
//! Wrapped proofs keep their circuit witnesses in a bounded cache keyed by
//! statement digest; aggregation re-proves the concatenated witnesses, so it
//! only accepts wrapped proofs this pipeline produced recently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::circuit::{CircuitStep, TransitionCircuit};
use crate::error::{ProveError, VerifyErrorKind};
use crate::native::{verify_certificate, StepWitness};
use crate::setup::SetupParameters;
use crate::trace::TraceRow;
use crate::transparent::TransparentProof;
use crate::types::{
    statement_digest, BatchProof, ChainState, Digest, ProofKind, QuorumCertificate, ValidatorSet,
};
use crate::wrapped::WrappedEnvelope;

/// Wrapped statements whose witnesses stay available for aggregation.
pub const WITNESS_CACHE_CAPACITY: usize = 64;

/// Limits applied to every proving call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProverConfig {
    /// Most certificates (or proofs, when aggregating) per call.
    pub max_batch: usize,
    /// Wall-clock budget per call, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            max_batch: 256,
            timeout_ms: 120_000,
        }
    }
}

/// Shared flag that stops an in-flight proving call at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct Deadline<'a> {
    started: Instant,
    budget: Duration,
    cancel: &'a CancellationToken,
}

impl Deadline<'_> {
    pub(crate) fn check(&self) -> Result<(), ProveError> {
        if self.cancel.is_cancelled() {
            return Err(ProveError::Cancelled);
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.budget {
            return Err(ProveError::ProvingTimeout {
                elapsed_ms: elapsed.as_millis(),
            });
        }
        Ok(())
    }

    pub(crate) fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Circuit steps of recent wrapped proofs, oldest evicted first.
#[derive(Debug, Default)]
pub(crate) struct WitnessCache {
    steps: HashMap<Digest, Vec<CircuitStep>>,
    order: VecDeque<Digest>,
}

impl WitnessCache {
    fn insert(&mut self, statement: Digest, steps: Vec<CircuitStep>) {
        if self.steps.insert(statement, steps).is_none() {
            self.order.push_back(statement);
        }
        while self.order.len() > WITNESS_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.steps.remove(&oldest);
            }
        }
    }

    fn get(&self, statement: &Digest) -> Option<&Vec<CircuitStep>> {
        self.steps.get(statement)
    }
}

/// Builds batch proofs from certificates.
#[derive(Debug, Clone, Default)]
pub struct ProvingPipeline {
    pub(crate) config: ProverConfig,
    pub(crate) setup: Option<Arc<SetupParameters>>,
    cancel: CancellationToken,
    witnesses: Arc<Mutex<WitnessCache>>,
}

impl ProvingPipeline {
    /// Pipeline without wrapped-proof parameters.
    pub fn new(config: ProverConfig) -> Self {
        Self {
            config,
            setup: None,
            cancel: CancellationToken::default(),
            witnesses: Arc::default(),
        }
    }

    /// Adds structured-setup parameters, enabling wrapped proofs.
    pub fn with_setup(mut self, setup: Arc<SetupParameters>) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Active limits.
    pub fn config(&self) -> &ProverConfig {
        &self.config
    }

    /// Token that cancels calls on this pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn deadline(&self) -> Deadline<'_> {
        Deadline {
            started: Instant::now(),
            budget: Duration::from_millis(self.config.timeout_ms),
            cancel: &self.cancel,
        }
    }

    pub(crate) fn require_setup(&self) -> Result<&SetupParameters, ProveError> {
        self.setup
            .as_deref()
            .ok_or_else(|| ProveError::SetupMissing("no structured setup configured".into()))
    }

    pub(crate) fn remember(&self, statement: Digest, steps: Vec<CircuitStep>) {
        self.witnesses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(statement, steps);
    }

    pub(crate) fn recall(&self, statement: &Digest) -> Option<Vec<CircuitStep>> {
        self.witnesses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(statement)
            .cloned()
    }

    /// Proves `steps` from `start` to `end` under the transition key and
    /// returns the encoded envelope.
    pub(crate) fn prove_wrapped(
        &self,
        setup: &SetupParameters,
        start: &ChainState,
        end: &ChainState,
        steps: Vec<CircuitStep>,
    ) -> Result<Vec<u8>, ProveError> {
        if steps.len() > setup.shape.max_steps {
            return Err(ProveError::ResourceExhausted(format!(
                "{} certificates exceed the circuit's {} steps",
                steps.len(),
                setup.shape.max_steps
            )));
        }
        let circuit = TransitionCircuit::new(setup.shape, *start, *end, steps);
        WrappedEnvelope::prove(circuit, &setup.transition, &mut rand::thread_rng())
            .map_err(ProveError::Backend)?
            .to_bytes()
            .map_err(|e| ProveError::Backend(e.to_string()))
    }

    /// Proves `certificates` as a continuation of `anchor`.
    ///
    /// `known_sets` must contain the anchor's active set and pending set, if
    /// any; sets announced inside the batch are picked up on the way.
    pub fn prove(
        &self,
        anchor: &ChainState,
        known_sets: &[ValidatorSet],
        certificates: &[QuorumCertificate],
        kind: ProofKind,
    ) -> Result<BatchProof, ProveError> {
        let span = info_span!("prove", %kind, certificates = certificates.len());
        let _enter = span.enter();
        let clock = self.deadline();

        if certificates.is_empty() {
            return Err(ProveError::EmptyBatch);
        }
        if certificates.len() > self.config.max_batch {
            return Err(ProveError::ResourceExhausted(format!(
                "{} certificates exceed the batch limit of {}",
                certificates.len(),
                self.config.max_batch
            )));
        }
        let setup = match kind {
            ProofKind::Native => None,
            ProofKind::WrappedSuccinct => {
                let setup = self.require_setup()?;
                if certificates.len() > setup.shape.max_steps {
                    return Err(ProveError::ResourceExhausted(format!(
                        "{} certificates exceed the circuit's {} steps",
                        certificates.len(),
                        setup.shape.max_steps
                    )));
                }
                Some(setup)
            }
        };

        // Contiguity first; it is cheap and decides every pre-state.
        let mut registry: HashMap<Digest, ValidatorSet> = known_sets
            .iter()
            .map(|s| (s.commitment(), s.clone()))
            .collect();
        let mut pre_states = Vec::with_capacity(certificates.len());
        let mut state = *anchor;
        for (index, qc) in certificates.iter().enumerate() {
            let li = &qc.ledger_info;
            let signing_set =
                state
                    .signing_set_for(li.epoch, li.height)
                    .ok_or(ProveError::ChainGap {
                        index,
                        epoch: li.epoch,
                        height: li.height,
                    })?;
            if let Some(next) = &li.next_validator_set {
                registry.insert(next.commitment(), next.clone());
            }
            pre_states.push(state);
            state = state.advance(
                li.epoch,
                li.height,
                li.state_root,
                signing_set,
                li.next_set_commitment(),
            );
        }
        let end = state;
        clock.check()?;

        let witnesses = check_all(&pre_states, certificates, &registry);
        let mut rows = Vec::with_capacity(certificates.len());
        let mut used_sets: Vec<ValidatorSet> = Vec::new();
        let mut seen: Vec<Digest> = Vec::new();
        for (index, (qc, witness)) in certificates.iter().zip(witnesses).enumerate() {
            let witness = witness.map_err(|kind| ProveError::Rejected { index, kind })?;
            if !seen.contains(&witness.signing_set) {
                seen.push(witness.signing_set);
                if let Some(set) = registry.get(&witness.signing_set) {
                    used_sets.push(set.clone());
                }
            }
            rows.push(TraceRow::from_certificate(
                &qc.ledger_info,
                &qc.signer_mask,
                &qc.aggregate_signature,
                &witness,
            ));
        }
        clock.check()?;

        let public_inputs = anchor.public_inputs_to(&end);
        let statement = statement_digest(
            kind,
            (anchor.head.epoch, anchor.head.height),
            (end.head.epoch, end.head.height),
            &public_inputs,
        );
        let proof_bytes = match setup {
            None => TransparentProof::prove(&statement, anchor, &rows, used_sets)
                .map_err(|(index, kind)| ProveError::Rejected { index, kind })?
                .to_bytes()
                .map_err(|e| ProveError::Backend(e.to_string()))?,
            Some(setup) => {
                let mut steps = Vec::with_capacity(rows.len());
                for (qc, row) in certificates.iter().zip(&rows) {
                    let set = registry
                        .get(&row.signing_set)
                        .ok_or_else(|| ProveError::Backend("signing set vanished".into()))?;
                    if set.len() > setup.shape.max_validators {
                        return Err(ProveError::ResourceExhausted(format!(
                            "set of {} validators exceeds the circuit's {}",
                            set.len(),
                            setup.shape.max_validators
                        )));
                    }
                    steps.push(CircuitStep::from_certificate(qc, set));
                }
                let bytes = self.prove_wrapped(setup, anchor, &end, steps.clone())?;
                self.remember(statement, steps);
                bytes
            }
        };
        // A late proof is discarded, not returned.
        clock.check()?;

        info!(
            elapsed_ms = clock.elapsed_ms() as u64,
            end_epoch = end.head.epoch,
            end_height = end.head.height,
            bytes = proof_bytes.len(),
            "batch proven"
        );
        Ok(BatchProof {
            start_epoch: anchor.head.epoch,
            start_height: anchor.head.height,
            end_epoch: end.head.epoch,
            end_height: end.head.height,
            public_inputs,
            proof_bytes,
            proof_kind: kind,
        })
    }
}

fn check_all(
    pre_states: &[ChainState],
    certificates: &[QuorumCertificate],
    registry: &HashMap<Digest, ValidatorSet>,
) -> Vec<Result<StepWitness, VerifyErrorKind>> {
    let check = |(state, qc): (&ChainState, &QuorumCertificate)| {
        verify_certificate(state, qc, registry).map(|(_, witness)| witness)
    };
    #[cfg(not(target_arch = "wasm32"))]
    let out: Vec<_> = pre_states.par_iter().zip(certificates.par_iter()).map(check).collect();
    #[cfg(target_arch = "wasm32")]
    let out: Vec<_> = pre_states.iter().zip(certificates.iter()).map(check).collect();
    debug!(certificates = out.len(), "certificates checked");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::shared_test_setup;
    use crate::simulate::Committee;
    use crate::verifier::DualProofVerifier;

    fn committee() -> Committee {
        Committee::new(b"prover", &[1, 1, 1, 1])
    }

    fn certificates(c: &Committee, heights: &[u64]) -> Vec<QuorumCertificate> {
        heights
            .iter()
            .map(|&h| c.certify(c.ledger_info(0, h, None), &[0, 1, 2]))
            .collect()
    }

    #[test]
    fn native_batch_verifies_from_the_anchor() {
        let c = committee();
        let pipeline = ProvingPipeline::new(ProverConfig::default());
        let anchor = c.genesis_state();
        let proof = pipeline
            .prove(&anchor, &[c.set().clone()], &certificates(&c, &[1, 2, 4]), ProofKind::Native)
            .unwrap();
        assert_eq!((proof.start_height, proof.end_height), (0, 4));
        let (end, outcome) = DualProofVerifier::default().verify(&proof, &anchor).unwrap();
        assert_eq!(end.head.state_root, c.state_root(0, 4));
        assert_eq!(outcome.certificates, Some(3));
    }

    #[test]
    fn empty_and_oversized_batches_are_refused() {
        let c = committee();
        let pipeline = ProvingPipeline::new(ProverConfig {
            max_batch: 2,
            ..ProverConfig::default()
        });
        let anchor = c.genesis_state();
        assert_eq!(
            pipeline.prove(&anchor, &[c.set().clone()], &[], ProofKind::Native),
            Err(ProveError::EmptyBatch)
        );
        assert!(matches!(
            pipeline.prove(
                &anchor,
                &[c.set().clone()],
                &certificates(&c, &[1, 2, 3]),
                ProofKind::Native
            ),
            Err(ProveError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn gap_and_rejection_carry_the_index() {
        let c = committee();
        let pipeline = ProvingPipeline::new(ProverConfig::default());
        let anchor = c.genesis_state();
        assert_eq!(
            pipeline.prove(
                &anchor,
                &[c.set().clone()],
                &certificates(&c, &[2, 1]),
                ProofKind::Native
            ),
            Err(ProveError::ChainGap {
                index: 1,
                epoch: 0,
                height: 1
            })
        );

        let mut qcs = certificates(&c, &[1, 2]);
        qcs[1] = c.certify(c.ledger_info(0, 2, None), &[0, 1]);
        assert!(matches!(
            pipeline.prove(&anchor, &[c.set().clone()], &qcs, ProofKind::Native),
            Err(ProveError::Rejected {
                index: 1,
                kind: VerifyErrorKind::InsufficientQuorum { .. }
            })
        ));
    }

    #[test]
    fn zero_budget_times_out_and_cancellation_stops() {
        let c = committee();
        let anchor = c.genesis_state();
        let qcs = certificates(&c, &[1]);
        let expired = ProvingPipeline::new(ProverConfig {
            timeout_ms: 0,
            ..ProverConfig::default()
        });
        assert!(matches!(
            expired.prove(&anchor, &[c.set().clone()], &qcs, ProofKind::Native),
            Err(ProveError::ProvingTimeout { .. })
        ));

        let pipeline = ProvingPipeline::new(ProverConfig::default());
        let token = pipeline.cancellation_token();
        token.cancel();
        assert_eq!(
            pipeline.prove(&anchor, &[c.set().clone()], &qcs, ProofKind::Native),
            Err(ProveError::Cancelled)
        );
        token.reset();
        assert!(pipeline
            .prove(&anchor, &[c.set().clone()], &qcs, ProofKind::Native)
            .is_ok());
    }

    #[test]
    fn wrapped_needs_a_setup() {
        let c = committee();
        let pipeline = ProvingPipeline::new(ProverConfig::default());
        assert!(matches!(
            pipeline.prove(
                &c.genesis_state(),
                &[c.set().clone()],
                &certificates(&c, &[1]),
                ProofKind::WrappedSuccinct
            ),
            Err(ProveError::SetupMissing(_))
        ));
    }

    #[test]
    fn wrapped_batch_verifies_with_the_matching_keys() {
        let setup = shared_test_setup();
        let keys = Arc::new(setup.verifier_keys());
        let c = committee();
        let pipeline = ProvingPipeline::new(ProverConfig::default()).with_setup(setup);
        let anchor = c.genesis_state();
        let proof = pipeline
            .prove(
                &anchor,
                &[c.set().clone()],
                &certificates(&c, &[1, 3]),
                ProofKind::WrappedSuccinct,
            )
            .unwrap();
        let verifier = DualProofVerifier::new(Some(keys));
        let (end, _) = verifier.verify(&proof, &anchor).unwrap();
        assert_eq!(end.head.height, 3);

        let mut forged = proof.clone();
        forged.public_inputs.new_state_root = [0xab; 32];
        assert!(matches!(
            verifier.verify(&forged, &anchor),
            Err(VerifyErrorKind::ProofInvalid(_))
        ));

        let mut forged = proof.clone();
        forged.end_height = 7;
        assert!(matches!(
            verifier.verify(&forged, &anchor),
            Err(VerifyErrorKind::ProofInvalid(_))
        ));
        assert!(pipeline.recall(&proof.statement_digest()).is_some());
    }

    #[test]
    fn witness_cache_evicts_the_oldest_statement() {
        let pipeline = ProvingPipeline::new(ProverConfig::default());
        for i in 0..=WITNESS_CACHE_CAPACITY {
            pipeline.remember([i as u8; 32], Vec::new());
        }
        assert!(pipeline.recall(&[0; 32]).is_none());
        assert!(pipeline.recall(&[1; 32]).is_some());
        assert!(pipeline
            .recall(&[WITNESS_CACHE_CAPACITY as u8; 32])
            .is_some());
        // Clones share the cache.
        assert!(pipeline.clone().recall(&[1; 32]).is_some());
    }

    #[test]
    fn wrapped_batch_longer_than_the_circuit_is_refused() {
        let c = committee();
        let pipeline =
            ProvingPipeline::new(ProverConfig::default()).with_setup(shared_test_setup());
        assert!(matches!(
            pipeline.prove(
                &c.genesis_state(),
                &[c.set().clone()],
                &certificates(&c, &[1, 2, 3]),
                ProofKind::WrappedSuccinct
            ),
            Err(ProveError::ResourceExhausted(_))
        ));
    }
}
