//! Aggregation of contiguous batch proofs.
//!
//! Every input proof is verified before anything is combined.  Transparent
//! proofs are merged by concatenating their traces and re-proving.  Wrapped
//! proofs are merged the same way: the certificate witnesses each input was
//! proven from are concatenated and proven again by the transition circuit,
//! so the result carries the same signature checks as its inputs.

use tracing::{info, info_span};

use crate::error::ProveError;
use crate::prover::ProvingPipeline;
use crate::transparent::TransparentProof;
use crate::types::{statement_digest, BatchProof, ChainState, ProofKind, ValidatorSet};
use crate::verifier::DualProofVerifier;

impl ProvingPipeline {
    /// Combines contiguous proofs of one kind into a single proof over their
    /// union.
    pub fn aggregate(&self, proofs: &[BatchProof]) -> Result<BatchProof, ProveError> {
        let span = info_span!("aggregate", proofs = proofs.len());
        let _enter = span.enter();
        let clock = self.deadline();

        let (first, last) = match (proofs.first(), proofs.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ProveError::EmptyBatch),
        };
        let kind = first.proof_kind;
        if proofs.iter().any(|p| p.proof_kind != kind) {
            return Err(ProveError::MixedProofKind);
        }
        for (index, pair) in proofs.windows(2).enumerate() {
            if ChainState::from_batch_start(&pair[1]) != ChainState::from_batch_end(&pair[0]) {
                return Err(ProveError::NonContiguousBatch { index: index + 1 });
            }
        }
        if proofs.len() > self.config.max_batch {
            return Err(ProveError::ResourceExhausted(format!(
                "{} proofs exceed the batch limit of {}",
                proofs.len(),
                self.config.max_batch
            )));
        }
        let setup = match kind {
            ProofKind::Native => None,
            ProofKind::WrappedSuccinct => Some(self.require_setup()?),
        };

        let verifier = DualProofVerifier::new(
            setup.map(|s| std::sync::Arc::new(s.verifier_keys())),
        );
        for (index, proof) in proofs.iter().enumerate() {
            clock.check()?;
            verifier
                .verify(proof, &ChainState::from_batch_start(proof))
                .map_err(|kind| ProveError::InvalidInnerProof {
                    index,
                    reason: kind.to_string(),
                })?;
        }

        let start = ChainState::from_batch_start(first);
        let end = ChainState::from_batch_end(last);
        let public_inputs = start.public_inputs_to(&end);
        let proof_bytes = match setup {
            None => {
                let mut rows = Vec::new();
                let mut sets: Vec<ValidatorSet> = Vec::new();
                for proof in proofs {
                    let inner = TransparentProof::from_bytes(&proof.proof_bytes).map_err(|e| {
                        ProveError::Backend(e.to_string())
                    })?;
                    rows.extend(inner.rows().map_err(|e| ProveError::Backend(e.to_string()))?);
                    for set in inner.validator_sets {
                        if !sets.contains(&set) {
                            sets.push(set);
                        }
                    }
                }
                let statement = statement_digest(
                    kind,
                    (start.head.epoch, start.head.height),
                    (end.head.epoch, end.head.height),
                    &public_inputs,
                );
                clock.check()?;
                TransparentProof::prove(&statement, &start, &rows, sets)
                    .map_err(|(index, kind)| ProveError::Rejected { index, kind })?
                    .to_bytes()
                    .map_err(|e| ProveError::Backend(e.to_string()))?
            }
            Some(setup) => {
                let mut steps = Vec::new();
                for (index, proof) in proofs.iter().enumerate() {
                    let inner = self
                        .recall(&proof.statement_digest())
                        .ok_or(ProveError::MissingWitness { index })?;
                    steps.extend(inner);
                }
                clock.check()?;
                let statement = statement_digest(
                    kind,
                    (start.head.epoch, start.head.height),
                    (end.head.epoch, end.head.height),
                    &public_inputs,
                );
                let bytes = self.prove_wrapped(setup, &start, &end, steps.clone())?;
                self.remember(statement, steps);
                bytes
            }
        };
        clock.check()?;

        info!(
            elapsed_ms = clock.elapsed_ms() as u64,
            end_epoch = end.head.epoch,
            end_height = end.head.height,
            "proofs aggregated"
        );
        Ok(BatchProof {
            start_epoch: start.head.epoch,
            start_height: start.head.height,
            end_epoch: end.head.epoch,
            end_height: end.head.height,
            public_inputs,
            proof_bytes,
            proof_kind: kind,
        })
    }
}
