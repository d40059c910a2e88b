//! Transparent batch proofs.
//!
//! The prover commits to the execution trace with a Merkle root.  The
//! verifier holds the whole trace, recomputes every row from the previous
//! state and checks that the trace ends in the claimed state.  The pairing
//! checks of all rows collapse into one multi-pairing whose row weights come
//! from a transcript seeded with the statement digest and the trace root, so
//! they are fixed only after every signature is.  Nothing is trusted from the
//! prover except the encoded rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VerifyErrorKind;
use crate::merkle::merkle_root;
use crate::trace::{replay, row_digest, TraceRow};
use crate::transcript::Transcript;
use crate::types::{serde_hex, ChainState, Digest, ValidatorSet};

const TRANSCRIPT_DOMAIN: &[u8] = b"QBRIDGE_TRANSPARENT_V2";

/// A transparent proof of a certificate batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransparentProof {
    /// Encoded rows, one per certificate.
    pub trace: Vec<Vec<u64>>,
    /// Every set that signs a row.
    pub validator_sets: Vec<ValidatorSet>,
    /// Merkle root over the row digests.
    #[serde(with = "serde_hex::digest")]
    pub trace_root: Digest,
}

fn row_weights(statement: &Digest, trace_root: &Digest, rows: usize) -> Vec<u128> {
    let mut transcript = Transcript::new(TRANSCRIPT_DOMAIN);
    transcript.append_digest(statement);
    transcript.append_digest(trace_root);
    transcript.append(rows as u64);
    transcript.weights(rows)
}

fn registry(sets: &[ValidatorSet]) -> HashMap<Digest, ValidatorSet> {
    sets.iter().map(|s| (s.commitment(), s.clone())).collect()
}

fn trace_root(trace: &[Vec<u64>]) -> Digest {
    let leaves: Vec<Digest> = trace.iter().map(|cells| row_digest(cells)).collect();
    merkle_root(&leaves)
}

impl TransparentProof {
    /// Proves `rows` as a continuation of `start` under `statement`.
    ///
    /// The rows are replayed before the proof is returned; a failing row is
    /// returned as an error with its index.
    pub fn prove(
        statement: &Digest,
        start: &ChainState,
        rows: &[TraceRow],
        validator_sets: Vec<ValidatorSet>,
    ) -> Result<Self, (usize, VerifyErrorKind)> {
        let trace: Vec<Vec<u64>> = rows.iter().map(TraceRow::to_cells).collect();
        let trace_root = trace_root(&trace);
        let weights = row_weights(statement, &trace_root, rows.len());
        let outcome = replay(start, rows, &registry(&validator_sets), &weights);
        if let Some(failure) = outcome.first_failure {
            return Err(failure);
        }
        debug!(rows = rows.len(), "transparent proof built");
        Ok(Self {
            trace,
            validator_sets,
            trace_root,
        })
    }

    /// Decodes the rows.
    pub fn rows(&self) -> Result<Vec<TraceRow>, VerifyErrorKind> {
        self.trace
            .iter()
            .enumerate()
            .map(|(i, cells)| {
                TraceRow::from_cells(cells)
                    .map_err(|e| VerifyErrorKind::ProofInvalid(format!("row {i}: {e}")))
            })
            .collect()
    }

    /// Verifies the proof as a transition from `start` to `end`.  Returns the
    /// number of certified rows.
    pub fn verify(
        &self,
        statement: &Digest,
        start: &ChainState,
        end: &ChainState,
    ) -> Result<usize, VerifyErrorKind> {
        if self.trace.is_empty() {
            return Err(invalid("empty trace"));
        }
        let rows = self.rows()?;
        if trace_root(&self.trace) != self.trace_root {
            return Err(invalid("trace root does not match the rows"));
        }

        let weights = row_weights(statement, &self.trace_root, rows.len());
        let outcome = replay(start, &rows, &registry(&self.validator_sets), &weights);
        if let Some((index, kind)) = outcome.first_failure {
            debug!(index, error = %kind, "trace row rejected");
            return Err(kind);
        }
        if outcome.end != *end {
            return Err(invalid("trace does not end at the claimed state"));
        }
        Ok(rows.len())
    }

    /// Encoded form carried in `BatchProof::proof_bytes`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VerifyErrorKind> {
        serde_json::from_slice(bytes)
            .map_err(|e| VerifyErrorKind::ProofInvalid(format!("malformed transparent proof: {e}")))
    }
}

fn invalid(reason: &str) -> VerifyErrorKind {
    VerifyErrorKind::ProofInvalid(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::verify_certificate;
    use crate::simulate::Committee;
    use crate::types::{statement_digest, ProofKind};

    struct Batch {
        start: ChainState,
        end: ChainState,
        rows: Vec<TraceRow>,
        sets: Vec<ValidatorSet>,
    }

    fn batch() -> Batch {
        let first = Committee::new(b"first", &[1, 1, 1, 1]);
        let second = Committee::new(b"second", &[2, 2, 2]);
        let mut sets = first.registry();
        sets.extend(second.registry());
        let start = first.genesis_state();
        let qcs = [
            first.certify(first.ledger_info(0, 1, None), &[0, 1, 2]),
            first.certify(first.ledger_info(0, 2, Some(second.set().clone())), &[1, 2, 3]),
            second.certify(second.ledger_info(1, 0, None), &[0, 1]),
        ];
        let mut state = start;
        let mut rows = Vec::new();
        for qc in &qcs {
            let (next, witness) = verify_certificate(&state, qc, &sets).unwrap();
            rows.push(TraceRow::from_certificate(
                &qc.ledger_info,
                &qc.signer_mask,
                &qc.aggregate_signature,
                &witness,
            ));
            state = next;
        }
        Batch {
            start,
            end: state,
            rows,
            sets: vec![first.set().clone(), second.set().clone()],
        }
    }

    fn statement(b: &Batch) -> Digest {
        statement_digest(
            ProofKind::Native,
            (b.start.head.epoch, b.start.head.height),
            (b.end.head.epoch, b.end.head.height),
            &b.start.public_inputs_to(&b.end),
        )
    }

    #[test]
    fn proof_across_an_epoch_change_verifies() {
        let b = batch();
        let stmt = statement(&b);
        let proof = TransparentProof::prove(&stmt, &b.start, &b.rows, b.sets.clone()).unwrap();
        assert_eq!(proof.verify(&stmt, &b.start, &b.end), Ok(3));

        let bytes = proof.to_bytes().unwrap();
        let decoded = TransparentProof::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn wrong_end_state_is_rejected() {
        let b = batch();
        let stmt = statement(&b);
        let proof = TransparentProof::prove(&stmt, &b.start, &b.rows, b.sets.clone()).unwrap();
        let mut end = b.end;
        end.head.state_root = [7; 32];
        assert!(matches!(
            proof.verify(&stmt, &b.start, &end),
            Err(VerifyErrorKind::ProofInvalid(_))
        ));
    }

    #[test]
    fn row_weights_follow_the_statement_and_root() {
        let b = batch();
        let stmt = statement(&b);
        let proof = TransparentProof::prove(&stmt, &b.start, &b.rows, b.sets.clone()).unwrap();
        let weights = row_weights(&stmt, &proof.trace_root, 3);
        let mut other = stmt;
        other[0] ^= 1;
        assert_ne!(weights, row_weights(&other, &proof.trace_root, 3));
        assert_ne!(weights, row_weights(&stmt, &[0; 32], 3));
        assert!(weights.iter().all(|&w| w != 0));
    }

    #[test]
    fn cancelling_signatures_are_rejected() {
        use ark_ec::CurveGroup;
        use ark_serialize::CanonicalSerialize;

        let b = batch();
        let stmt = statement(&b);
        let offset = crate::bls::hash_to_g1(b"offset", b"offset").unwrap();
        let mut rows = b.rows.clone();
        for (row, delta) in rows.iter_mut().zip([offset, -offset]) {
            let point = crate::bls::Signature::from_bytes(&row.signature)
                .unwrap()
                .point()
                + delta;
            point
                .into_affine()
                .serialize_compressed(&mut row.signature[..])
                .unwrap();
        }
        let trace: Vec<Vec<u64>> = rows.iter().map(TraceRow::to_cells).collect();
        let proof = TransparentProof {
            trace_root: trace_root(&trace),
            trace,
            validator_sets: b.sets.clone(),
        };
        assert_eq!(
            proof.verify(&stmt, &b.start, &b.end),
            Err(VerifyErrorKind::SignatureInvalid)
        );
        assert!(TransparentProof::prove(&stmt, &b.start, &rows, b.sets).is_err());
    }

    #[test]
    fn missing_validator_set_fails_the_replay() {
        let b = batch();
        let stmt = statement(&b);
        let mut proof = TransparentProof::prove(&stmt, &b.start, &b.rows, b.sets.clone()).unwrap();
        proof.validator_sets.truncate(1);
        assert_eq!(
            proof.verify(&stmt, &b.start, &b.end),
            Err(VerifyErrorKind::UnknownValidatorSet)
        );
    }

    #[test]
    fn edited_cell_changes_the_root() {
        let b = batch();
        let stmt = statement(&b);
        let mut proof = TransparentProof::prove(&stmt, &b.start, &b.rows, b.sets.clone()).unwrap();
        proof.trace[0][6] ^= 1;
        assert!(matches!(
            proof.verify(&stmt, &b.start, &b.end),
            Err(VerifyErrorKind::ProofInvalid(_))
        ));
    }

    #[test]
    fn prover_refuses_an_invalid_row() {
        let b = batch();
        let mut rows = b.rows.clone();
        rows[1].signed_power = 1;
        let stmt = statement(&b);
        let err = TransparentProof::prove(&stmt, &b.start, &rows, b.sets).unwrap_err();
        assert_eq!(err.0, 1);
    }
}
