//! Groth16 envelopes carried in wrapped batch proofs.

use ark_bw6_761::BW6_761;
use ark_groth16::{Groth16, Proof, ProvingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize, Compress, Validate};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::circuit::{public_inputs, TransitionCircuit};
use crate::error::VerifyErrorKind;
use crate::setup::VerifierKeys;
use crate::types::{serde_hex, ChainState, ProofKind};

type Reduction = ark_groth16::r1cs_to_qap::LibsnarkReduction;

/// Decoded `proof_bytes` of a wrapped batch proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedEnvelope {
    /// Compressed Groth16 proof.
    #[serde(with = "serde_hex")]
    pub groth16: Vec<u8>,
}

impl WrappedEnvelope {
    /// Proves `circuit` under `key` and wraps the result.
    pub fn prove<R: RngCore>(
        circuit: TransitionCircuit,
        key: &ProvingKey<BW6_761>,
        rng: &mut R,
    ) -> Result<Self, String> {
        let proof = Groth16::<BW6_761, Reduction>::create_random_proof_with_reduction(
            circuit, key, rng,
        )
        .map_err(|e| format!("proof generation failed: {e}"))?;
        let mut groth16 = Vec::new();
        proof
            .serialize_with_mode(&mut groth16, Compress::Yes)
            .map_err(|e| format!("proof encoding failed: {e}"))?;
        Ok(Self { groth16 })
    }

    /// Encoded form carried in `BatchProof::proof_bytes`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VerifyErrorKind> {
        serde_json::from_slice(bytes)
            .map_err(|e| VerifyErrorKind::ProofInvalid(format!("malformed wrapped proof: {e}")))
    }

    /// Checks the Groth16 proof for a transition from `start` to `end`.
    pub fn verify(
        &self,
        keys: &VerifierKeys,
        start: &ChainState,
        end: &ChainState,
    ) -> Result<(), VerifyErrorKind> {
        let proof = Proof::<BW6_761>::deserialize_with_mode(
            self.groth16.as_slice(),
            Compress::Yes,
            Validate::Yes,
        )
        .map_err(|e| VerifyErrorKind::ProofInvalid(format!("proof decode failed: {e}")))?;
        let inputs = public_inputs(ProofKind::WrappedSuccinct, start, end);
        match Groth16::<BW6_761, Reduction>::verify_proof(&keys.transition, &proof, &inputs) {
            Ok(true) => Ok(()),
            Ok(false) => Err(VerifyErrorKind::ProofInvalid(
                "groth16 pairing check failed".into(),
            )),
            Err(e) => Err(VerifyErrorKind::ProofInvalid(format!(
                "groth16 verification error: {e}"
            ))),
        }
    }
}
