//! Deterministic validator committees.
//!
//! Used by the demo binary and by tests to produce certificates without a
//! live source chain.  Keys are derived from a seed, so two committees built
//! from the same seed and powers are identical.

use std::collections::HashMap;

use blake2::digest::{consts::U32, Digest as _};

use crate::bls::{SecretKey, Signature};
use crate::types::{
    ChainState, Digest, LedgerInfo, QuorumCertificate, SignerMask, ValidatorInfo, ValidatorSet,
    VerifiedHead,
};

type Blake2b256 = blake2::Blake2b<U32>;

/// A validator set together with its signing keys.
#[derive(Debug, Clone)]
pub struct Committee {
    seed: Vec<u8>,
    keys: Vec<SecretKey>,
    set: ValidatorSet,
}

impl Committee {
    /// Derives `powers.len()` validators from `seed`.
    ///
    /// # Panics
    ///
    /// Panics if `powers` is empty or contains a zero.
    pub fn new(seed: &[u8], powers: &[u64]) -> Self {
        let keys: Vec<SecretKey> = (0..powers.len())
            .map(|i| {
                let mut material = seed.to_vec();
                material.extend_from_slice(&(i as u64).to_be_bytes());
                SecretKey::from_seed(&material)
            })
            .collect();
        let members = keys
            .iter()
            .zip(powers)
            .enumerate()
            .map(|(i, (sk, &power))| {
                ValidatorInfo::new(
                    format!("{}-{i}", hex::encode(seed)),
                    sk.public_key(),
                    power,
                )
            })
            .collect();
        let set = ValidatorSet::new(members).expect("committee powers must be non-zero");
        Self {
            seed: seed.to_vec(),
            keys,
            set,
        }
    }

    /// The public validator set.
    pub fn set(&self) -> &ValidatorSet {
        &self.set
    }

    /// State root the simulated chain reports at `(epoch, height)`.
    pub fn state_root(&self, epoch: u64, height: u64) -> Digest {
        let mut hasher = Blake2b256::new();
        hasher.update(b"state");
        hasher.update(&self.seed);
        hasher.update(epoch.to_be_bytes());
        hasher.update(height.to_be_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// A ledger info at `(epoch, height)`, optionally announcing `next`.
    pub fn ledger_info(&self, epoch: u64, height: u64, next: Option<ValidatorSet>) -> LedgerInfo {
        let mut consensus = self.state_root(epoch, height);
        consensus.reverse();
        LedgerInfo {
            epoch,
            height,
            state_root: self.state_root(epoch, height),
            consensus_digest: consensus,
            next_validator_set: next,
        }
    }

    /// Signs `ledger_info` with the members at `signers`.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be hashed to G1.
    pub fn certify(&self, ledger_info: LedgerInfo, signers: &[usize]) -> QuorumCertificate {
        let message = ledger_info.signing_message();
        let signatures: Vec<Signature> = signers
            .iter()
            .filter_map(|&i| self.keys.get(i))
            .map(|sk| sk.sign(&message).expect("hash to curve"))
            .collect();
        QuorumCertificate {
            ledger_info,
            signer_mask: SignerMask::from_indices(self.set.len(), signers),
            aggregate_signature: Signature::aggregate(&signatures),
        }
    }

    /// Signs with every member.
    pub fn certify_all(&self, ledger_info: LedgerInfo) -> QuorumCertificate {
        let all: Vec<usize> = (0..self.set.len()).collect();
        self.certify(ledger_info, &all)
    }

    /// Genesis at epoch 0, height 0, with this committee active.
    pub fn genesis_state(&self) -> ChainState {
        ChainState {
            head: VerifiedHead {
                epoch: 0,
                height: 0,
                state_root: self.state_root(0, 0),
                validator_set_commitment: self.set.commitment(),
            },
            pending_set: None,
        }
    }

    /// The genesis ledger info matching [`Self::genesis_state`].
    pub fn genesis_ledger_info(&self) -> LedgerInfo {
        self.ledger_info(0, 0, None)
    }

    /// A registry holding only this committee's set.
    pub fn registry(&self) -> HashMap<Digest, ValidatorSet> {
        HashMap::from([(self.set.commitment(), self.set.clone())])
    }
}
