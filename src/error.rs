//! Error taxonomy shared by the verifiers and the proving pipeline.
//!
//! Every error kind belongs to one [`ErrorClass`].  Protocol violations
//! reject an input for good, staleness is resolved by re-deriving against the
//! current head, and resource failures are operational.  Soundness faults
//! never surface as values: they are assertion failures.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::VerifiedHead;

/// Coarse classification driving retry policy and log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The input is invalid and must not be retried.
    Protocol,
    /// The input was built against an outdated head.
    Stale,
    /// Capacity or provisioning problem; retry after adjusting.
    Resource,
}

/// Why a certificate or proof was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyErrorKind {
    /// Signed voting power is below `ceil(2 * total / 3)`.
    #[error("insufficient quorum: signed power {signed} below required {required}")]
    InsufficientQuorum {
        /// Voting power behind the signature.
        signed: u128,
        /// Minimum power for a quorum.
        required: u128,
    },
    /// The aggregate signature does not verify against the signers' keys.
    #[error("aggregate signature invalid")]
    SignatureInvalid,
    /// The certificate does not extend the current head.
    #[error("certificate at epoch {epoch} height {height} is stale or non-contiguous")]
    StaleOrNonContiguous {
        /// Epoch of the rejected ledger info.
        epoch: u64,
        /// Height of the rejected ledger info.
        height: u64,
    },
    /// The signer mask addresses a validator outside the active set.
    #[error("signer mask bit {index} is outside a set of {set_len} validators")]
    UnknownValidatorInMask {
        /// Offending bit.
        index: usize,
        /// Size of the active set.
        set_len: usize,
    },
    /// The proof starts from a state other than the current head.
    #[error("proof does not start from the current head")]
    StaleProof,
    /// The proof's end does not strictly follow its start.
    #[error("batch range is empty or decreasing")]
    NonMonotonicBatch,
    /// The proof bytes failed the verification algorithm for their kind.
    #[error("proof rejected: {0}")]
    ProofInvalid(String),
    /// No verifying key is loaded for wrapped proofs.
    #[error("structured setup missing: {0}")]
    SetupMissing(String),
    /// The validator set needed for the check is not known to the engine.
    #[error("validator set with the required commitment is unknown")]
    UnknownValidatorSet,
}

impl VerifyErrorKind {
    /// Class of this kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            VerifyErrorKind::StaleOrNonContiguous { .. } | VerifyErrorKind::StaleProof => {
                ErrorClass::Stale
            }
            VerifyErrorKind::SetupMissing(_) | VerifyErrorKind::UnknownValidatorSet => {
                ErrorClass::Resource
            }
            _ => ErrorClass::Protocol,
        }
    }
}

/// A rejection together with the head the caller should re-query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} (head at epoch {} height {})", .head.epoch, .head.height)]
pub struct VerifyError {
    /// Stable reason.
    pub kind: VerifyErrorKind,
    /// Head at the time of rejection; unchanged by the failed call.
    pub head: VerifiedHead,
}

impl VerifyError {
    /// Pairs `kind` with `head`.
    pub fn new(kind: VerifyErrorKind, head: VerifiedHead) -> Self {
        Self { kind, head }
    }

    /// `true` if re-deriving against [`Self::head`] may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind.class() != ErrorClass::Protocol
    }

    pub(crate) fn log(&self) {
        match self.kind.class() {
            ErrorClass::Stale => debug!(error = %self, "stale submission"),
            ErrorClass::Resource => info!(error = %self, "verification unavailable"),
            ErrorClass::Protocol => warn!(error = %self, "rejected update"),
        }
    }
}

/// Failures of the off-chain proving pipeline and aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProveError {
    /// No certificates or proofs were supplied.
    #[error("nothing to prove")]
    EmptyBatch,
    /// Certificate `index` does not extend its predecessor.
    #[error("chain gap at certificate {index} (epoch {epoch}, height {height})")]
    ChainGap {
        /// Position in the batch.
        index: usize,
        /// Epoch of the offending ledger info.
        epoch: u64,
        /// Height of the offending ledger info.
        height: u64,
    },
    /// Certificate `index` fails the native checks.
    #[error("certificate {index} rejected: {kind}")]
    Rejected {
        /// Position in the batch.
        index: usize,
        /// Native verification failure.
        kind: VerifyErrorKind,
    },
    /// Wrapped proving needs structured-setup parameters.
    #[error("structured setup missing: {0}")]
    SetupMissing(String),
    /// The deadline passed before the proof was complete.
    #[error("proving timed out after {elapsed_ms} ms")]
    ProvingTimeout {
        /// Time spent before giving up.
        elapsed_ms: u128,
    },
    /// The caller cancelled the attempt.
    #[error("proving cancelled")]
    Cancelled,
    /// The batch exceeds configured capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Proof `index` does not start where proof `index - 1` ends.
    #[error("proof {index} does not start where its predecessor ends")]
    NonContiguousBatch {
        /// Position of the second proof of the pair.
        index: usize,
    },
    /// The proofs to aggregate target different verifiers.
    #[error("cannot aggregate proofs of different kinds")]
    MixedProofKind,
    /// The proof system failed to produce or encode a proof.
    #[error("proof backend failure: {0}")]
    Backend(String),
    /// Aggregating wrapped proofs needs the circuit witness of input
    /// `index`, and this pipeline no longer holds it.
    #[error("no cached witness for proof {index}")]
    MissingWitness {
        /// Position of the proof.
        index: usize,
    },
    /// An input proof to aggregation does not verify.
    #[error("inner proof {index} invalid: {reason}")]
    InvalidInnerProof {
        /// Position of the proof.
        index: usize,
        /// Verification failure.
        reason: String,
    },
}

impl ProveError {
    /// Class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProveError::SetupMissing(_)
            | ProveError::ProvingTimeout { .. }
            | ProveError::Cancelled
            | ProveError::ResourceExhausted(_)
            | ProveError::MissingWitness { .. }
            | ProveError::Backend(_) => ErrorClass::Resource,
            ProveError::Rejected { kind, .. } => kind.class(),
            _ => ErrorClass::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> VerifiedHead {
        VerifiedHead {
            epoch: 2,
            height: 7,
            state_root: [0; 32],
            validator_set_commitment: [0; 32],
        }
    }

    #[test]
    fn staleness_is_retryable_protocol_errors_are_not() {
        let stale = VerifyError::new(VerifyErrorKind::StaleProof, head());
        assert!(stale.is_retryable());
        let bad = VerifyError::new(VerifyErrorKind::SignatureInvalid, head());
        assert!(!bad.is_retryable());
        assert_eq!(
            ProveError::ProvingTimeout { elapsed_ms: 5 }.class(),
            ErrorClass::Resource
        );
        assert_eq!(ProveError::MixedProofKind.class(), ErrorClass::Protocol);
        assert_eq!(
            ProveError::MissingWitness { index: 0 }.class(),
            ErrorClass::Resource
        );
    }

    #[test]
    fn rejection_message_names_the_head() {
        let err = VerifyError::new(VerifyErrorKind::StaleProof, head());
        assert_eq!(
            err.to_string(),
            "proof does not start from the current head (head at epoch 2 height 7)"
        );
    }
}
