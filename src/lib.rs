#![deny(missing_docs)]

//! # quorum_bridge
//!
//! **quorum_bridge** lets one chain follow another chain's Byzantine-quorum
//! consensus without trusting the relayer that feeds it.  A single
//! [`VerificationEngine`] owns the verified head and advances it only when
//! shown that a supermajority (by voting power) of the responsible validator
//! set signed the new state.
//!
//! That evidence comes in two forms behind one contract:
//!
//! * **Quorum certificates**, checked directly: quorum power over the signer
//!   mask, aggregation of the signers' BLS keys on BLS12-377, and one
//!   multi-pairing ([`native`]).
//! * **Batch proofs** covering many certificates at once, produced off-chain
//!   by the [`ProvingPipeline`] and checked by the [`DualProofVerifier`].  A
//!   [`ProofKind::Native`] proof carries a Merkle-committed execution trace
//!   that the verifier replays row by row, closing with one weighted
//!   multi-pairing over every row's signature.  A
//!   [`ProofKind::WrappedSuccinct`] proof is a Groth16 proof over BW6-761
//!   whose circuit re-checks the whole transition, validator-set commitments
//!   and BLS signatures included.  Contiguous proofs of one kind can be
//!   merged with [`ProvingPipeline::aggregate`]; wrapped proofs are re-proven
//!   as one transition.
//!
//! Heights strictly increase within an epoch (gaps are allowed).  An
//! epoch's last ledger info announces the next set, which then becomes the
//! only set able to certify the following epoch.
//!
//! ## Usage
//!
//! ```rust
//! use quorum_bridge::simulate::Committee;
//! use quorum_bridge::{EngineConfig, ProofKind, ProverConfig, ProvingPipeline, VerificationEngine};
//!
//! let committee = Committee::new(b"doc", &[1, 1, 1, 1]);
//! let mut engine = VerificationEngine::genesis(
//!     &committee.genesis_ledger_info(),
//!     committee.set().clone(),
//!     EngineConfig::default(),
//! );
//!
//! // Three of four equal-power validators sign height 1.
//! let qc = committee.certify(committee.ledger_info(0, 1, None), &[0, 1, 2]);
//! let head = engine.verify_and_advance(&qc).unwrap();
//! assert_eq!(head.height, 1);
//!
//! // Two further heights as one transparent batch proof.
//! let batch: Vec<_> = (2..=3)
//!     .map(|h| committee.certify_all(committee.ledger_info(0, h, None)))
//!     .collect();
//! let pipeline = ProvingPipeline::new(ProverConfig::default());
//! let proof = pipeline
//!     .prove(&engine.chain_state(), &engine.known_sets(), &batch, ProofKind::Native)
//!     .unwrap();
//! assert_eq!(engine.submit(&proof).unwrap().height, 3);
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod aggregate;
pub mod bls;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod limbs;
pub mod merkle;
pub mod native;
pub mod poseidon;
pub mod prover;
pub mod quorum;
pub mod setup;
pub mod simulate;
pub mod trace;
mod transcript;
pub mod transparent;
pub mod types;
pub mod verifier;
pub mod wrapped;

pub use bls::{PublicKey, SecretKey, Signature};
pub use checkpoint::{load_checkpoint, load_latest_checkpoint, CheckpointError, EngineCheckpoint};
pub use config::{BridgeConfig, ConfigError};
pub use engine::{
    AcceptedUpdate, EngineConfig, UpdateSource, VerificationEngine, VerificationReport,
};
pub use error::{ErrorClass, ProveError, VerifyError, VerifyErrorKind};
pub use prover::{CancellationToken, ProverConfig, ProvingPipeline};
pub use quorum::{has_quorum, quorum_threshold};
pub use setup::{load_setup, trusted_setup, write_setup, SetupError, SetupManifest, SetupParameters, VerifierKeys};
pub use transcript::Transcript;
pub use types::{
    BatchProof, ChainState, Digest, LedgerInfo, ProofKind, PublicInputs, QuorumCertificate,
    SignerMask, ValidatorInfo, ValidatorSet, VerifiedHead,
};
pub use verifier::{DualProofVerifier, ProofVerifier, VerificationOutcome};
