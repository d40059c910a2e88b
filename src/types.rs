//! Shared data model: validator sets, ledger infos, certificates and batch
//! proofs.
//!
//! Everything a proof or certificate refers to is identified by a 32-byte
//! commitment.  A validator set is never embedded in public inputs; its
//! Poseidon commitment stands in for it and the full set is looked up by
//! that commitment when it is needed.  The wrapped circuit recomputes the
//! same commitment from the member keys and powers it is given.

use ark_bls12_377::Fq;
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};
use thiserror::Error;

use crate::bls::{PublicKey, Signature};
use crate::poseidon::{self, bytes_to_field, field_to_digest};

/// 32-byte hash output used for roots and commitments.
pub type Digest = [u8; 32];

/// Domain tag of validator-set commitments.
pub const VALIDATOR_SET_DOMAIN: &[u8] = b"QBRIDGE_VALIDATOR_SET_V2";
const STATEMENT_DOMAIN: &[u8] = b"QBRIDGE_STATEMENT_V1";

/// Length of [`signing_message`] output: fifteen 64-bit words.
pub const SIGNING_MESSAGE_BYTES: usize = 120;

/// Hex (de)serialization for byte fields.
pub(crate) mod serde_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::Digest;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(de::Error::custom)
    }

    pub(crate) fn parse_digest(text: &str) -> Result<Digest, String> {
        let bytes = hex::decode(text).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub mod digest {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Digest, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&hex::encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest, D::Error> {
            let text = String::deserialize(deserializer)?;
            parse_digest(&text).map_err(de::Error::custom)
        }
    }

    pub mod digest_opt {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Digest>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Digest>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| parse_digest(&text).map_err(de::Error::custom))
                .transpose()
        }
    }
}

/// Reasons a validator set cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidatorSetError {
    /// The set has no members.
    #[error("validator set is empty")]
    Empty,
    /// A member carries zero voting power.
    #[error("validator {0} has zero voting power")]
    ZeroPower(String),
    /// Two members share an identity.
    #[error("duplicate validator identity {0}")]
    DuplicateIdentity(String),
    /// A member's public key is the point at infinity.
    #[error("validator {0} has the identity public key")]
    IdentityKey(String),
}

/// One member of a validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Stable identity (account address on the source chain).
    pub identity: String,
    /// BLS public key in G2.
    pub public_key: PublicKey,
    /// Weight used for quorum thresholds.
    pub voting_power: u64,
}

impl ValidatorInfo {
    /// Convenience constructor.
    pub fn new(identity: impl Into<String>, public_key: PublicKey, voting_power: u64) -> Self {
        Self {
            identity: identity.into(),
            public_key,
            voting_power,
        }
    }
}

/// An ordered, immutable validator set.  Member `i` is addressed by bit `i`
/// of a [`SignerMask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ValidatorInfo>", into = "Vec<ValidatorInfo>")]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    /// Builds a set, rejecting empty sets, zero-power members, identity keys
    /// and duplicate identities.
    pub fn new(validators: Vec<ValidatorInfo>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for v in &validators {
            if v.voting_power == 0 {
                return Err(ValidatorSetError::ZeroPower(v.identity.clone()));
            }
            if v.public_key.is_identity() {
                return Err(ValidatorSetError::IdentityKey(v.identity.clone()));
            }
            if !seen.insert(v.identity.as_str()) {
                return Err(ValidatorSetError::DuplicateIdentity(v.identity.clone()));
            }
        }
        Ok(Self { validators })
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Always `false` for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Member at `index`.
    pub fn get(&self, index: usize) -> Option<&ValidatorInfo> {
        self.validators.get(index)
    }

    /// Iterates members in order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }

    /// Sum of all voting power.
    pub fn total_power(&self) -> u128 {
        self.validators.iter().map(|v| v.voting_power as u128).sum()
    }

    /// Collision-resistant commitment: the low 256 bits of
    /// [`Self::commitment_element`].
    pub fn commitment(&self) -> Digest {
        field_to_digest(&self.commitment_element())
    }

    /// Poseidon chain over the members:
    ///
    /// ```text
    /// c₀     = H(domain)
    /// cᵢ₊₁   = H(cᵢ, identity, pk.x.c0, pk.x.c1, pk.y.c0, pk.y.c1, power)
    /// result = H(cₙ, n)
    /// ```
    ///
    /// Keys enter as affine G2 coordinates and identities through
    /// [`bytes_to_field`].
    pub fn commitment_element(&self) -> Fq {
        let mut acc = poseidon::hash(&[bytes_to_field(VALIDATOR_SET_DOMAIN)]);
        for v in &self.validators {
            let key = v.public_key.to_affine();
            acc = poseidon::hash(&[
                acc,
                bytes_to_field(v.identity.as_bytes()),
                key.x.c0,
                key.x.c1,
                key.y.c0,
                key.y.c1,
                Fq::from(v.voting_power),
            ]);
        }
        poseidon::hash(&[acc, Fq::from(self.validators.len() as u64)])
    }
}

impl TryFrom<Vec<ValidatorInfo>> for ValidatorSet {
    type Error = ValidatorSetError;

    fn try_from(validators: Vec<ValidatorInfo>) -> Result<Self, Self::Error> {
        ValidatorSet::new(validators)
    }
}

impl From<ValidatorSet> for Vec<ValidatorInfo> {
    fn from(set: ValidatorSet) -> Self {
        set.validators
    }
}

/// Bitset over validator indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerMask {
    bits: Vec<bool>,
}

impl SignerMask {
    /// An all-clear mask of `len` bits.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    /// A mask of `len` bits with the given indices set.  Indices past `len`
    /// extend the mask.
    pub fn from_indices(len: usize, indices: &[usize]) -> Self {
        let mut mask = Self::new(len);
        for &i in indices {
            mask.set(i, true);
        }
        mask
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// `true` if the mask has no bits at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Reads bit `index`; bits past the end read as clear.
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Writes bit `index`, growing the mask if needed.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        self.bits[index] = value;
    }

    /// Toggles bit `index`.
    pub fn flip(&mut self, index: usize) {
        let current = self.get(index);
        self.set(index, !current);
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}

/// Canonical signed message for a ledger commitment.  The next validator set
/// enters only through its commitment.
///
/// Layout, every field little-endian so the message splits into the same
/// 64-bit words the circuit carries:
///
/// ```text
/// epoch(8) ‖ height(8) ‖ state_root(32) ‖ consensus_digest(32)
///          ‖ has_next(8) ‖ next_set or zeros(32)
/// ```
pub fn signing_message(
    epoch: u64,
    height: u64,
    state_root: &Digest,
    consensus_digest: &Digest,
    next_set: Option<&Digest>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNING_MESSAGE_BYTES);
    out.extend_from_slice(&epoch.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(state_root);
    out.extend_from_slice(consensus_digest);
    out.extend_from_slice(&(next_set.is_some() as u64).to_le_bytes());
    out.extend_from_slice(next_set.unwrap_or(&[0u8; 32]));
    out
}

/// A candidate state commitment of the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    /// Epoch the commitment belongs to.
    pub epoch: u64,
    /// Height, strictly increasing within an epoch.
    pub height: u64,
    /// Committed state root.
    #[serde(with = "serde_hex::digest")]
    pub state_root: Digest,
    /// Digest of the consensus block that produced the state.
    #[serde(with = "serde_hex::digest")]
    pub consensus_digest: Digest,
    /// Set effective from `epoch + 1`; present only on an epoch's last entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_validator_set: Option<ValidatorSet>,
}

impl LedgerInfo {
    /// Commitment of `next_validator_set`, if any.
    pub fn next_set_commitment(&self) -> Option<Digest> {
        self.next_validator_set.as_ref().map(ValidatorSet::commitment)
    }

    /// Bytes validators sign for this ledger info.
    pub fn signing_message(&self) -> Vec<u8> {
        signing_message(
            self.epoch,
            self.height,
            &self.state_root,
            &self.consensus_digest,
            self.next_set_commitment().as_ref(),
        )
    }
}

/// A ledger info together with the aggregate signature of its signers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Certified ledger info.
    pub ledger_info: LedgerInfo,
    /// Which members of the active set signed.
    pub signer_mask: SignerMask,
    /// Sum of the signers' signatures.
    pub aggregate_signature: Signature,
}

/// Which verification algorithm a batch proof is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofKind {
    /// Committed execution trace, replayed in full by the verifier.
    Native,
    /// Groth16 proof over BW6-761 of the same transition, BLS checks
    /// included.
    WrappedSuccinct,
}

impl ProofKind {
    /// Tag bound into every transcript and circuit statement.
    pub fn tag(self) -> u64 {
        match self {
            ProofKind::Native => 1,
            ProofKind::WrappedSuccinct => 2,
        }
    }
}

impl std::fmt::Display for ProofKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProofKind::Native => f.write_str("native"),
            ProofKind::WrappedSuccinct => f.write_str("wrapped-succinct"),
        }
    }
}

/// Public statement of a batch proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    /// State root the batch starts from.
    #[serde(with = "serde_hex::digest")]
    pub old_state_root: Digest,
    /// Active set commitment the batch starts from.
    #[serde(with = "serde_hex::digest")]
    pub old_validator_set_commitment: Digest,
    /// Set pending for the next epoch at the start, if any.
    #[serde(default, with = "serde_hex::digest_opt")]
    pub old_pending_set_commitment: Option<Digest>,
    /// State root after the batch.
    #[serde(with = "serde_hex::digest")]
    pub new_state_root: Digest,
    /// Active set commitment after the batch.
    #[serde(with = "serde_hex::digest")]
    pub new_validator_set_commitment: Digest,
    /// Set pending for the next epoch after the batch, if any.
    #[serde(default, with = "serde_hex::digest_opt")]
    pub new_pending_set_commitment: Option<Digest>,
}

/// One or more certified advancements collapsed into a single proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProof {
    /// Epoch of the head the batch was proven from.
    pub start_epoch: u64,
    /// Height of the head the batch was proven from.
    pub start_height: u64,
    /// Epoch of the last certified ledger info.
    pub end_epoch: u64,
    /// Height of the last certified ledger info.
    pub end_height: u64,
    /// Public statement.
    pub public_inputs: PublicInputs,
    /// Encoded proof for `proof_kind`.
    #[serde(with = "serde_hex")]
    pub proof_bytes: Vec<u8>,
    /// Verification algorithm the proof targets.
    pub proof_kind: ProofKind,
}

impl BatchProof {
    /// `true` if the end strictly follows the start.
    pub fn is_monotonic(&self) -> bool {
        (self.end_epoch, self.end_height) > (self.start_epoch, self.start_height)
    }

    /// Keccak-256 statement hash over the kind tag, range and public inputs.
    pub fn statement_digest(&self) -> Digest {
        statement_digest(
            self.proof_kind,
            (self.start_epoch, self.start_height),
            (self.end_epoch, self.end_height),
            &self.public_inputs,
        )
    }
}

/// Statement hash shared by the prover and both verifiers.
pub fn statement_digest(
    kind: ProofKind,
    start: (u64, u64),
    end: (u64, u64),
    inputs: &PublicInputs,
) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(STATEMENT_DOMAIN);
    hasher.update(kind.tag().to_be_bytes());
    for word in [start.0, start.1, end.0, end.1] {
        hasher.update(word.to_be_bytes());
    }
    hasher.update(inputs.old_state_root);
    hasher.update(inputs.old_validator_set_commitment);
    absorb_optional(&mut hasher, inputs.old_pending_set_commitment.as_ref());
    hasher.update(inputs.new_state_root);
    hasher.update(inputs.new_validator_set_commitment);
    absorb_optional(&mut hasher, inputs.new_pending_set_commitment.as_ref());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn absorb_optional(hasher: &mut Keccak256, digest: Option<&Digest>) {
    match digest {
        Some(d) => {
            hasher.update([1u8]);
            hasher.update(d);
        }
        None => hasher.update([0u8; 33]),
    }
}

/// The latest verified state commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedHead {
    /// Epoch of the last accepted ledger info.
    pub epoch: u64,
    /// Height of the last accepted ledger info.
    pub height: u64,
    /// State root of the last accepted ledger info.
    #[serde(with = "serde_hex::digest")]
    pub state_root: Digest,
    /// Commitment of the set that certified it.
    #[serde(with = "serde_hex::digest")]
    pub validator_set_commitment: Digest,
}

/// Head plus the set committed for the next epoch.  This is the whole of the
/// state a certificate or proof is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Latest verified head.
    pub head: VerifiedHead,
    /// Set effective at `head.epoch + 1`, once the epoch's last entry is in.
    #[serde(default, with = "serde_hex::digest_opt")]
    pub pending_set: Option<Digest>,
}

impl ChainState {
    /// Commitment of the set that must sign a ledger info at `(epoch,
    /// height)`, or `None` if that position does not extend this state.
    ///
    /// Within an epoch heights must strictly increase; gaps are allowed.  The
    /// first entry of the next epoch is accepted only once its set is pending.
    pub fn signing_set_for(&self, epoch: u64, height: u64) -> Option<Digest> {
        if epoch == self.head.epoch {
            if self.pending_set.is_none() && height > self.head.height {
                return Some(self.head.validator_set_commitment);
            }
            return None;
        }
        if Some(epoch) == self.head.epoch.checked_add(1) {
            return self.pending_set;
        }
        None
    }

    /// State after accepting a ledger info signed by `signing_set`.
    pub fn advance(
        &self,
        epoch: u64,
        height: u64,
        state_root: Digest,
        signing_set: Digest,
        next_set: Option<Digest>,
    ) -> ChainState {
        ChainState {
            head: VerifiedHead {
                epoch,
                height,
                state_root,
                validator_set_commitment: signing_set,
            },
            pending_set: next_set,
        }
    }

    /// Public inputs of a transition from `self` to `to`.
    pub fn public_inputs_to(&self, to: &ChainState) -> PublicInputs {
        PublicInputs {
            old_state_root: self.head.state_root,
            old_validator_set_commitment: self.head.validator_set_commitment,
            old_pending_set_commitment: self.pending_set,
            new_state_root: to.head.state_root,
            new_validator_set_commitment: to.head.validator_set_commitment,
            new_pending_set_commitment: to.pending_set,
        }
    }

    /// The state a batch with these public inputs ends in.
    pub fn from_batch_end(proof: &BatchProof) -> ChainState {
        ChainState {
            head: VerifiedHead {
                epoch: proof.end_epoch,
                height: proof.end_height,
                state_root: proof.public_inputs.new_state_root,
                validator_set_commitment: proof.public_inputs.new_validator_set_commitment,
            },
            pending_set: proof.public_inputs.new_pending_set_commitment,
        }
    }

    /// The state a batch with these public inputs starts from.
    pub fn from_batch_start(proof: &BatchProof) -> ChainState {
        ChainState {
            head: VerifiedHead {
                epoch: proof.start_epoch,
                height: proof.start_height,
                state_root: proof.public_inputs.old_state_root,
                validator_set_commitment: proof.public_inputs.old_validator_set_commitment,
            },
            pending_set: proof.public_inputs.old_pending_set_commitment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::SecretKey;

    fn set(powers: &[u64]) -> ValidatorSet {
        let members = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                ValidatorInfo::new(
                    format!("v{i}"),
                    SecretKey::from_seed(&[i as u8]).public_key(),
                    p,
                )
            })
            .collect();
        ValidatorSet::new(members).unwrap()
    }

    fn state(pending: Option<Digest>) -> ChainState {
        ChainState {
            head: VerifiedHead {
                epoch: 3,
                height: 10,
                state_root: [1; 32],
                validator_set_commitment: [2; 32],
            },
            pending_set: pending,
        }
    }

    #[test]
    fn set_validation_rejects_degenerate_sets() {
        assert_eq!(ValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));
        let pk = SecretKey::from_seed(b"x").public_key();
        assert!(matches!(
            ValidatorSet::new(vec![ValidatorInfo::new("a", pk.clone(), 0)]),
            Err(ValidatorSetError::ZeroPower(_))
        ));
        assert!(matches!(
            ValidatorSet::new(vec![
                ValidatorInfo::new("a", pk.clone(), 1),
                ValidatorInfo::new("a", pk, 1)
            ]),
            Err(ValidatorSetError::DuplicateIdentity(_))
        ));
        let identity = PublicKey::aggregate(&Vec::<PublicKey>::new());
        assert_eq!(
            ValidatorSet::new(vec![ValidatorInfo::new("z", identity, 1)]),
            Err(ValidatorSetError::IdentityKey("z".into()))
        );
    }

    #[test]
    fn commitment_tracks_power_and_order() {
        let a = set(&[1, 2, 3]);
        assert_eq!(a.commitment(), set(&[1, 2, 3]).commitment());
        assert_ne!(a.commitment(), set(&[1, 2, 4]).commitment());
        assert_ne!(a.commitment(), set(&[1, 2]).commitment());
        assert_eq!(a.total_power(), 6);

        let mut members: Vec<ValidatorInfo> = a.clone().into();
        members.swap(0, 1);
        assert_ne!(ValidatorSet::new(members).unwrap().commitment(), a.commitment());
    }

    #[test]
    fn signing_message_splits_into_words() {
        let msg = signing_message(7, 9, &[1; 32], &[2; 32], Some(&[3; 32]));
        assert_eq!(msg.len(), SIGNING_MESSAGE_BYTES);
        let words = poseidon::byte_words(&msg);
        assert_eq!(words.len(), 15);
        assert_eq!((words[0], words[1]), (7, 9));
        assert_eq!(words[10], 1);
        let none = signing_message(7, 9, &[1; 32], &[2; 32], None);
        assert_eq!(poseidon::byte_words(&none)[10..], [0; 5]);
    }

    #[test]
    fn validator_set_json_is_validated() {
        let a = set(&[5, 5]);
        let json = serde_json::to_string(&a).unwrap();
        let back: ValidatorSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.commitment(), a.commitment());
        assert!(serde_json::from_str::<ValidatorSet>("[]").is_err());
    }

    #[test]
    fn mask_grows_and_flips() {
        let mut mask = SignerMask::from_indices(4, &[0, 2]);
        assert_eq!(mask.ones().collect::<Vec<_>>(), vec![0, 2]);
        mask.flip(2);
        mask.flip(6);
        assert_eq!(mask.ones().collect::<Vec<_>>(), vec![0, 6]);
        assert_eq!(mask.len(), 7);
    }

    #[test]
    fn signing_set_follows_contiguity_rules() {
        let s = state(None);
        assert_eq!(s.signing_set_for(3, 11), Some([2; 32]));
        assert_eq!(s.signing_set_for(3, 15), Some([2; 32]));
        assert_eq!(s.signing_set_for(3, 10), None);
        assert_eq!(s.signing_set_for(4, 1), None);

        let boundary = state(Some([9; 32]));
        assert_eq!(boundary.signing_set_for(3, 11), None);
        assert_eq!(boundary.signing_set_for(4, 0), Some([9; 32]));
        assert_eq!(boundary.signing_set_for(5, 0), None);
    }

    #[test]
    fn statement_digest_binds_kind() {
        let s = state(None);
        let inputs = s.public_inputs_to(&s);
        assert_ne!(
            statement_digest(ProofKind::Native, (3, 10), (3, 11), &inputs),
            statement_digest(ProofKind::WrappedSuccinct, (3, 10), (3, 11), &inputs)
        );
    }
}
