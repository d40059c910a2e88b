//! Voting-power tally and key aggregation for quorum certificates.

use crate::bls::PublicKey;
use crate::error::VerifyErrorKind;
use crate::types::{SignerMask, ValidatorSet};

/// Smallest signed power that forms a quorum: `ceil(2 * total / 3)`.
pub fn quorum_threshold(total_power: u128) -> u128 {
    (2 * total_power + 2) / 3
}

/// `true` iff `signed >= ceil(2 * total / 3)`, evaluated as `3·signed >= 2·total`.
pub fn has_quorum(signed_power: u128, total_power: u128) -> bool {
    signed_power.saturating_mul(3) >= total_power.saturating_mul(2)
}

/// Outcome of counting a signer mask against a validator set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumTally {
    /// Indices of the signers.
    pub signers: Vec<usize>,
    /// Voting power behind the signature.
    pub signed_power: u128,
    /// Voting power of the whole set.
    pub total_power: u128,
}

impl QuorumTally {
    /// Sum of the signers' public keys.
    pub fn aggregate_key(&self, set: &ValidatorSet) -> PublicKey {
        PublicKey::aggregate(
            self.signers
                .iter()
                .filter_map(|&i| set.get(i))
                .map(|v| &v.public_key),
        )
    }
}

/// Counts the power of `mask` over `set`.
///
/// Fails with `UnknownValidatorInMask` if a set bit addresses no member.
pub fn tally(set: &ValidatorSet, mask: &SignerMask) -> Result<QuorumTally, VerifyErrorKind> {
    let mut signers = Vec::with_capacity(mask.count());
    let mut signed_power = 0u128;
    for index in mask.ones() {
        let member = set
            .get(index)
            .ok_or(VerifyErrorKind::UnknownValidatorInMask {
                index,
                set_len: set.len(),
            })?;
        signed_power = signed_power.saturating_add(member.voting_power as u128);
        signers.push(index);
    }
    Ok(QuorumTally {
        signers,
        signed_power,
        total_power: set.total_power(),
    })
}

/// [`tally`] followed by the threshold check.
pub fn check_quorum(set: &ValidatorSet, mask: &SignerMask) -> Result<QuorumTally, VerifyErrorKind> {
    let tally = tally(set, mask)?;
    if !has_quorum(tally.signed_power, tally.total_power) {
        return Err(VerifyErrorKind::InsufficientQuorum {
            signed: tally.signed_power,
            required: quorum_threshold(tally.total_power),
        });
    }
    Ok(tally)
}
