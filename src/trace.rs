//! Execution trace of a certificate batch.
//!
//! Each accepted certificate becomes one row of 32-bit limbs:
//!
//! | cells | content                                   |
//! |-------|-------------------------------------------|
//! | 2     | epoch                                     |
//! | 2     | height                                    |
//! | 8     | state root                                |
//! | 8     | consensus digest                          |
//! | 1 + 8 | next-set flag and commitment              |
//! | 8     | signing set commitment                    |
//! | 4     | signed power                              |
//! | 4     | total power                               |
//! | 24    | aggregate public key (compressed G2)      |
//! | 12    | aggregate signature (compressed G1)       |
//! | 1 + k | signer count `n`, then `ceil(n/32)` words |
//!
//! Decoding range-checks every limb.  Replaying a trace recomputes every
//! quorum and key aggregation from the decoded values, then checks all the
//! signatures with one weighted multi-pairing.  A row is only as trusted as
//! the checks in [`check_row`].

use blake2::digest::{consts::U32, Digest as _};

#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;

use crate::bls::{self, PublicKey, Signature, SignatureCheck, PUBLIC_KEY_BYTES, SIGNATURE_BYTES};
use crate::error::VerifyErrorKind;
use crate::limbs::{
    bytes_to_limbs, flag, int_to_limbs, limbs_to_array, limbs_to_int, range_check, LimbError,
    DIGEST_LIMBS, LIMB_BITS,
};
use crate::native::{prepare_step, SetLookup, StepWitness};
use crate::types::{signing_message, ChainState, Digest, LedgerInfo, SignerMask};

type Blake2b256 = blake2::Blake2b<U32>;

const ROW_DOMAIN: &[u8] = b"QBRIDGE_TRACE_ROW_V1";
const KEY_LIMBS: usize = PUBLIC_KEY_BYTES / 4;
const SIG_LIMBS: usize = SIGNATURE_BYTES / 4;
const POWER_LIMBS: usize = 4;
/// Cells before the variable-length signer mask.
pub const FIXED_CELLS: usize =
    2 + 2 + DIGEST_LIMBS * 2 + 1 + DIGEST_LIMBS + DIGEST_LIMBS + POWER_LIMBS * 2 + KEY_LIMBS + SIG_LIMBS + 1;

/// One certified advancement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    /// Epoch of the ledger info.
    pub epoch: u64,
    /// Height of the ledger info.
    pub height: u64,
    /// Certified state root.
    pub state_root: Digest,
    /// Consensus digest of the ledger info.
    pub consensus_digest: Digest,
    /// Commitment of the announced next set.
    pub next_set: Option<Digest>,
    /// Commitment of the set that signed.
    pub signing_set: Digest,
    /// Power behind the signature.
    pub signed_power: u128,
    /// Power of the whole signing set.
    pub total_power: u128,
    /// Compressed aggregate public key.
    pub aggregate_key: [u8; PUBLIC_KEY_BYTES],
    /// Compressed aggregate signature.
    pub signature: [u8; SIGNATURE_BYTES],
    /// Signer bitmap over the signing set.
    pub signer_mask: SignerMask,
}

impl TraceRow {
    /// Row for a certificate that passed native verification.
    pub fn from_certificate(
        ledger_info: &LedgerInfo,
        mask: &SignerMask,
        signature: &Signature,
        witness: &StepWitness,
    ) -> Self {
        Self {
            epoch: ledger_info.epoch,
            height: ledger_info.height,
            state_root: ledger_info.state_root,
            consensus_digest: ledger_info.consensus_digest,
            next_set: ledger_info.next_set_commitment(),
            signing_set: witness.signing_set,
            signed_power: witness.tally.signed_power,
            total_power: witness.tally.total_power,
            aggregate_key: witness.aggregate_key.to_bytes(),
            signature: signature.to_bytes(),
            signer_mask: mask.clone(),
        }
    }

    /// Limb encoding of the row.
    pub fn to_cells(&self) -> Vec<u64> {
        let mask_words = self.signer_mask.len().div_ceil(32);
        let mut cells = Vec::with_capacity(FIXED_CELLS + mask_words);
        cells.extend(int_to_limbs(self.epoch as u128, 2));
        cells.extend(int_to_limbs(self.height as u128, 2));
        cells.extend(bytes_to_limbs(&self.state_root));
        cells.extend(bytes_to_limbs(&self.consensus_digest));
        cells.push(self.next_set.is_some() as u64);
        cells.extend(bytes_to_limbs(&self.next_set.unwrap_or([0u8; 32])));
        cells.extend(bytes_to_limbs(&self.signing_set));
        cells.extend(int_to_limbs(self.signed_power, POWER_LIMBS));
        cells.extend(int_to_limbs(self.total_power, POWER_LIMBS));
        cells.extend(bytes_to_limbs(&self.aggregate_key));
        cells.extend(bytes_to_limbs(&self.signature));
        cells.push(self.signer_mask.len() as u64);
        for w in 0..mask_words {
            let word = (0..32).fold(0u64, |acc, b| {
                acc | ((self.signer_mask.get(w * 32 + b) as u64) << b)
            });
            cells.push(word);
        }
        cells
    }

    /// Decodes and range-checks a row.
    pub fn from_cells(cells: &[u64]) -> Result<Self, LimbError> {
        if cells.len() < FIXED_CELLS {
            return Err(LimbError::Length {
                expected: FIXED_CELLS,
                found: cells.len(),
            });
        }
        let mut reader = CellReader { cells, pos: 0 };
        let epoch = limbs_to_int(reader.take(2))? as u64;
        let height = limbs_to_int(reader.take(2))? as u64;
        let state_root = limbs_to_array(reader.take(DIGEST_LIMBS))?;
        let consensus_digest = limbs_to_array(reader.take(DIGEST_LIMBS))?;
        let has_next = flag(reader.take(1)[0])?;
        let next: Digest = limbs_to_array(reader.take(DIGEST_LIMBS))?;
        if !has_next && next != [0u8; 32] {
            return Err(LimbError::NonZeroPadding(21));
        }
        let signing_set = limbs_to_array(reader.take(DIGEST_LIMBS))?;
        let signed_power = limbs_to_int(reader.take(POWER_LIMBS))?;
        let total_power = limbs_to_int(reader.take(POWER_LIMBS))?;
        let aggregate_key = limbs_to_array(reader.take(KEY_LIMBS))?;
        let signature = limbs_to_array(reader.take(SIG_LIMBS))?;
        let mask_len = range_check(FIXED_CELLS - 1, reader.take(1)[0], LIMB_BITS)? as usize;
        let mask_words = mask_len.div_ceil(32);
        if cells.len() != FIXED_CELLS + mask_words {
            return Err(LimbError::Length {
                expected: FIXED_CELLS + mask_words,
                found: cells.len(),
            });
        }
        let mut signer_mask = SignerMask::new(mask_len);
        for (w, &word) in reader.take(mask_words).iter().enumerate() {
            let word = range_check(FIXED_CELLS + w, word, LIMB_BITS)?;
            for b in 0..32 {
                if word >> b & 1 == 1 {
                    let index = w * 32 + b;
                    if index >= mask_len {
                        return Err(LimbError::NonZeroPadding(FIXED_CELLS + w));
                    }
                    signer_mask.set(index, true);
                }
            }
        }
        Ok(Self {
            epoch,
            height,
            state_root,
            consensus_digest,
            next_set: has_next.then_some(next),
            signing_set,
            signed_power,
            total_power,
            aggregate_key,
            signature,
            signer_mask,
        })
    }
}

struct CellReader<'a> {
    cells: &'a [u64],
    pos: usize,
}

impl<'a> CellReader<'a> {
    fn take(&mut self, n: usize) -> &'a [u64] {
        let out = &self.cells[self.pos..self.pos + n];
        self.pos += n;
        out
    }
}

/// Digest of an encoded row, used as its Merkle leaf.
pub fn row_digest(cells: &[u64]) -> Digest {
    let mut hasher = Blake2b256::new();
    hasher.update(ROW_DOMAIN);
    hasher.update((cells.len() as u64).to_be_bytes());
    for cell in cells {
        hasher.update(cell.to_be_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Checks one row against the state before it: contiguity, the signing set,
/// the power and key cells.  Returns the state after the row and its
/// signature check, still to be paired.
pub fn check_row<S: SetLookup + ?Sized>(
    state: &ChainState,
    row: &TraceRow,
    sets: &S,
) -> Result<(ChainState, SignatureCheck), VerifyErrorKind> {
    let signature = Signature::from_bytes(&row.signature)
        .map_err(|_| VerifyErrorKind::SignatureInvalid)?;
    let message = signing_message(
        row.epoch,
        row.height,
        &row.state_root,
        &row.consensus_digest,
        row.next_set.as_ref(),
    );
    let (witness, check) = prepare_step(
        state,
        row.epoch,
        row.height,
        &message,
        &row.signer_mask,
        &signature,
        sets,
    )?;
    if witness.signing_set != row.signing_set {
        return Err(VerifyErrorKind::ProofInvalid(
            "signing set cell disagrees with the chain".into(),
        ));
    }
    if witness.tally.signed_power != row.signed_power
        || witness.tally.total_power != row.total_power
    {
        return Err(VerifyErrorKind::ProofInvalid(
            "power cells disagree with the signer mask".into(),
        ));
    }
    if PublicKey::from_bytes(&row.aggregate_key).ok() != Some(witness.aggregate_key) {
        return Err(VerifyErrorKind::ProofInvalid(
            "aggregate key cells disagree with the signer mask".into(),
        ));
    }
    let next = state.advance(
        row.epoch,
        row.height,
        row.state_root,
        row.signing_set,
        row.next_set,
    );
    Ok((next, check))
}

/// Outcome of replaying a trace from a starting state.
#[derive(Debug, Clone)]
pub struct Replay {
    /// First failure, with its row index.
    pub first_failure: Option<(usize, VerifyErrorKind)>,
    /// State after the last row.
    pub end: ChainState,
}

/// Replays `rows` from `start`, weighting row `i`'s signature check by
/// `weights[i]` in the closing multi-pairing.
///
/// The state before each row is derived from the row before it, so the
/// per-row checks are independent and run in parallel where threads are
/// available.  If the batched pairing fails, rows are paired one by one to
/// name the first bad signature.
pub fn replay<S: SetLookup + Sync + ?Sized>(
    start: &ChainState,
    rows: &[TraceRow],
    sets: &S,
    weights: &[u128],
) -> Replay {
    let mut states = Vec::with_capacity(rows.len());
    let mut state = *start;
    for row in rows {
        states.push(state);
        state = state.advance(
            row.epoch,
            row.height,
            row.state_root,
            row.signing_set,
            row.next_set,
        );
    }
    let end = state;

    #[cfg(not(target_arch = "wasm32"))]
    let outcomes: Vec<Result<(ChainState, SignatureCheck), VerifyErrorKind>> = states
        .par_iter()
        .zip(rows.par_iter())
        .map(|(before, row)| check_row(before, row, sets))
        .collect();
    #[cfg(target_arch = "wasm32")]
    let outcomes: Vec<Result<(ChainState, SignatureCheck), VerifyErrorKind>> = states
        .iter()
        .zip(rows.iter())
        .map(|(before, row)| check_row(before, row, sets))
        .collect();

    let mut checks = Vec::with_capacity(rows.len());
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok((_, check)) => checks.push(check),
            Err(kind) => {
                return Replay {
                    first_failure: Some((index, kind)),
                    end,
                }
            }
        }
    }

    let first_failure = match bls::verify_batch(&checks, weights) {
        Ok(()) => None,
        Err(_) => Some(
            checks
                .iter()
                .position(|check| check.verify().is_err())
                .map(|index| (index, VerifyErrorKind::SignatureInvalid))
                .unwrap_or((
                    0,
                    VerifyErrorKind::ProofInvalid("batched pairing check failed".into()),
                )),
        ),
    };
    Replay { first_failure, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::verify_certificate;
    use crate::simulate::Committee;
    use ark_bls12_377::G1Projective;
    use ark_ec::CurveGroup;
    use ark_serialize::CanonicalSerialize;

    fn sample() -> (Committee, Vec<TraceRow>) {
        let committee = Committee::new(b"trace", &[3, 3, 3, 3, 3]);
        let mut state = committee.genesis_state();
        let mut rows = Vec::new();
        for height in [1, 2, 5] {
            let qc = committee.certify(committee.ledger_info(0, height, None), &[0, 2, 3, 4]);
            let (next, witness) = verify_certificate(&state, &qc, &committee.registry()).unwrap();
            rows.push(TraceRow::from_certificate(
                &qc.ledger_info,
                &qc.signer_mask,
                &qc.aggregate_signature,
                &witness,
            ));
            state = next;
        }
        (committee, rows)
    }

    #[test]
    fn cells_decode_back_to_the_row() {
        let (_, rows) = sample();
        let cells = rows[0].to_cells();
        assert_eq!(cells.len(), FIXED_CELLS + 1);
        assert_eq!(TraceRow::from_cells(&cells).unwrap(), rows[0]);
    }

    #[test]
    fn out_of_range_cell_is_rejected() {
        let (_, rows) = sample();
        let mut cells = rows[0].to_cells();
        cells[5] += 1 << 32;
        assert!(matches!(
            TraceRow::from_cells(&cells),
            Err(LimbError::OutOfRange { .. })
        ));
        let mut cells = rows[0].to_cells();
        cells.push(0);
        assert!(matches!(
            TraceRow::from_cells(&cells),
            Err(LimbError::Length { .. })
        ));
    }

    #[test]
    fn wide_key_and_signature_limbs_are_rejected() {
        let (_, rows) = sample();
        let key_start = FIXED_CELLS - 1 - SIG_LIMBS - KEY_LIMBS;
        let sig_start = FIXED_CELLS - 1 - SIG_LIMBS;
        assert_eq!((key_start, sig_start), (45, 69));

        for cell in [key_start, key_start + KEY_LIMBS - 1, sig_start, sig_start + SIG_LIMBS - 1] {
            let mut cells = rows[0].to_cells();
            let original = cells[cell];
            cells[cell] += 1 << 32;
            assert_eq!(
                TraceRow::from_cells(&cells),
                Err(LimbError::OutOfRange {
                    index: cell - if cell >= sig_start { sig_start } else { key_start },
                    value: original + (1 << 32),
                    bits: LIMB_BITS,
                }),
                "cell {cell}"
            );
        }
    }

    fn equal_weights(n: usize) -> Vec<u128> {
        vec![1; n]
    }

    #[test]
    fn honest_trace_replays() {
        let (committee, rows) = sample();
        let replay = replay(
            &committee.genesis_state(),
            &rows,
            &committee.registry(),
            &[3, 5, 7],
        );
        assert!(replay.first_failure.is_none());
        assert_eq!(replay.end.head.height, 5);
    }

    #[test]
    fn inflated_power_cell_is_caught() {
        let (committee, mut rows) = sample();
        rows[1].signed_power += 3;
        let replay = replay(
            &committee.genesis_state(),
            &rows,
            &committee.registry(),
            &equal_weights(3),
        );
        assert!(matches!(
            replay.first_failure,
            Some((1, VerifyErrorKind::ProofInvalid(_)))
        ));
    }

    #[test]
    fn substituted_signer_breaks_the_pairing() {
        let (committee, mut rows) = sample();
        // Swap signer 0 for signer 1 and keep the key cells consistent, so
        // only the pairing can tell.
        rows[2].signer_mask.set(0, false);
        rows[2].signer_mask.set(1, true);
        let tally = crate::quorum::tally(committee.set(), &rows[2].signer_mask).unwrap();
        rows[2].aggregate_key = tally.aggregate_key(committee.set()).to_bytes();
        let replay = replay(
            &committee.genesis_state(),
            &rows,
            &committee.registry(),
            &[9, 9, 9],
        );
        assert_eq!(
            replay.first_failure,
            Some((2, VerifyErrorKind::SignatureInvalid))
        );
    }

    #[test]
    fn cancelling_signature_errors_need_distinct_weights() {
        let (committee, mut rows) = sample();
        let offset = bls::hash_to_g1(b"offset", b"offset").unwrap();
        let encode = |point: G1Projective| {
            let mut out = [0u8; SIGNATURE_BYTES];
            point
                .into_affine()
                .serialize_compressed(&mut out[..])
                .unwrap();
            out
        };
        let first = Signature::from_bytes(&rows[0].signature).unwrap().point();
        let second = Signature::from_bytes(&rows[1].signature).unwrap().point();
        rows[0].signature = encode(first + offset);
        rows[1].signature = encode(second - offset);

        let registry = committee.registry();
        let start = committee.genesis_state();
        // Both rows are wrong, but their errors sum to zero.
        assert!(replay(&start, &rows, &registry, &equal_weights(3))
            .first_failure
            .is_none());
        assert_eq!(
            replay(&start, &rows, &registry, &[11, 13, 17]).first_failure,
            Some((0, VerifyErrorKind::SignatureInvalid))
        );
    }
}
