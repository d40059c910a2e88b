//! BLS aggregate signatures over BLS12-377.
//!
//! Public keys live in G2 and signatures in G1, so aggregating keys is G2
//! point addition and verifying an aggregate costs one multi-pairing:
//!
//! ```text
//! e(σ, -g₂) · e(H(m), apk) == 1
//! ```
//!
//! Messages are hashed to G1 with try-and-increment over Poseidon: the
//! message is absorbed once into a base element, and candidate `x`
//! coordinates are `Poseidon(base, counter)` for `counter = 0, 1, ...`.  The
//! first candidate on the curve is multiplied by the G1 cofactor.  Every
//! step is native arithmetic over the BW6-761 scalar field, which lets the
//! wrapped circuit repeat the hash.
//!
//! Keys are assumed to be registered with a proof of possession by the
//! source chain; rogue-key defences are not repeated here.

use ark_bls12_377::{Bls12_377, Fq, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{pairing::Pairing, AffineRepr, CurveGroup, Group};
use ark_ff::{One, PrimeField, UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use blake2::digest::{consts::U32, Digest as _};
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::poseidon::{self, byte_words, bytes_to_field};

type Blake2b256 = blake2::Blake2b<U32>;

/// Domain tag for signatures over ledger commitments.
pub const SIG_DOMAIN: &[u8] = b"QBRIDGE_BLS_SIG_V2";
const KEYGEN_DOMAIN: &[u8] = b"QBRIDGE_BLS_KEYGEN_V1";

/// Compressed size of a G1 signature.
pub const SIGNATURE_BYTES: usize = 48;
/// Compressed size of a G2 public key.
pub const PUBLIC_KEY_BYTES: usize = 96;

/// Failures of the signature layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlsError {
    /// No candidate in the try-and-increment loop landed on the curve.
    #[error("could not hash message to G1 after 256 attempts")]
    HashToCurve,
    /// The point encoding is malformed or not in the prime-order subgroup.
    #[error("invalid point encoding: {0}")]
    Encoding(String),
    /// The aggregate public key is the identity.
    #[error("aggregate public key is the identity")]
    IdentityKey,
    /// The pairing equation does not hold.
    #[error("signature verification failed")]
    VerificationFailed,
}

fn compress<T: CanonicalSerialize, const N: usize>(value: &T) -> [u8; N] {
    let mut out = [0u8; N];
    // Compressed points have a fixed size; N is that size.
    let _ = value.serialize_compressed(&mut out[..]);
    out
}

/// The try-and-increment result before cofactor clearing.  The wrapped
/// circuit takes it as a hint and checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashHint {
    /// Counter whose candidate landed on the curve.
    pub counter: u8,
    /// The candidate point, on the curve but not yet in G1.
    pub point: G1Affine,
}

impl HashHint {
    /// The hashed point, `point · h₁`.
    pub fn hashed(&self) -> G1Projective {
        self.point.mul_by_cofactor_to_group()
    }
}

/// Poseidon absorption of `(domain, len, message words)`.
pub fn message_base(domain: &[u8], message: &[u8]) -> Fq {
    let mut inputs = Vec::with_capacity(2 + message.len().div_ceil(8));
    inputs.push(bytes_to_field(domain));
    inputs.push(Fq::from(message.len() as u64));
    inputs.extend(byte_words(message).into_iter().map(Fq::from));
    poseidon::hash(&inputs)
}

/// Candidate `x` coordinate for `counter`.
pub fn candidate_x(base: Fq, counter: u8) -> Fq {
    poseidon::hash(&[base, Fq::from(counter as u64)])
}

/// Runs try-and-increment for `message` under `domain`.
pub fn hash_hint(domain: &[u8], message: &[u8]) -> Result<HashHint, BlsError> {
    let base = message_base(domain, message);
    for counter in 0..=u8::MAX {
        let x = candidate_x(base, counter);
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, false) {
            let hint = HashHint { counter, point };
            if !hint.hashed().is_zero() {
                return Ok(hint);
            }
        }
    }
    Err(BlsError::HashToCurve)
}

/// Hashes `message` under `domain` to a point in G1.
pub fn hash_to_g1(domain: &[u8], message: &[u8]) -> Result<G1Projective, BlsError> {
    Ok(hash_hint(domain, message)?.hashed())
}

/// A validator's signing key.
#[derive(Clone)]
pub struct SecretKey(Fr);

impl SecretKey {
    /// Samples a fresh key.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        SecretKey(Fr::rand(rng))
    }

    /// Derives a key deterministically from seed material.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(KEYGEN_DOMAIN);
        hasher.update(seed);
        SecretKey(Fr::from_le_bytes_mod_order(&hasher.finalize()))
    }

    /// The matching public key, `sk · g₂`.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(G2Projective::generator() * self.0)
    }

    /// Signs `message` under [`SIG_DOMAIN`].
    pub fn sign(&self, message: &[u8]) -> Result<Signature, BlsError> {
        Ok(Signature(hash_to_g1(SIG_DOMAIN, message)? * self.0))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A public key in G2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(G2Projective);

impl PublicKey {
    /// Sums the given keys.  The empty sum is the identity.
    pub fn aggregate<'a, I>(keys: I) -> PublicKey
    where
        I: IntoIterator<Item = &'a PublicKey>,
    {
        PublicKey(keys.into_iter().fold(G2Projective::zero(), |acc, pk| acc + pk.0))
    }

    /// Returns `true` for the point at infinity.
    pub fn is_identity(&self) -> bool {
        self.0.is_zero()
    }

    /// Affine form, as the circuit allocates it.
    pub fn to_affine(&self) -> G2Affine {
        self.0.into_affine()
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_BYTES] {
        compress(&self.0.into_affine())
    }

    /// Decodes and subgroup-checks a compressed key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        G2Affine::deserialize_compressed(bytes)
            .map(|p| PublicKey(p.into_group()))
            .map_err(|e| BlsError::Encoding(e.to_string()))
    }

    /// Hashes `message` and pairs it with this key and `signature` for a
    /// later [`SignatureCheck::verify`] or [`verify_batch`].
    pub fn prepare(&self, message: &[u8], signature: &Signature) -> Result<SignatureCheck, BlsError> {
        if self.is_identity() {
            return Err(BlsError::IdentityKey);
        }
        Ok(SignatureCheck {
            hashed: hash_to_g1(SIG_DOMAIN, message)?,
            key: self.0,
            signature: signature.0,
        })
    }

    /// Checks `signature` over `message` with one multi-pairing.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), BlsError> {
        self.prepare(message, signature)?.verify()
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(de::Error::custom)?;
        PublicKey::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

/// A signature in G1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(G1Projective);

impl Signature {
    /// Sums the given signatures.
    pub fn aggregate<'a, I>(signatures: I) -> Signature
    where
        I: IntoIterator<Item = &'a Signature>,
    {
        Signature(
            signatures
                .into_iter()
                .fold(G1Projective::zero(), |acc, sig| acc + sig.0),
        )
    }

    /// The underlying group element.
    pub fn point(&self) -> G1Projective {
        self.0
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_BYTES] {
        compress(&self.0.into_affine())
    }

    /// Decodes and validates a compressed signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        G1Affine::deserialize_compressed(bytes)
            .map(|p| Signature(p.into_group()))
            .map_err(|e| BlsError::Encoding(e.to_string()))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text).map_err(de::Error::custom)?;
        Signature::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

/// A hashed message with the key and signature it is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    hashed: G1Projective,
    key: G2Projective,
    signature: G1Projective,
}

impl SignatureCheck {
    /// `e(σ, -g₂) · e(H(m), apk) == 1`.
    pub fn verify(&self) -> Result<(), BlsError> {
        pairing_holds(
            [self.signature.into_affine(), self.hashed.into_affine()],
            [-G2Affine::generator(), self.key.into_affine()],
        )
    }
}

/// Checks every entry with one multi-pairing:
///
/// ```text
/// e(Σ rᵢσᵢ, -g₂) · Π e(rᵢH(mᵢ), apkᵢ) == 1
/// ```
///
/// The weights `rᵢ` must be fixed only after the signatures are, otherwise
/// two invalid entries can cancel.  Fails if the lengths differ.
pub fn verify_batch(checks: &[SignatureCheck], weights: &[u128]) -> Result<(), BlsError> {
    if checks.len() != weights.len() {
        return Err(BlsError::VerificationFailed);
    }
    let mut signature_sum = G1Projective::zero();
    let mut g1 = Vec::with_capacity(checks.len() + 1);
    let mut g2 = Vec::with_capacity(checks.len() + 1);
    for (check, &weight) in checks.iter().zip(weights) {
        let r = Fr::from(weight);
        signature_sum += check.signature * r;
        g1.push((check.hashed * r).into_affine());
        g2.push(check.key.into_affine());
    }
    g1.push(signature_sum.into_affine());
    g2.push(-G2Affine::generator());
    pairing_holds(g1, g2)
}

fn pairing_holds(
    g1: impl IntoIterator<Item = G1Affine>,
    g2: impl IntoIterator<Item = G2Affine>,
) -> Result<(), BlsError> {
    if Bls12_377::multi_pairing(g1, g2).0.is_one() {
        Ok(())
    } else {
        Err(BlsError::VerificationFailed)
    }
}
