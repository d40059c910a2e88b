//! Structured setup for wrapped proofs.
//!
//! A setup holds the Groth16 proving key of the transition circuit, over
//! BW6-761, at one [`CircuitShape`].  It is produced once by a ceremony, stored as a
//! single file, and pinned by a manifest carrying its version and SHA-256
//! digest.  Loading fails closed: a missing file, an unknown version or a
//! digest mismatch are errors, never a fallback to fresh parameters.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use ark_bw6_761::BW6_761;
use ark_groth16::{prepare_verifying_key, Groth16, PreparedVerifyingKey, ProvingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize, Compress, Validate};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::info;

use crate::circuit::{CircuitShape, TransitionCircuit};
use crate::types::{serde_hex, Digest};

type Reduction = ark_groth16::r1cs_to_qap::LibsnarkReduction;

/// Setup format produced by this crate.
pub const SETUP_VERSION: u32 = 2;
const SETUP_MAGIC: &[u8] = b"QBRIDGE_SETUP";

/// Failures handling setup files.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    /// No setup is configured or the file is absent.
    #[error("setup missing: {0}")]
    Missing(String),
    /// The file was produced for another format version.
    #[error("setup version {found} does not match expected {expected}")]
    VersionMismatch {
        /// Version this build understands.
        expected: u32,
        /// Version found.
        found: u32,
    },
    /// The file does not hash to the pinned digest.
    #[error("setup digest mismatch: expected {expected}, found {found}")]
    DigestMismatch {
        /// Pinned digest, hex.
        expected: String,
        /// Computed digest, hex.
        found: String,
    },
    /// The shape cannot be compiled.
    #[error("invalid circuit shape: {0}")]
    InvalidShape(String),
    /// Key encoding failed.
    #[error("setup encoding error: {0}")]
    Encoding(String),
    /// Parameter generation failed.
    #[error("parameter generation failed: {0}")]
    Synthesis(String),
    /// Filesystem failure.
    #[error("setup I/O error: {0}")]
    Io(String),
}

/// Proving key of the transition circuit at one shape.
#[derive(Clone)]
pub struct SetupParameters {
    /// Format version.
    pub version: u32,
    /// Shape the key was generated for.
    pub shape: CircuitShape,
    /// Key for [`TransitionCircuit`].
    pub transition: ProvingKey<BW6_761>,
}

impl std::fmt::Debug for SetupParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupParameters")
            .field("version", &self.version)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Runs the parameter ceremony for `shape`.
///
/// Whoever holds `rng`'s output can forge proofs; a production ceremony
/// discards it.
pub fn trusted_setup<R: RngCore + CryptoRng>(
    shape: CircuitShape,
    rng: &mut R,
) -> Result<SetupParameters, SetupError> {
    shape.validate().map_err(SetupError::InvalidShape)?;
    let transition = Groth16::<BW6_761, Reduction>::generate_random_parameters_with_reduction(
        TransitionCircuit::blank(shape),
        rng,
    )
    .map_err(|e| SetupError::Synthesis(e.to_string()))?;
    info!(
        max_steps = shape.max_steps,
        max_validators = shape.max_validators,
        "structured setup generated"
    );
    Ok(SetupParameters {
        version: SETUP_VERSION,
        shape,
        transition,
    })
}

impl SetupParameters {
    /// Canonical file encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SetupError> {
        let mut out = Vec::new();
        out.extend_from_slice(SETUP_MAGIC);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.shape.max_steps as u64).to_be_bytes());
        out.extend_from_slice(&(self.shape.max_validators as u64).to_be_bytes());
        self.transition
            .serialize_with_mode(&mut out, Compress::Yes)
            .map_err(|e| SetupError::Encoding(e.to_string()))?;
        Ok(out)
    }

    /// Decodes [`Self::to_bytes`] output, validating every curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SetupError> {
        let header = SETUP_MAGIC.len() + 4 + 16;
        if bytes.len() < header || &bytes[..SETUP_MAGIC.len()] != SETUP_MAGIC {
            return Err(SetupError::Encoding("not a setup file".into()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[SETUP_MAGIC.len()..SETUP_MAGIC.len() + 4]);
        let version = u32::from_be_bytes(word);
        if version != SETUP_VERSION {
            return Err(SetupError::VersionMismatch {
                expected: SETUP_VERSION,
                found: version,
            });
        }
        let read_u64 = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(buf) as usize
        };
        let shape = CircuitShape {
            max_steps: read_u64(SETUP_MAGIC.len() + 4),
            max_validators: read_u64(SETUP_MAGIC.len() + 12),
        };
        shape.validate().map_err(SetupError::InvalidShape)?;
        let mut cursor = Cursor::new(&bytes[header..]);
        let transition =
            ProvingKey::deserialize_with_mode(&mut cursor, Compress::Yes, Validate::Yes)
                .map_err(|e| SetupError::Encoding(e.to_string()))?;
        if cursor.position() as usize != bytes.len() - header {
            return Err(SetupError::Encoding("trailing bytes after the proving key".into()));
        }
        Ok(Self {
            version,
            shape,
            transition,
        })
    }

    /// SHA-256 of the file encoding.
    pub fn digest(&self) -> Result<Digest, SetupError> {
        Ok(sha256(&self.to_bytes()?))
    }

    /// Verifying keys, prepared for pairing checks.
    pub fn verifier_keys(&self) -> VerifierKeys {
        VerifierKeys {
            version: self.version,
            shape: self.shape,
            transition: prepare_verifying_key(&self.transition.vk),
        }
    }
}

/// Prepared verifying key matching one [`SetupParameters`].
#[derive(Clone)]
pub struct VerifierKeys {
    /// Format version.
    pub version: u32,
    /// Shape of the circuit.
    pub shape: CircuitShape,
    /// Key for transition proofs.
    pub transition: PreparedVerifyingKey<BW6_761>,
}

impl std::fmt::Debug for VerifierKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierKeys")
            .field("version", &self.version)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

fn sha256(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Pins a setup file by version and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupManifest {
    /// Expected format version.
    pub version: u32,
    /// Expected SHA-256 of the file.
    #[serde(with = "serde_hex::digest")]
    pub digest: Digest,
    /// Location of the setup file.
    pub path: PathBuf,
}

/// Writes `params` to `path` (via a temporary file) and returns its manifest.
pub fn write_setup(params: &SetupParameters, path: &Path) -> Result<SetupManifest, SetupError> {
    let bytes = params.to_bytes()?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| SetupError::Io(e.to_string()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, &bytes).map_err(|e| SetupError::Io(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| SetupError::Io(e.to_string()))?;
    Ok(SetupManifest {
        version: params.version,
        digest: sha256(&bytes),
        path: path.to_path_buf(),
    })
}

/// Loads the setup pinned by `manifest`.
pub fn load_setup(manifest: &SetupManifest) -> Result<SetupParameters, SetupError> {
    if manifest.version != SETUP_VERSION {
        return Err(SetupError::VersionMismatch {
            expected: SETUP_VERSION,
            found: manifest.version,
        });
    }
    let bytes = match fs::read(&manifest.path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SetupError::Missing(manifest.path.display().to_string()))
        }
        Err(e) => return Err(SetupError::Io(e.to_string())),
    };
    let found = sha256(&bytes);
    if found != manifest.digest {
        return Err(SetupError::DigestMismatch {
            expected: hex::encode(manifest.digest),
            found: hex::encode(found),
        });
    }
    let params = SetupParameters::from_bytes(&bytes)?;
    info!(
        path = %manifest.path.display(),
        digest = %hex::encode(found),
        "structured setup loaded"
    );
    Ok(params)
}

/// Setup shared by tests across modules; generated once per process.
#[cfg(test)]
pub(crate) fn shared_test_setup() -> std::sync::Arc<SetupParameters> {
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::{Arc, OnceLock};

    static SETUP: OnceLock<Arc<SetupParameters>> = OnceLock::new();
    SETUP
        .get_or_init(|| {
            let shape = CircuitShape {
                max_steps: 2,
                max_validators: 4,
            };
            Arc::new(trusted_setup(shape, &mut StdRng::seed_from_u64(42)).unwrap())
        })
        .clone()
}
