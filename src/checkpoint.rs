//! Engine snapshots on disk.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::AcceptedUpdate;
use crate::types::{ChainState, ValidatorSet};

const CHECKPOINT_SCHEMA: &str = "qbridge.engine.checkpoint.v1";

/// Serialized engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    /// Schema identifier (`qbridge.engine.checkpoint.v1`).
    pub schema: String,
    /// Head and pending set.
    pub state: ChainState,
    /// Registered sets (active and pending only).
    pub validator_sets: Vec<ValidatorSet>,
    /// Recent accepted updates, oldest first.
    pub history: Vec<AcceptedUpdate>,
}

impl EngineCheckpoint {
    /// Wraps engine state with the current schema tag.
    pub fn new(
        state: ChainState,
        validator_sets: Vec<ValidatorSet>,
        history: Vec<AcceptedUpdate>,
    ) -> Self {
        Self {
            schema: CHECKPOINT_SCHEMA.to_string(),
            state,
            validator_sets,
            history,
        }
    }

    /// Rejects snapshots of another schema, snapshots missing the active set,
    /// and sets matching neither the active nor the pending commitment.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.schema != CHECKPOINT_SCHEMA {
            return Err(CheckpointError::InvalidSchema(self.schema.clone()));
        }
        let active = self.state.head.validator_set_commitment;
        if !self.validator_sets.iter().any(|set| set.commitment() == active) {
            return Err(CheckpointError::Inconsistent(format!(
                "active validator set {} is missing",
                hex::encode(active)
            )));
        }
        for set in &self.validator_sets {
            let commitment = set.commitment();
            if commitment != self.state.head.validator_set_commitment
                && Some(commitment) != self.state.pending_set
            {
                return Err(CheckpointError::Inconsistent(format!(
                    "validator set {} is neither active nor pending",
                    hex::encode(commitment)
                )));
            }
        }
        Ok(())
    }
}

/// Errors that may occur while handling checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// Underlying I/O or encoding failure.
    #[error("checkpoint I/O error: {0}")]
    Io(String),
    /// The schema tag was unexpected.
    #[error("invalid checkpoint schema: {0}")]
    InvalidSchema(String),
    /// The snapshot contradicts itself.
    #[error("inconsistent checkpoint: {0}")]
    Inconsistent(String),
}

fn file_name(state: &ChainState) -> String {
    format!(
        "checkpoint_{}_{}.json",
        state.head.epoch, state.head.height
    )
}

/// Writes `checkpoint` into `dir` via a temporary file and returns its path.
pub fn write_checkpoint(dir: &Path, checkpoint: &EngineCheckpoint) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir).map_err(|err| CheckpointError::Io(err.to_string()))?;
    let name = file_name(&checkpoint.state);
    let path = dir.join(&name);
    let tmp_path = dir.join(format!("{name}.tmp"));
    let contents = serde_json::to_string_pretty(checkpoint)
        .map_err(|err| CheckpointError::Io(err.to_string()))?;
    fs::write(&tmp_path, contents).map_err(|err| CheckpointError::Io(err.to_string()))?;
    fs::rename(&tmp_path, &path).map_err(|err| CheckpointError::Io(err.to_string()))?;
    Ok(path)
}

/// Reads and validates one checkpoint file.
pub fn load_checkpoint(path: &Path) -> Result<EngineCheckpoint, CheckpointError> {
    let contents = fs::read_to_string(path).map_err(|err| CheckpointError::Io(err.to_string()))?;
    let checkpoint: EngineCheckpoint =
        serde_json::from_str(&contents).map_err(|err| CheckpointError::Io(err.to_string()))?;
    checkpoint.validate()?;
    Ok(checkpoint)
}

/// Returns the checkpoint with the greatest `(epoch, height)` in `dir`, if any.
pub fn load_latest_checkpoint(dir: &Path) -> Result<Option<EngineCheckpoint>, CheckpointError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    let mut best: Option<((u64, u64), PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((epoch, height)) = stem
            .strip_prefix("checkpoint_")
            .and_then(|rest| rest.split_once('_'))
        else {
            continue;
        };
        if let (Ok(epoch), Ok(height)) = (epoch.parse::<u64>(), height.parse::<u64>()) {
            if best
                .as_ref()
                .map(|(position, _)| (epoch, height) > *position)
                .unwrap_or(true)
            {
                best = Some(((epoch, height), path));
            }
        }
    }
    best.map(|(_, path)| load_checkpoint(&path)).transpose()
}
