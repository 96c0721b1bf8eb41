//! Final-weights persistence over safetensors.
//!
//! The file stores the raw parameter set only; it loads back solely into a
//! model constructed with the identical configuration. `VarMap::load` rejects
//! missing names and shape mismatches, which surfaces architecture drift as
//! an immediate error instead of silently corrupted weights.

use std::path::Path;

use candle_nn::VarMap;

use crate::config::NmtError;

pub const WEIGHTS_FILENAME: &str = "last_model.safetensors";

pub fn save_weights(varmap: &VarMap, path: impl AsRef<Path>) -> Result<(), NmtError> {
    let path = path.as_ref();
    varmap.save(path).map_err(|err| {
        NmtError::runtime(format!(
            "failed to save model weights to {}: {}",
            path.display(),
            err
        ))
    })
}

pub fn load_weights(varmap: &mut VarMap, path: impl AsRef<Path>) -> Result<(), NmtError> {
    let path = path.as_ref();
    varmap.load(path).map_err(|err| {
        NmtError::runtime(format!(
            "failed to load model weights from {}: {}",
            path.display(),
            err
        ))
    })
}
