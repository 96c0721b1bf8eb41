use std::{fmt, fs, path::Path};

use serde::{Deserialize, Serialize};

/// Architecture hyperparameters shared by the encoder and decoder stacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub enc_heads: usize,
    pub dec_heads: usize,
    pub pf_dim: usize,
    pub dropout: f32,
    pub max_len: usize,
    pub pad_id: u32,
}

impl ModelConfig {
    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<(), NmtError> {
        let mut errors = Vec::new();

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.hidden_dim == 0 {
            errors.push("hidden_dim must be greater than 0".to_string());
        }
        if self.enc_layers == 0 || self.dec_layers == 0 {
            errors.push("encoder and decoder layer counts must be greater than 0".to_string());
        }
        if self.enc_heads == 0 || self.dec_heads == 0 {
            errors.push("encoder and decoder head counts must be greater than 0".to_string());
        }
        if self.enc_heads != 0 && self.hidden_dim % self.enc_heads != 0 {
            errors.push(format!(
                "hidden_dim ({}) must be divisible by enc_heads ({})",
                self.hidden_dim, self.enc_heads
            ));
        }
        if self.dec_heads != 0 && self.hidden_dim % self.dec_heads != 0 {
            errors.push(format!(
                "hidden_dim ({}) must be divisible by dec_heads ({})",
                self.hidden_dim, self.dec_heads
            ));
        }
        if self.pf_dim == 0 {
            errors.push("pf_dim must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push("dropout must be in [0, 1)".to_string());
        }
        if self.max_len == 0 {
            errors.push("max_len must be greater than 0".to_string());
        }
        if (self.pad_id as usize) >= self.vocab_size {
            errors.push(format!(
                "pad_id ({}) must be smaller than vocab_size ({})",
                self.pad_id, self.vocab_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NmtError::validation(errors))
        }
    }
}

/// Everything a single training run needs besides the architecture itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub data_dir: String,
    pub save_path: String,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub log_every: usize,
    pub seed: u64,
    pub use_loc: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), NmtError> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }
        if self.learning_rate <= 0.0 {
            errors.push("learning_rate must be greater than 0".to_string());
        }
        if self.weight_decay < 0.0 {
            errors.push("weight_decay must be >= 0".to_string());
        }
        if self.log_every == 0 {
            errors.push("log_every must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NmtError::validation(errors))
        }
    }

    /// Dump the resolved run + model configuration next to the run artifacts
    /// so a checkpoint can later be matched to the architecture it expects.
    pub fn save_with_model(
        &self,
        model: &ModelConfig,
        path: impl AsRef<Path>,
    ) -> Result<(), NmtError> {
        #[derive(Serialize)]
        struct Dump<'a> {
            run: &'a RunConfig,
            model: &'a ModelConfig,
        }
        let json = serde_json::to_string_pretty(&Dump { run: self, model })?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum NmtError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Tensor(candle_core::Error),
}

impl NmtError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for NmtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmtError::Io(err) => write!(f, "io error: {}", err),
            NmtError::Json(err) => write!(f, "failed to serialize configuration: {}", err),
            NmtError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            NmtError::Initialization(msg) => write!(f, "initialization failed: {}", msg),
            NmtError::Runtime(msg) => write!(f, "runtime failure: {}", msg),
            NmtError::Tensor(err) => write!(f, "tensor operation failed: {}", err),
        }
    }
}

impl std::error::Error for NmtError {}

impl From<std::io::Error> for NmtError {
    fn from(err: std::io::Error) -> Self {
        NmtError::Io(err)
    }
}

impl From<serde_json::Error> for NmtError {
    fn from(err: serde_json::Error) -> Self {
        NmtError::Json(err)
    }
}

impl From<candle_core::Error> for NmtError {
    fn from(err: candle_core::Error) -> Self {
        NmtError::Tensor(err)
    }
}
