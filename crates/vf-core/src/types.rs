//! Common configuration types for vecfit

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Evaluation mode for NLL reduction.
///
/// Controls the trade-off between numerical precision and speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Maximum speed: SIMD lanes, naive summation, tiled parallelism.
    /// Results are reproducible for a fixed build and configuration only.
    #[default]
    Fast = 0,
    /// Maximum precision: scalar Kahan summation, SIMD disabled, sequential.
    /// Results are bit-exact between runs and machines.
    Parity = 1,
}

/// Kernel evaluation settings.
///
/// Every field has a default, so `{}` is a valid JSON config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Summation/precision mode.
    pub eval_mode: EvalMode,
    /// Allow the SIMD fast-path when the CPU supports it.
    pub simd: bool,
    /// Worker threads for tiled evaluation (0 = global rayon pool).
    pub n_threads: usize,
    /// Minimum `size` before tiles are processed in parallel.
    pub par_threshold: usize,
    /// Elements per tile.
    pub chunk_len: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            eval_mode: EvalMode::Fast,
            simd: true,
            n_threads: 0,
            par_threshold: 8_000,
            chunk_len: 1024,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the tiling cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_len == 0 {
            return Err(Error::Validation("chunk_len must be > 0".into()));
        }
        Ok(())
    }
}
