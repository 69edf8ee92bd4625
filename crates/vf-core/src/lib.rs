//! # vf-core
//!
//! Shared vocabulary for the vecfit kernels: error types, evaluation
//! configuration and the [`KernelBackend`] trait.
//!
//! Likelihood drivers depend on the trait defined here, not on the concrete
//! CPU implementation in `vf-compute`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::KernelBackend;
pub use types::{EvalMode, KernelConfig};
