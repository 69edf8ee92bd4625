//! # vf-compute
//!
//! Accumulation and reduction kernels for likelihood evaluation.
//!
//! - [`simd`]: the two kernels (`mul_add`, `nll_reduce`) with SIMD, scalar
//!   and compensated variants.
//! - [`cpu`]: [`CpuBackend`], a `KernelBackend` that tiles large buffers over
//!   Rayon workers with a thread-count independent reduction order.
//!
//! ## Runtime switches
//!
//! Two process-wide switches pick the kernel variant:
//! - [`EvalMode`]: `Fast` (SIMD lanes, tiled parallelism) or `Parity`
//!   (scalar Kahan summation, sequential, bit-exact everywhere).
//! - the SIMD gate, see [`simd_enabled`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cpu;
pub mod simd;

pub use cpu::CpuBackend;
pub use vf_core::{EvalMode, KernelConfig};

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable that disables the SIMD fast-path when set (any value).
pub const DISABLE_SIMD_ENV: &str = "VECFIT_DISABLE_SIMD";

static EVAL_MODE: AtomicU8 = AtomicU8::new(0); // 0 = Fast

/// Set the process-wide evaluation mode.
///
/// - `EvalMode::Parity`: Kahan summation, SIMD disabled, no tiling.
/// - `EvalMode::Fast`: naive lane summation, SIMD/tiling enabled (default).
///
/// When parity mode is activated, it also disables SIMD automatically.
/// Switching back to `Fast` leaves the SIMD flag alone; use
/// [`set_simd_enabled`] or [`apply_config`] to turn it on again.
pub fn set_eval_mode(mode: EvalMode) {
    EVAL_MODE.store(mode as u8, Ordering::Relaxed);
    if mode == EvalMode::Parity {
        set_simd_enabled(false);
    }
}

/// Get the current evaluation mode.
pub fn eval_mode() -> EvalMode {
    match EVAL_MODE.load(Ordering::Relaxed) {
        1 => EvalMode::Parity,
        _ => EvalMode::Fast,
    }
}

static SIMD_DISABLED: AtomicBool = AtomicBool::new(false);

/// Programmatically enable or disable the SIMD fast-path.
///
/// The effect is process-wide and persists until called again.
pub fn set_simd_enabled(enabled: bool) {
    SIMD_DISABLED.store(!enabled, Ordering::Relaxed);
}

/// Returns true if the CPU can run the 4-lane f64 kernels natively.
#[inline(always)]
pub fn simd_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        // NEON is always available on aarch64
        true
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

fn simd_disabled_by_env() -> bool {
    static DISABLED: OnceLock<bool> = OnceLock::new();
    *DISABLED.get_or_init(|| std::env::var_os(DISABLE_SIMD_ENV).is_some())
}

/// Returns true if the SIMD fast-path is supported *and* enabled at runtime.
///
/// Three-layer gate (all must pass):
/// 1. **Hardware**: AVX2 on x86_64, NEON on aarch64.
/// 2. **Programmatic**: `set_simd_enabled(false)` disables (also done by parity mode).
/// 3. **Env var**: `VECFIT_DISABLE_SIMD=1` disables (read once, on first use).
#[inline]
pub fn simd_enabled() -> bool {
    simd_supported() && !SIMD_DISABLED.load(Ordering::Relaxed) && !simd_disabled_by_env()
}

/// Push a [`KernelConfig`] into the process-wide switches.
///
/// Thread counts and tile sizes are per-backend; see [`CpuBackend::from_config`].
pub fn apply_config(config: &KernelConfig) {
    set_eval_mode(config.eval_mode);
    if config.eval_mode == EvalMode::Fast {
        set_simd_enabled(config.simd);
    }
    log::debug!(
        "kernel config applied: eval_mode={:?}, simd_requested={}, simd_active={}",
        config.eval_mode,
        config.simd,
        simd_enabled()
    );
}
