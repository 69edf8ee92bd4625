//! CPU compute backend
//!
//! Splits large buffers into fixed-length tiles and runs the [`crate::simd`]
//! kernels on each tile. Whether a call is tiled depends only on the
//! evaluation mode, `par_threshold` and `size`; whether the tiles then run on
//! Rayon workers or in a plain loop depends on thread availability. Partial
//! sums are folded in tile order either way, so a reduction depends on
//! `chunk_len` but never on the number of threads, nesting or scheduling.
//!
//! The kernels never allocate. A parallel tiled reduction collects one
//! partial sum per tile into a `Vec` at this layer before folding it.

use rayon::prelude::*;
use vf_core::traits::check_len;
use vf_core::{EvalMode, Error, KernelBackend, KernelConfig, Result};

use crate::simd;

/// Default minimum `size` before a call is split into tiles.
pub const DEFAULT_PAR_THRESHOLD: usize = 8_000;

/// Default tile length.
pub const DEFAULT_CHUNK_LEN: usize = 1024;

/// CPU compute backend using Rayon for parallelism
///
/// Unlike the [`crate::simd`] kernels, a parallel tiled reduction allocates:
/// one `f64` partial per tile, collected so they can be folded in tile order.
pub struct CpuBackend {
    /// Number of threads (0 = global Rayon pool)
    pub n_threads: usize,
    /// Minimum `size` before a call is split into tiles
    pub par_threshold: usize,
    /// Elements per tile (must be > 0)
    pub chunk_len: usize,
    pool: Option<rayon::ThreadPool>,
}

impl CpuBackend {
    /// Create a new CPU backend on the global Rayon pool
    pub fn new() -> Self {
        Self {
            n_threads: 0,
            par_threshold: DEFAULT_PAR_THRESHOLD,
            chunk_len: DEFAULT_CHUNK_LEN,
            pool: None,
        }
    }

    /// Create a CPU backend with a dedicated pool of `n_threads` workers.
    ///
    /// `n_threads == 0` uses the global pool, like [`CpuBackend::new`].
    pub fn with_threads(n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Ok(Self::new());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
        log::debug!("CPU backend: dedicated pool with {n_threads} threads");
        Ok(Self { n_threads, pool: Some(pool), ..Self::new() })
    }

    /// Create a CPU backend from a validated [`KernelConfig`].
    ///
    /// Only the per-backend fields are used; apply the process-wide switches
    /// with [`crate::apply_config`].
    pub fn from_config(config: &KernelConfig) -> Result<Self> {
        config.validate()?;
        let mut backend = Self::with_threads(config.n_threads)?;
        backend.par_threshold = config.par_threshold;
        backend.chunk_len = config.chunk_len;
        log::debug!(
            "CPU backend: n_threads={}, par_threshold={}, chunk_len={}",
            backend.n_threads,
            backend.par_threshold,
            backend.chunk_len
        );
        Ok(backend)
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Whether a call of this `size` is split into `chunk_len` tiles.
    pub fn is_tiled(&self, size: usize) -> bool {
        crate::eval_mode() == EvalMode::Fast && size >= self.par_threshold
    }

    /// Whether a call of this `size` would be tiled across workers.
    pub fn is_parallel(&self, size: usize) -> bool {
        self.is_tiled(size) && self.workers_available()
    }

    /// Whether tiles may be dispatched to Rayon workers from this thread.
    fn workers_available(&self) -> bool {
        // Avoid nested Rayon parallelism (e.g. a per-block parallel driver
        // calling into an element-parallel kernel): stay sequential on workers.
        if rayon::current_thread_index().is_some() {
            return false;
        }
        let threads = match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        };
        threads > 1
    }

    /// Tiled [`simd::mul_add`]. Buffer lengths are the caller's responsibility.
    pub fn mul_add_unchecked(&self, size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) {
        if !self.is_parallel(size) {
            simd::mul_add(size, coeff, iarray, oarray);
            return;
        }

        let chunk = self.chunk_len;
        let iarray = &iarray[..size];
        let oarray = &mut oarray[..size];
        self.install(|| {
            oarray.par_chunks_mut(chunk).zip(iarray.par_chunks(chunk)).for_each(|(o, i)| {
                simd::mul_add(o.len(), coeff, i, o);
            });
        });
    }

    /// Tiled [`simd::nll_reduce`]. Buffer lengths are the caller's responsibility.
    pub fn nll_reduce_unchecked(
        &self,
        size: usize,
        pdfvals: &[f64],
        weights: &[f64],
        sumcoeff: f64,
        working_area: &mut [f64],
    ) -> f64 {
        if !self.is_tiled(size) {
            return simd::nll_reduce(size, pdfvals, weights, sumcoeff, working_area);
        }

        let chunk = self.chunk_len;
        let pdfvals = &pdfvals[..size];
        let weights = &weights[..size];
        let working_area = &mut working_area[..size];

        if !self.workers_available() {
            let mut total = 0.0;
            let tiles = working_area
                .chunks_mut(chunk)
                .zip(pdfvals.chunks(chunk))
                .zip(weights.chunks(chunk));
            for ((work, p), w) in tiles {
                total += simd::nll_reduce(work.len(), p, w, sumcoeff, work);
            }
            return total;
        }

        let partials: Vec<f64> = self.install(|| {
            working_area
                .par_chunks_mut(chunk)
                .zip(pdfvals.par_chunks(chunk))
                .zip(weights.par_chunks(chunk))
                .map(|((work, p), w)| simd::nll_reduce(work.len(), p, w, sumcoeff, work))
                .collect()
        });
        fold_in_order(&partials)
    }

    /// Tiled [`simd::nll_reduce_in_place`].
    ///
    /// Returns [`Error::Validation`] if either buffer is shorter than `size`.
    pub fn nll_reduce_in_place(
        &self,
        size: usize,
        pdfvals_work: &mut [f64],
        weights: &[f64],
        sumcoeff: f64,
    ) -> Result<f64> {
        check_len("pdfvals_work", pdfvals_work.len(), size)?;
        check_len("weights", weights.len(), size)?;

        if !self.is_tiled(size) {
            return Ok(simd::nll_reduce_in_place(size, pdfvals_work, weights, sumcoeff));
        }

        let chunk = self.chunk_len;
        let buf = &mut pdfvals_work[..size];
        let weights = &weights[..size];

        if !self.workers_available() {
            let mut total = 0.0;
            for (b, w) in buf.chunks_mut(chunk).zip(weights.chunks(chunk)) {
                total += simd::nll_reduce_in_place(b.len(), b, w, sumcoeff);
            }
            return Ok(total);
        }

        let partials: Vec<f64> = self.install(|| {
            buf.par_chunks_mut(chunk)
                .zip(weights.par_chunks(chunk))
                .map(|(b, w)| simd::nll_reduce_in_place(b.len(), b, w, sumcoeff))
                .collect()
        });
        Ok(fold_in_order(&partials))
    }
}

/// Left-to-right fold, bit-identical to the sequential tile loop.
fn fold_in_order(partials: &[f64]) -> f64 {
    partials.iter().fold(0.0, |total, &p| total + p)
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBackend for CpuBackend {
    fn mul_add(&self, size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) -> Result<()> {
        check_len("iarray", iarray.len(), size)?;
        check_len("oarray", oarray.len(), size)?;
        self.mul_add_unchecked(size, coeff, iarray, oarray);
        Ok(())
    }

    fn nll_reduce(
        &self,
        size: usize,
        pdfvals: &[f64],
        weights: &[f64],
        sumcoeff: f64,
        working_area: &mut [f64],
    ) -> Result<f64> {
        check_len("pdfvals", pdfvals.len(), size)?;
        check_len("weights", weights.len(), size)?;
        check_len("working_area", working_area.len(), size)?;
        Ok(self.nll_reduce_unchecked(size, pdfvals, weights, sumcoeff, working_area))
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_switches;
    use approx::assert_relative_eq;

    fn make_block(n: usize) -> (Vec<f64>, Vec<f64>) {
        let pdfvals = (0..n).map(|i| 0.01 + (i as f64 * 0.61) % 3.0).collect();
        let weights = (0..n).map(|i| 1.0 + (i % 3) as f64 * 0.25).collect();
        (pdfvals, weights)
    }

    fn tiled(n_threads: usize) -> CpuBackend {
        let mut backend = CpuBackend::with_threads(n_threads).unwrap();
        backend.par_threshold = 64;
        backend.chunk_len = 16;
        backend
    }

    #[test]
    fn test_cpu_backend_creation() {
        let backend = CpuBackend::new();
        assert_eq!(backend.name(), "CPU");
        assert_eq!(backend.chunk_len, DEFAULT_CHUNK_LEN);
    }

    #[test]
    fn test_cpu_backend_with_threads() {
        let backend = CpuBackend::with_threads(4).unwrap();
        assert_eq!(backend.n_threads, 4);
    }

    #[test]
    fn test_from_config_rejects_zero_chunk() {
        let config = KernelConfig { chunk_len: 0, ..KernelConfig::default() };
        assert!(matches!(CpuBackend::from_config(&config), Err(Error::Validation(_))));
    }

    #[test]
    fn test_small_sizes_stay_sequential() {
        let backend = tiled(4);
        assert!(!backend.is_parallel(63));
    }

    #[test]
    fn test_trait_rejects_short_working_area() {
        let backend = CpuBackend::new();
        let mut work = [0.0; 1];
        let err = backend.nll_reduce(2, &[1.0, 2.0], &[1.0, 1.0], 1.0, &mut work).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("working_area")));
    }

    #[test]
    fn test_tiled_mul_add_matches_kernel() {
        let backend = tiled(3);
        let (iarray, base) = make_block(1000);
        let mut tiled_out = base.clone();
        let mut ref_out = base;
        backend.mul_add(1000, 1.75, &iarray, &mut tiled_out).unwrap();
        simd::mul_add_scalar(1000, 1.75, &iarray, &mut ref_out);
        assert_eq!(tiled_out, ref_out);
    }

    #[test]
    fn test_tiled_reduce_independent_of_thread_count() {
        let _guard = lock_switches();
        let n = 10_007;
        let (pdfvals, weights) = make_block(n);

        let reduce = |backend: &CpuBackend| {
            let mut work = vec![0.0; n];
            let r = backend.nll_reduce(n, &pdfvals, &weights, 1.5, &mut work).unwrap();
            (r, work)
        };

        let single = tiled(1);
        assert!(single.is_tiled(n));
        assert!(!single.is_parallel(n));

        let (r1, work1) = reduce(&single);
        let (r2, work2) = reduce(&tiled(2));
        let (r5, work5) = reduce(&tiled(5));
        assert_eq!(r1.to_bits(), r2.to_bits());
        assert_eq!(r2.to_bits(), r5.to_bits());
        assert_eq!(work1, work2);
        assert_eq!(work2, work5);

        // Called from a Rayon worker: tiles run sequentially, same fold.
        let outer = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let inner = tiled(5);
        let (r_nested, work_nested) = outer.install(|| {
            assert!(!inner.is_parallel(n));
            reduce(&inner)
        });
        assert_eq!(r_nested.to_bits(), r5.to_bits());
        assert_eq!(work_nested, work5);

        let mut work_ref = vec![0.0; n];
        let reference = simd::nll_reduce_scalar(n, &pdfvals, &weights, 1.5, &mut work_ref);
        assert_eq!(work2, work_ref);
        assert_relative_eq!(r2, reference, epsilon = 1e-10, max_relative = 1e-12);
    }

    #[test]
    fn test_tiled_in_place_independent_of_thread_count() {
        let _guard = lock_switches();
        let n = 4_099;
        let (pdfvals, weights) = make_block(n);

        let reduce = |backend: &CpuBackend| {
            let mut buf = pdfvals.clone();
            let r = backend.nll_reduce_in_place(n, &mut buf, &weights, 0.75).unwrap();
            (r, buf)
        };

        let (r1, buf1) = reduce(&tiled(1));
        let (r4, buf4) = reduce(&tiled(4));
        assert_eq!(r1.to_bits(), r4.to_bits());
        assert_eq!(buf1, buf4);

        let outer = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let inner = tiled(4);
        let (r_nested, _) = outer.install(|| reduce(&inner));
        assert_eq!(r_nested.to_bits(), r4.to_bits());
    }

    #[test]
    fn test_tiled_in_place_matches_out_of_place() {
        let backend = tiled(2);
        let (pdfvals, weights) = make_block(517);
        let mut work = vec![0.0; 517];
        let expected = backend.nll_reduce(517, &pdfvals, &weights, 0.5, &mut work).unwrap();

        let mut buf = pdfvals;
        let result = backend.nll_reduce_in_place(517, &mut buf, &weights, 0.5).unwrap();
        assert_eq!(buf, work);
        assert_relative_eq!(result, expected, epsilon = 1e-10, max_relative = 1e-12);
    }
}
