//! Core traits for vecfit
//!
//! A likelihood evaluator drives the two kernels through [`KernelBackend`]
//! so it never depends on how a backend tiles or vectorizes the work.

use crate::Result;

/// Kernel backend trait - abstraction over the accumulation and reduction kernels.
///
/// Unlike the raw kernels in `vf-compute::simd`, trait methods validate buffer
/// lengths and report undersized buffers as [`crate::Error::Validation`].
/// Numeric domain violations are never errors: they surface as NaN/infinity
/// in the returned values.
pub trait KernelBackend: Send + Sync {
    /// `oarray[i] += coeff * iarray[i]` for `i in 0..size`.
    fn mul_add(&self, size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) -> Result<()>;

    /// `working_area[i] = weights[i] * ln(pdfvals[i] / sumcoeff)` for `i in 0..size`,
    /// returning the sum of the written terms.
    fn nll_reduce(
        &self,
        size: usize,
        pdfvals: &[f64],
        weights: &[f64],
        sumcoeff: f64,
        working_area: &mut [f64],
    ) -> Result<f64>;

    /// Backend name (e.g., "CPU")
    fn name(&self) -> &str;
}

/// Check that a buffer holds at least `size` elements.
pub fn check_len(what: &str, len: usize, size: usize) -> Result<()> {
    if len < size {
        return Err(crate::Error::Validation(format!(
            "{what} has {len} elements, kernel size is {size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct DummyBackend;

    impl KernelBackend for DummyBackend {
        fn mul_add(
            &self,
            size: usize,
            _coeff: f64,
            iarray: &[f64],
            oarray: &mut [f64],
        ) -> Result<()> {
            check_len("iarray", iarray.len(), size)?;
            check_len("oarray", oarray.len(), size)
        }

        fn nll_reduce(
            &self,
            _size: usize,
            _pdfvals: &[f64],
            _weights: &[f64],
            _sumcoeff: f64,
            _working_area: &mut [f64],
        ) -> Result<f64> {
            Ok(0.0)
        }

        fn name(&self) -> &str {
            "Dummy"
        }
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend;
        assert_eq!(backend.name(), "Dummy");
        assert!(backend.nll_reduce(0, &[], &[], 1.0, &mut []).is_ok());
    }

    #[test]
    fn test_check_len_rejects_short_buffer() {
        let backend = DummyBackend;
        let mut out = [0.0; 2];
        let err = backend.mul_add(3, 1.0, &[1.0, 2.0, 3.0], &mut out).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("oarray")));
    }

    #[test]
    fn test_check_len_accepts_longer_buffer() {
        assert!(check_len("weights", 10, 4).is_ok());
        assert!(check_len("weights", 0, 0).is_ok());
    }
}
