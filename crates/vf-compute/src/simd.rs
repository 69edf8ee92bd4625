//! SIMD-optimized accumulation and reduction kernels.
//!
//! Uses `wide::f64x4` for 4-wide SIMD operations on f64.
//! Automatically dispatches to AVX2 on x86_64 and NEON on aarch64.
//!
//! Note: `wide::f64x4::ln()` has ~1000 ULP error, so we use lane-by-lane
//! scalar `f64::ln()` for accurate logarithms while still benefiting from
//! SIMD for the division, weighting and accumulation.
//!
//! # Buffer contract
//!
//! Every kernel takes an explicit `size` and reads/writes only the first
//! `size` elements of each buffer. Buffers must hold at least `size` elements;
//! this is checked by `debug_assert!` only, the release hot path does a single
//! sub-slice per buffer and no per-element checks. Input and output buffers
//! cannot overlap: `&[f64]` and `&mut [f64]` are never aliased. The one
//! supported overlap, a reducer whose density buffer doubles as its working
//! area, has its own entry point ([`nll_reduce_in_place`]).
//!
//! Neither kernel reports errors. A non-positive `pdfvals[i] / sumcoeff`
//! produces NaN or `-inf` in the working area and in the returned sum.

use vf_core::EvalMode;
use wide::f64x4;

/// Accurate lane-by-lane `ln()` using scalar `f64::ln()`.
///
/// `wide::f64x4::ln()` has insufficient precision (~1000 ULP).
/// This function extracts lanes, computes `f64::ln()` on each, and repacks.
#[inline(always)]
fn ln_f64x4(v: f64x4) -> f64x4 {
    let arr: [f64; 4] = v.into();
    f64x4::from([arr[0].ln(), arr[1].ln(), arr[2].ln(), arr[3].ln()])
}

#[inline(always)]
fn nll_term_scalar(pdfval: f64, weight: f64, sumcoeff: f64) -> f64 {
    weight * (pdfval / sumcoeff).ln()
}

#[inline(always)]
fn nll_term_f64x4(pdfvals: f64x4, weights: f64x4, sumcoeff: f64x4) -> f64x4 {
    weights * ln_f64x4(pdfvals / sumcoeff)
}

/// Kahan compensated sum.
#[inline]
fn kahan_sum(terms: &[f64]) -> f64 {
    let mut sum = 0.0_f64;
    let mut comp = 0.0_f64;
    for &term in terms {
        let y = term - comp;
        let t = sum + y;
        comp = (t - sum) - y;
        sum = t;
    }
    sum
}

/// 4-lane reduction body shared by [`nll_reduce_simd`] and [`nll_reduce_in_place`].
///
/// Densities are read from `pdfvals`, or from `out` itself when `pdfvals` is
/// `None`. Each index is read before it is written. All slices must already be
/// cut to the same length.
#[inline(always)]
fn nll_reduce_lanes(
    pdfvals: Option<&[f64]>,
    weights: &[f64],
    sumcoeff: f64,
    out: &mut [f64],
) -> f64 {
    let size = out.len();
    let chunks = size / 4;
    let sumcoeff4 = f64x4::splat(sumcoeff);
    let mut acc = f64x4::ZERO;

    for c in 0..chunks {
        let offset = c * 4;
        let p = match pdfvals {
            Some(src) => f64x4::from(&src[offset..offset + 4]),
            None => f64x4::from(&out[offset..offset + 4]),
        };
        let w = f64x4::from(&weights[offset..offset + 4]);
        let term = nll_term_f64x4(p, w, sumcoeff4);
        let arr: [f64; 4] = term.into();
        out[offset..offset + 4].copy_from_slice(&arr);
        acc += term;
    }

    // Horizontal sum of SIMD accumulator
    let mut total = acc.reduce_add();

    for idx in chunks * 4..size {
        let p = pdfvals.map_or(out[idx], |src| src[idx]);
        let term = nll_term_scalar(p, weights[idx], sumcoeff);
        out[idx] = term;
        total += term;
    }

    total
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Scaled accumulation: `oarray[i] += coeff * iarray[i]` for `i in 0..size`.
///
/// Dispatches to [`mul_add_simd`] when the SIMD fast-path is enabled, otherwise
/// to [`mul_add_scalar`]. Both produce bit-identical results: the multiply and
/// the add are rounded separately (never fused) in either path.
#[inline]
pub fn mul_add(size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) {
    if crate::simd_enabled() {
        mul_add_simd(size, coeff, iarray, oarray);
    } else {
        mul_add_scalar(size, coeff, iarray, oarray);
    }
}

/// Scalar reference implementation of [`mul_add`].
pub fn mul_add_scalar(size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) {
    debug_assert!(iarray.len() >= size, "iarray shorter than size");
    debug_assert!(oarray.len() >= size, "oarray shorter than size");

    let iarray = &iarray[..size];
    let oarray = &mut oarray[..size];
    for (o, &i) in oarray.iter_mut().zip(iarray) {
        *o += coeff * i;
    }
}

/// SIMD implementation of [`mul_add`] (4 lanes + scalar remainder).
pub fn mul_add_simd(size: usize, coeff: f64, iarray: &[f64], oarray: &mut [f64]) {
    debug_assert!(iarray.len() >= size, "iarray shorter than size");
    debug_assert!(oarray.len() >= size, "oarray shorter than size");

    let iarray = &iarray[..size];
    let oarray = &mut oarray[..size];

    let chunks = size / 4;
    let coeff4 = f64x4::splat(coeff);

    for c in 0..chunks {
        let offset = c * 4;
        let mut o = f64x4::from(&oarray[offset..offset + 4]);
        let i = f64x4::from(&iarray[offset..offset + 4]);
        o += coeff4 * i;
        let arr: [f64; 4] = o.into();
        oarray[offset..offset + 4].copy_from_slice(&arr);
    }

    for idx in chunks * 4..size {
        oarray[idx] += coeff * iarray[idx];
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// Weighted NLL reduction.
///
/// Writes `working_area[i] = weights[i] * ln(pdfvals[i] / sumcoeff)` for
/// `i in 0..size` and returns the sum of those terms.
///
/// The per-element terms are identical in every path; only the summation
/// order depends on the evaluation mode:
/// - [`EvalMode::Parity`]: [`nll_reduce_kahan`] (sequential, compensated).
/// - [`EvalMode::Fast`] with SIMD: [`nll_reduce_simd`] (4 lane accumulators).
/// - [`EvalMode::Fast`] without SIMD: [`nll_reduce_scalar`].
#[inline]
pub fn nll_reduce(
    size: usize,
    pdfvals: &[f64],
    weights: &[f64],
    sumcoeff: f64,
    working_area: &mut [f64],
) -> f64 {
    match crate::eval_mode() {
        EvalMode::Parity => nll_reduce_kahan(size, pdfvals, weights, sumcoeff, working_area),
        EvalMode::Fast if crate::simd_enabled() => {
            nll_reduce_simd(size, pdfvals, weights, sumcoeff, working_area)
        }
        EvalMode::Fast => nll_reduce_scalar(size, pdfvals, weights, sumcoeff, working_area),
    }
}

/// Scalar reference implementation of [`nll_reduce`] (left-to-right sum).
pub fn nll_reduce_scalar(
    size: usize,
    pdfvals: &[f64],
    weights: &[f64],
    sumcoeff: f64,
    working_area: &mut [f64],
) -> f64 {
    debug_assert!(pdfvals.len() >= size, "pdfvals shorter than size");
    debug_assert!(weights.len() >= size, "weights shorter than size");
    debug_assert!(working_area.len() >= size, "working_area shorter than size");

    let pdfvals = &pdfvals[..size];
    let weights = &weights[..size];
    let working_area = &mut working_area[..size];

    let mut total = 0.0;
    for ((out, &p), &w) in working_area.iter_mut().zip(pdfvals).zip(weights) {
        let term = nll_term_scalar(p, w, sumcoeff);
        *out = term;
        total += term;
    }
    total
}

/// SIMD implementation of [`nll_reduce`].
///
/// Terms are bit-identical to [`nll_reduce_scalar`]; the sum is accumulated in
/// four lanes, folded, then the scalar remainder is added.
pub fn nll_reduce_simd(
    size: usize,
    pdfvals: &[f64],
    weights: &[f64],
    sumcoeff: f64,
    working_area: &mut [f64],
) -> f64 {
    debug_assert!(pdfvals.len() >= size, "pdfvals shorter than size");
    debug_assert!(weights.len() >= size, "weights shorter than size");
    debug_assert!(working_area.len() >= size, "working_area shorter than size");

    let pdfvals = &pdfvals[..size];
    let weights = &weights[..size];
    let working_area = &mut working_area[..size];

    nll_reduce_lanes(Some(pdfvals), weights, sumcoeff, working_area)
}

/// Compensated implementation of [`nll_reduce`].
///
/// Fills the working area with the scalar terms, then Kahan-sums it.
/// Sequential and independent of SIMD width, so results are bit-exact across
/// machines.
pub fn nll_reduce_kahan(
    size: usize,
    pdfvals: &[f64],
    weights: &[f64],
    sumcoeff: f64,
    working_area: &mut [f64],
) -> f64 {
    debug_assert!(pdfvals.len() >= size, "pdfvals shorter than size");
    debug_assert!(weights.len() >= size, "weights shorter than size");
    debug_assert!(working_area.len() >= size, "working_area shorter than size");

    let pdfvals = &pdfvals[..size];
    let weights = &weights[..size];
    let working_area = &mut working_area[..size];

    for ((out, &p), &w) in working_area.iter_mut().zip(pdfvals).zip(weights) {
        *out = nll_term_scalar(p, w, sumcoeff);
    }
    kahan_sum(working_area)
}

/// [`nll_reduce`] where the density buffer is also the working area.
///
/// On return `pdfvals_work[i]` holds the weighted log term that replaced the
/// density at index `i`. Each element is read before it is overwritten, and
/// only at its own index, so the terms match the out-of-place kernels exactly.
/// Summation follows the same mode dispatch as [`nll_reduce`].
pub fn nll_reduce_in_place(
    size: usize,
    pdfvals_work: &mut [f64],
    weights: &[f64],
    sumcoeff: f64,
) -> f64 {
    debug_assert!(pdfvals_work.len() >= size, "pdfvals_work shorter than size");
    debug_assert!(weights.len() >= size, "weights shorter than size");

    let buf = &mut pdfvals_work[..size];
    let weights = &weights[..size];

    if crate::eval_mode() == EvalMode::Parity {
        for (slot, &w) in buf.iter_mut().zip(weights) {
            *slot = nll_term_scalar(*slot, w, sumcoeff);
        }
        return kahan_sum(buf);
    }

    if !crate::simd_enabled() {
        let mut total = 0.0;
        for (slot, &w) in buf.iter_mut().zip(weights) {
            let term = nll_term_scalar(*slot, w, sumcoeff);
            *slot = term;
            total += term;
        }
        return total;
    }

    nll_reduce_lanes(None, weights, sumcoeff, buf)
}
