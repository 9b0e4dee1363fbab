use crate::error::Result;
use crate::float_trait::MacenkoFloat;
use ndarray::{Array2, ArrayView1, ArrayView3};
use num_traits::Float;
use rayon::prelude::*;
use std::cmp::Ordering;

/// Flatten an (H, W, C) image into a C×N matrix, one column per pixel in
/// row-major pixel order.
pub fn convert_image_to_matrix<T: Copy + Send + Sync>(im: ArrayView3<T>) -> Result<Array2<T>> {
    let (h, w, c) = im.dim();
    let flat = im.to_shape((h * w, c))?;
    Ok(flat.t().as_standard_layout().into_owned())
}

/// Gather the given columns of a matrix into a new, contiguous matrix.
pub fn select_columns<F: MacenkoFloat>(arr: &Array2<F>, indices: &[usize]) -> Array2<F> {
    let nrows = arr.nrows();
    let ncols = indices.len();
    if ncols == 0 {
        return Array2::zeros((nrows, 0));
    }

    let mut out = Array2::<F>::zeros((nrows, ncols));
    out.outer_iter_mut()
        .into_par_iter()
        .enumerate()
        .for_each(|(r, mut dst)| {
            let src = arr.row(r);
            for (d, &i) in dst.iter_mut().zip(indices) {
                *d = src[i];
            }
        });
    out
}

/// Indices of the columns whose every entry is at least `beta`.
///
/// With an OD matrix this is the tissue mask: a pixel is dropped as soon as
/// one channel is too transparent. NaN entries never pass.
pub fn tissue_indices<F: MacenkoFloat>(od: &Array2<F>, beta: F) -> Vec<usize> {
    (0..od.ncols())
        .into_par_iter()
        .filter(|&i| od.column(i).iter().all(|&v| v >= beta))
        .collect()
}

/// Total order on floats with NaN sorted after every number.
pub(crate) fn cmp_nan_last<F: MacenkoFloat>(a: &F, b: &F) -> Ordering {
    match (Float::is_nan(*a), Float::is_nan(*b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}

/// The `q`-th percentile (`q` in [0, 100]) with linear interpolation between
/// the two nearest ranks, the same rule as NumPy's default.
///
/// Returns `None` for an empty input.
pub fn percentile<F: MacenkoFloat>(values: ArrayView1<F>, q: F) -> Option<F> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mut v: Vec<F> = values.iter().copied().collect();

    let q = Float::min(Float::max(q, F::zero()), F::lit(100.0));
    let rank = q / F::lit(100.0) * F::lit((n - 1) as f64);
    let lo = Float::floor(rank).to_usize().unwrap_or(0).min(n - 1);
    let frac = rank - F::lit(lo as f64);

    let (_, lo_val, upper) = v.select_nth_unstable_by(lo, cmp_nan_last);
    let lo_val = *lo_val;
    if frac == F::zero() || upper.is_empty() {
        return Some(lo_val);
    }
    let hi_val = upper
        .iter()
        .copied()
        .min_by(cmp_nan_last)
        .unwrap_or(lo_val);

    let diff = hi_val - lo_val;
    if frac >= F::lit(0.5) {
        Some(hi_val - diff * (F::one() - frac))
    } else {
        Some(lo_val + diff * frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2, Array3};

    #[test]
    fn percentile_matches_linear_interpolation() {
        let v = arr1(&[4.0_f64, 1.0, 3.0, 2.0, 5.0]);
        assert_relative_eq!(percentile(v.view(), 0.0).unwrap(), 1.0);
        assert_relative_eq!(percentile(v.view(), 100.0).unwrap(), 5.0);
        assert_relative_eq!(percentile(v.view(), 50.0).unwrap(), 3.0);
        assert_relative_eq!(percentile(v.view(), 10.0).unwrap(), 1.4, epsilon = 1e-12);
        assert_relative_eq!(percentile(v.view(), 99.0).unwrap(), 4.96, epsilon = 1e-12);
    }

    #[test]
    fn percentile_of_empty_is_none() {
        let v = ndarray::Array1::<f64>::zeros(0);
        assert!(percentile(v.view(), 50.0).is_none());
    }

    #[test]
    fn percentile_puts_nan_last() {
        let v = arr1(&[f64::NAN, 1.0, 2.0]);
        assert_relative_eq!(percentile(v.view(), 0.0).unwrap(), 1.0);
        assert_relative_eq!(percentile(v.view(), 25.0).unwrap(), 1.5);
    }

    #[test]
    fn image_to_matrix_is_channel_major() {
        let mut im = Array3::<u8>::zeros((2, 2, 3));
        im[[0, 1, 0]] = 7;
        im[[1, 0, 2]] = 9;
        let m = convert_image_to_matrix(im.view()).unwrap();
        assert_eq!(m.dim(), (3, 4));
        assert_eq!(m[[0, 1]], 7);
        assert_eq!(m[[2, 2]], 9);
    }

    #[test]
    fn tissue_mask_requires_every_channel() {
        let od = arr2(&[[0.2, 0.2, 0.1], [0.3, 0.1, 0.5], [0.2, 0.4, 0.6]]);
        assert_eq!(tissue_indices(&od, 0.15), vec![0]);
    }

    #[test]
    fn select_columns_gathers_in_order() {
        let m = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let s = select_columns(&m, &[2, 0]);
        assert_eq!(s, arr2(&[[3.0, 1.0], [6.0, 4.0]]));
    }
}
