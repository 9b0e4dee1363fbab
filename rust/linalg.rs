use crate::float_trait::MacenkoFloat;
use nalgebra::{Matrix2x3, Matrix3, Matrix3x2, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use num_traits::Float;
use rayon::prelude::*;

const COVARIANCE_BLOCK: usize = 4096;

/// Unbiased covariance of a 3×N matrix whose rows are the variables.
///
/// Accumulated relative to the first column, so identical columns give an
/// exactly zero matrix. With a single observation the N − 1 divisor is zero
/// and the result is non-finite; callers are expected to check.
pub fn covariance<F: MacenkoFloat>(m: &Array2<F>) -> Matrix3<F> {
    let n = m.ncols();
    if n == 0 {
        return Matrix3::from_element(<F as Float>::nan());
    }
    let origin = [m[[0, 0]], m[[1, 0]], m[[2, 0]]];

    // Fixed-size blocks summed in parallel, then combined in block order, so
    // the result does not depend on how the work was split across threads.
    // [Σd0, Σd1, Σd2, Σd0d0, Σd0d1, Σd0d2, Σd1d1, Σd1d2, Σd2d2]
    let partials: Vec<[F; 9]> = (0..n.div_ceil(COVARIANCE_BLOCK))
        .into_par_iter()
        .map(|b| {
            let mut acc = [F::zero(); 9];
            for i in b * COVARIANCE_BLOCK..((b + 1) * COVARIANCE_BLOCK).min(n) {
                let col = m.column(i);
                let d = [col[0] - origin[0], col[1] - origin[1], col[2] - origin[2]];
                acc[0] += d[0];
                acc[1] += d[1];
                acc[2] += d[2];
                acc[3] += d[0] * d[0];
                acc[4] += d[0] * d[1];
                acc[5] += d[0] * d[2];
                acc[6] += d[1] * d[1];
                acc[7] += d[1] * d[2];
                acc[8] += d[2] * d[2];
            }
            acc
        })
        .collect();

    let mut sums = [F::zero(); 9];
    for part in &partials {
        for (x, &y) in sums.iter_mut().zip(part) {
            *x += y;
        }
    }

    let nf = F::lit(n as f64);
    let denom = nf - F::one();
    let entry = |sdd: F, si: F, sj: F| (sdd - si * sj / nf) / denom;
    let c00 = entry(sums[3], sums[0], sums[0]);
    let c01 = entry(sums[4], sums[0], sums[1]);
    let c02 = entry(sums[5], sums[0], sums[2]);
    let c11 = entry(sums[6], sums[1], sums[1]);
    let c12 = entry(sums[7], sums[1], sums[2]);
    let c22 = entry(sums[8], sums[2], sums[2]);
    Matrix3::new(
        c00, c01, c02, //
        c01, c11, c12, //
        c02, c12, c22,
    )
}

/// The plane of greatest variance of a 3×3 covariance matrix.
///
/// Columns are the eigenvectors of the second-largest and then the largest
/// eigenvalue, i.e. the top two of an ascending eigendecomposition in their
/// natural order. Returns `None` if the input or the decomposition is not
/// finite.
pub fn principal_plane<F: MacenkoFloat>(cov: &Matrix3<F>) -> Option<Matrix3x2<F>> {
    if cov.iter().any(|&v| !Float::is_finite(v)) {
        return None;
    }
    // Every direction is an eigenvector of the zero matrix; take the last two
    // coordinate axes, as an ascending eigensolver would.
    if cov.iter().all(|&v| v == F::zero()) {
        let mut plane = Matrix3x2::<F>::zeros();
        plane[(1, 0)] = F::one();
        plane[(2, 1)] = F::one();
        return Some(plane);
    }
    let eig = SymmetricEigen::new(*cov);

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eig.eigenvalues[a]
            .partial_cmp(&eig.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut plane = Matrix3x2::<F>::zeros();
    plane.set_column(0, &eig.eigenvectors.column(order[1]));
    plane.set_column(1, &eig.eigenvectors.column(order[2]));

    if plane.iter().any(|&v| !Float::is_finite(v)) {
        return None;
    }
    Some(plane)
}

/// Moore-Penrose pseudo-inverse of a 3×2 matrix, via SVD.
///
/// `pinv(A) · b` is the minimum-norm least-squares solution of `A x ≈ b`.
/// Singular values below `ε · 3 · σ_max` are treated as zero.
pub fn pseudo_inverse_3x2<F: MacenkoFloat>(a: &Matrix3x2<F>) -> Option<Matrix2x3<F>> {
    let svd = a.svd(true, true);
    let s_max = svd
        .singular_values
        .iter()
        .fold(F::zero(), |m, &v| Float::max(m, v));
    let eps = <F as Float>::epsilon() * F::lit(3.0) * s_max;
    let pinv = svd.pseudo_inverse(eps).ok()?;
    if pinv.iter().any(|&v| !Float::is_finite(v)) {
        return None;
    }
    Some(pinv)
}

/// Get the magnitude of each column vector in a matrix
pub fn magnitude<F: MacenkoFloat>(m: &Array2<F>) -> Array1<F> {
    // Parallelize across columns for large matrices
    let v: Vec<F> = (0..m.ncols())
        .into_par_iter()
        .map(|i| Float::sqrt(m.column(i).dot(&m.column(i))))
        .collect();
    Array1::from(v)
}

/// Normalize each column vector in a matrix. Zero columns stay zero.
pub fn normalize<F: MacenkoFloat>(m: &Array2<F>) -> Array2<F> {
    let mag = magnitude(m);
    let mut result = m.to_owned();

    result
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(mag.as_slice().unwrap_or(&[]).par_iter())
        .for_each(|(mut col, &norm)| {
            if norm != F::zero() {
                col.mapv_inplace(|v| v / norm);
            } else {
                col.fill(F::zero());
            }
        });

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn covariance_matches_sample_formula() {
        let m = arr2(&[[1.0_f64, 2.0, 3.0, 4.0], [2.0, 4.0, 6.0, 8.0], [1.0, 1.0, 1.0, 1.0]]);
        let c = covariance(&m);
        assert_relative_eq!(c[(0, 0)], 5.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(c[(0, 1)], 10.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(c[(1, 1)], 20.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(c[(2, 2)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(c[(1, 0)], c[(0, 1)]);
    }

    #[test]
    fn covariance_of_single_column_is_not_finite() {
        let m = arr2(&[[1.0_f64], [2.0], [3.0]]);
        let c = covariance(&m);
        assert!(c.iter().any(|v| !v.is_finite()));
        assert!(principal_plane(&c).is_none());
    }

    #[test]
    fn covariance_is_bit_identical_across_thread_counts() {
        let n = 200_000;
        let m = Array2::from_shape_fn((3, n), |(r, c)| {
            ((c as u64 * 2_654_435_761 + r as u64 * 40_503) % 1_000_003) as f64 / 1_000_003.0 + 0.1 * r as f64
        });
        let with_threads = |t: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(t)
                .build()
                .unwrap()
                .install(|| covariance(&m))
        };
        let reference = with_threads(1);
        for t in [2, 4, 8] {
            for _ in 0..3 {
                let c = with_threads(t);
                for (a, b) in c.iter().zip(reference.iter()) {
                    assert_eq!(a.to_bits(), b.to_bits(), "{t} threads");
                }
            }
        }
    }

    #[test]
    fn identical_columns_have_zero_covariance() {
        let m = arr2(&[[0.3_f64, 0.3, 0.3], [0.7, 0.7, 0.7], [0.1, 0.1, 0.1]]);
        let c = covariance(&m);
        assert!(c.iter().all(|&v| v == 0.0));
        let plane = principal_plane(&c).unwrap();
        assert_eq!(plane[(1, 0)], 1.0);
        assert_eq!(plane[(2, 1)], 1.0);
    }

    #[test]
    fn pseudo_inverse_of_rank_one_is_finite() {
        let a = Matrix3x2::new(0.6_f64, 0.6, 0.8, 0.8, 0.0, 0.0);
        let pinv = pseudo_inverse_3x2(&a).unwrap();
        // minimum-norm solution splits the weight evenly
        let x = pinv * nalgebra::Vector3::new(0.6, 0.8, 0.0);
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-10);
        assert_relative_eq!(x[1], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn principal_plane_picks_top_two_axes() {
        let cov = Matrix3::new(1.0_f64, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 4.0);
        let plane = principal_plane(&cov).unwrap();
        // second largest (z) first, largest (y) second
        assert_relative_eq!(plane[(2, 0)].abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(plane[(1, 1)].abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(plane[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(plane[(0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pseudo_inverse_solves_least_squares() {
        let a = Matrix3x2::new(1.0_f64, 0.0, 0.0, 1.0, 1.0, 1.0);
        let pinv = pseudo_inverse_3x2(&a).unwrap();
        // exact solution x = (2, 3) for b = A x
        let b = a * nalgebra::Vector2::new(2.0, 3.0);
        let x = pinv * b;
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn normalize_gives_unit_columns() {
        let m = arr2(&[[3.0_f64, 0.0], [4.0, 0.0], [0.0, 0.0]]);
        let n = normalize(&m);
        assert_relative_eq!(n[[0, 0]], 0.6);
        assert_relative_eq!(n[[1, 0]], 0.8);
        assert_eq!(n.column(1).sum(), 0.0);
        assert_relative_eq!(magnitude(&n)[0], 1.0, epsilon = 1e-12);
    }
}
