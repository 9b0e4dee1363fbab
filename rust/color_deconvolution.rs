use crate::error::{NormalizeError, Result};
use crate::float_trait::MacenkoFloat;
use crate::linalg::pseudo_inverse_3x2;
use crate::utils::percentile;
use nalgebra::Matrix3x2;
use ndarray::{Array2, ArrayView2, Axis};
use num_traits::Float;
use rayon::prelude::*;

fn check_stain_matrix<F: MacenkoFloat>(stain_matrix: &ArrayView2<F>) -> Result<Matrix3x2<F>> {
    if stain_matrix.shape() != [3, 2] {
        return Err(NormalizeError::invalid(
            "stain_matrix",
            format!("must be 3×2, got {:?}", stain_matrix.shape()),
        ));
    }
    if stain_matrix.iter().any(|&v| !Float::is_finite(v)) {
        return Err(NormalizeError::invalid("stain_matrix", "contains non-finite values"));
    }
    Ok(Matrix3x2::from_fn(|r, c| stain_matrix[[r, c]]))
}

fn check_od<F: MacenkoFloat>(od: &Array2<F>) -> Result<()> {
    if od.nrows() != 3 {
        return Err(NormalizeError::ChannelCount(od.nrows()));
    }
    Ok(())
}

/// Deconvolve a 3×N optical-density matrix into 2×N stain concentrations.
///
/// Solves `stain_matrix · C ≈ OD` in the least-squares sense for every pixel
/// at once, using the pseudo-inverse of the 3×2 stain matrix. A rank-deficient
/// stain matrix yields the minimum-norm solution.
pub fn color_deconvolution<F: MacenkoFloat>(
    od: &Array2<F>,
    stain_matrix: ArrayView2<F>,
) -> Result<Array2<F>> {
    check_od(od)?;
    let he = check_stain_matrix(&stain_matrix)?;
    let pinv = pseudo_inverse_3x2(&he)
        .ok_or_else(|| NormalizeError::invalid("stain_matrix", "pseudo-inverse failed"))?;

    let pinv = Array2::from_shape_fn((2, 3), |(r, c)| pinv[(r, c)]);
    Ok(pinv.dot(od))
}

/// Per-stain 99th percentile of a 2×N concentration matrix.
///
/// A zero (or empty) row maps to 1 so the later rescale stays finite.
pub fn max_concentrations<F: MacenkoFloat>(concentrations: &Array2<F>) -> [F; 2] {
    let q = F::lit(99.0);
    let mut out = [F::one(); 2];
    for (slot, row) in out.iter_mut().zip(concentrations.outer_iter()) {
        let v = percentile(row, q).unwrap_or(F::one());
        *slot = if v == F::zero() { F::one() } else { v };
    }
    out
}

/// Scale each concentration row `i` by `max_c_ref[i] / max_c[i]` in place.
pub fn rescale_concentrations<F: MacenkoFloat>(
    concentrations: &mut Array2<F>,
    max_c: [F; 2],
    max_c_ref: [F; 2],
) {
    concentrations
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let factor = max_c_ref[i] / max_c[i];
            row.mapv_inplace(|v| v * factor);
        });
}

/// Reconstruct RGB intensities from stain concentrations and a reference
/// stain matrix.
///
/// Inverts the deconvolution:
///
/// ```text
/// OD  = reference · C
/// RGB = Io · exp(−OD)
/// ```
///
/// Values above 255 saturate at 255. The result is a 3×N matrix of float
/// intensities; nothing else is clamped, so non-finite input stays visible.
pub fn reconstruct_rgb<F: MacenkoFloat>(
    concentrations: &Array2<F>,
    reference: ArrayView2<F>,
    io: F,
) -> Result<Array2<F>> {
    if concentrations.nrows() != 2 {
        return Err(NormalizeError::invalid(
            "concentrations",
            format!("must have 2 rows, got {}", concentrations.nrows()),
        ));
    }
    if reference.shape() != [3, 2] {
        return Err(NormalizeError::invalid(
            "reference",
            format!("must be 3×2, got {:?}", reference.shape()),
        ));
    }

    let max = F::lit(255.0);
    let mut rgb = reference.dot(concentrations);
    rgb.par_mapv_inplace(|od| {
        let v = io * Float::exp(-od);
        if v > max {
            max
        } else {
            v
        }
    });
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};

    fn he_ref() -> Array2<f64> {
        arr2(&[[0.5626, 0.2159], [0.7201, 0.8012], [0.4062, 0.5581]])
    }

    #[test]
    fn deconvolution_inverts_mixing() {
        let he = he_ref();
        let c = arr2(&[[0.5, 1.0, 0.0], [0.25, 0.0, 2.0]]);
        let od = he.dot(&c);
        let back = color_deconvolution(&od, he.view()).unwrap();
        for (a, b) in back.iter().zip(c.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn deconvolution_rejects_bad_matrix() {
        let od = Array2::<f64>::zeros((3, 4));
        let bad = Array2::<f64>::zeros((3, 3));
        assert!(color_deconvolution(&od, bad.view()).is_err());
        let nan = Array2::<f64>::from_elem((3, 2), f64::NAN);
        assert!(color_deconvolution(&od, nan.view()).is_err());
    }

    #[test]
    fn zero_percentile_becomes_one() {
        let c = arr2(&[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]]);
        let m = max_concentrations(&c);
        assert_eq!(m[0], 1.0);
        assert_relative_eq!(m[1], 2.98, epsilon = 1e-12);
    }

    #[test]
    fn rescale_is_per_row() {
        let mut c = arr2(&[[1.0, 2.0], [4.0, 8.0]]);
        rescale_concentrations(&mut c, [2.0, 4.0], [1.0, 1.0]);
        assert_eq!(c, arr2(&[[0.5, 1.0], [1.0, 2.0]]));
    }

    #[test]
    fn reconstruction_saturates_at_255() {
        // Negative concentrations push the intensity above Io.
        let c = arr2(&[[-5.0, 0.0], [-5.0, 0.0]]);
        let rgb = reconstruct_rgb(&c, he_ref().view(), 240.0).unwrap();
        assert!(rgb.column(0).iter().all(|&v| v == 255.0));
        assert!(rgb.column(1).iter().all(|&v| v == 240.0));
    }

    #[test]
    fn reconstruction_follows_beer_lambert() {
        let c = arr2(&[[1.0], [0.5]]);
        let rgb = reconstruct_rgb(&c, he_ref().view(), 240.0).unwrap();
        let expected = 240.0 * (-(0.5626 + 0.5 * 0.2159_f64)).exp();
        assert_relative_eq!(rgb[[0, 0]], expected, epsilon = 1e-10);
    }
}
