use crate::float_trait::MacenkoFloat;
use crate::linalg::{covariance, normalize, principal_plane};
use crate::utils::{percentile, select_columns, tissue_indices};
use nalgebra::{Matrix3x2, Vector2};
use ndarray::{Array1, Array2};
use num_traits::Float;
use rayon::prelude::*;

/// A 3×2 stain basis together with the trimmed angle extrema it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StainEstimate<F> {
    /// Unit columns, hematoxylin first.
    pub stain_matrix: Array2<F>,
    pub min_phi: F,
    pub max_phi: F,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StainSeparation<F> {
    Estimated(StainEstimate<F>),
    /// No pixel passed the tissue threshold.
    NoTissue,
    /// The covariance or its eigendecomposition was not finite.
    Degenerate,
}

impl<F> StainSeparation<F> {
    pub fn estimate(&self) -> Option<&StainEstimate<F>> {
        match self {
            StainSeparation::Estimated(e) => Some(e),
            _ => None,
        }
    }
}

/// Compute the stain matrix for color deconvolution with the Macenko method.
///
/// `od` is a 3×N optical-density matrix. Pixels with any channel below
/// `beta` are ignored. The remaining pixels are projected onto the plane of
/// their two largest principal components, and the `alpha`-th and
/// `(100 − alpha)`-th percentile angles in that plane become the two stain
/// directions.
pub fn separate_stains_macenko_pca<F: MacenkoFloat>(
    od: &Array2<F>,
    alpha: F,
    beta: F,
) -> StainSeparation<F> {
    let tissue = tissue_indices(od, beta);
    if tissue.is_empty() {
        return StainSeparation::NoTissue;
    }
    let od_hat = select_columns(od, &tissue);
    drop(tissue);

    let Some(plane) = principal_plane(&covariance(&od_hat)) else {
        return StainSeparation::Degenerate;
    };

    let Some((min_phi, max_phi)) = angle_extrema(&od_hat, &plane, alpha) else {
        return StainSeparation::Degenerate;
    };
    drop(od_hat);

    let v_min = angle_to_vector(&plane, min_phi);
    let v_max = angle_to_vector(&plane, max_phi);

    // Hematoxylin is the direction with the larger first (red) component.
    let (first, second) = if v_min[0] > v_max[0] {
        (v_min, v_max)
    } else {
        (v_max, v_min)
    };

    let mut stains = Array2::<F>::zeros((3, 2));
    for i in 0..3 {
        stains[[i, 0]] = first[i];
        stains[[i, 1]] = second[i];
    }

    StainSeparation::Estimated(StainEstimate {
        stain_matrix: normalize(&stains),
        min_phi,
        max_phi,
    })
}

/// Robust angular extrema of tissue pixels inside the principal plane.
///
/// Each column of `od_hat` is projected onto `plane`, its polar angle taken
/// with `atan2`, and the `alpha`-th and `(100 − alpha)`-th percentiles
/// returned. `None` for an empty input or a non-finite result.
pub fn angle_extrema<F: MacenkoFloat>(
    od_hat: &Array2<F>,
    plane: &Matrix3x2<F>,
    alpha: F,
) -> Option<(F, F)> {
    let angles = get_angles(od_hat, plane);
    let min_phi = percentile(angles.view(), alpha)?;
    let max_phi = percentile(angles.view(), F::lit(100.0) - alpha)?;
    if !(Float::is_finite(min_phi) && Float::is_finite(max_phi)) {
        return None;
    }
    Some((min_phi, max_phi))
}

fn get_angles<F: MacenkoFloat>(od_hat: &Array2<F>, plane: &Matrix3x2<F>) -> Array1<F> {
    let v: Vec<F> = (0..od_hat.ncols())
        .into_par_iter()
        .map(|i| {
            let p = od_hat.column(i);
            let x = plane[(0, 0)] * p[0] + plane[(1, 0)] * p[1] + plane[(2, 0)] * p[2];
            let y = plane[(0, 1)] * p[0] + plane[(1, 1)] * p[1] + plane[(2, 1)] * p[2];
            Float::atan2(y, x)
        })
        .collect();
    Array1::from(v)
}

fn angle_to_vector<F: MacenkoFloat>(plane: &Matrix3x2<F>, phi: F) -> [F; 3] {
    let v = plane * Vector2::new(Float::cos(phi), Float::sin(phi));
    [v[0], v[1], v[2]]
}
