//! Macenko stain normalization of a single RGB tile.
//!
//! The image is converted to optical density, a two-stain basis is estimated
//! from its tissue pixels, every pixel is re-expressed in that basis, the
//! concentrations are rescaled to the reference maxima, and the tile is
//! rebuilt with the reference stain matrix.

use crate::color_conversion::{intensities_to_image, rgb_to_od};
use crate::color_deconvolution::{
    color_deconvolution, max_concentrations, reconstruct_rgb, rescale_concentrations,
};
use crate::error::{NormalizeError, Result};
use crate::float_trait::MacenkoFloat;
use crate::separate_stains_macenko_pca::{separate_stains_macenko_pca, StainSeparation};
use ndarray::{Array2, Array3, ArrayView3};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reference H&E stain matrix, one stain per column (hematoxylin, eosin).
pub const DEFAULT_HE_REF: [[f64; 2]; 3] = [[0.5626, 0.2159], [0.7201, 0.8012], [0.4062, 0.5581]];

/// Reference 99th-percentile concentrations (hematoxylin, eosin).
pub const DEFAULT_MAX_C_REF: [f64; 2] = [1.9705, 1.0308];

/// Parameters of the Macenko transform.
///
/// Read-only for the lifetime of a run and shared across workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacenkoParams {
    /// Transmitted light intensity.
    #[serde(rename = "Io")]
    pub io: f64,

    /// Percentile trimmed from each end of the stain angle distribution.
    pub alpha: f64,

    /// OD threshold below which a channel counts as transparent.
    pub beta: f64,

    /// Reference stain matrix (3×2, row-major).
    #[serde(rename = "HERef")]
    pub he_ref: [[f64; 2]; 3],

    /// Reference maximum concentrations.
    #[serde(rename = "maxCRef")]
    pub max_c_ref: [f64; 2],
}

impl Default for MacenkoParams {
    fn default() -> Self {
        Self {
            io: 240.0,
            alpha: 1.0,
            beta: 0.15,
            he_ref: DEFAULT_HE_REF,
            max_c_ref: DEFAULT_MAX_C_REF,
        }
    }
}

impl MacenkoParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.io.is_finite() && self.io > 0.0) {
            return Err(NormalizeError::invalid("Io", format!("must be positive, got {}", self.io)));
        }
        if !(self.alpha.is_finite() && (0.0..=100.0).contains(&self.alpha)) {
            return Err(NormalizeError::invalid(
                "alpha",
                format!("must be a percentile in [0, 100], got {}", self.alpha),
            ));
        }
        if !self.beta.is_finite() {
            return Err(NormalizeError::invalid("beta", "must be finite"));
        }
        if self.he_ref.iter().flatten().any(|v| !v.is_finite()) {
            return Err(NormalizeError::invalid("HERef", "contains non-finite values"));
        }
        if self.max_c_ref.iter().any(|v| !v.is_finite()) {
            return Err(NormalizeError::invalid("maxCRef", "contains non-finite values"));
        }
        Ok(())
    }

    pub fn he_ref_matrix<F: MacenkoFloat>(&self) -> Array2<F> {
        Array2::from_shape_fn((3, 2), |(r, c)| F::lit(self.he_ref[r][c]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    Normalized,
    /// No tissue pixel passed `beta`; the input is returned unchanged.
    NoTissue,
    /// The estimate or the reconstruction was not finite; the input is
    /// returned unchanged.
    NonFinite,
}

impl NormalizeOutcome {
    pub fn is_fallback(self) -> bool {
        !matches!(self, NormalizeOutcome::Normalized)
    }
}

/// A normalized tile plus what happened while producing it.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub image: Array3<u8>,
    pub outcome: NormalizeOutcome,
    /// Estimated source stain matrix (3×2), when one was found.
    pub stain_matrix: Option<Array2<f64>>,
    /// Source 99th-percentile concentrations before rescaling.
    pub max_concentrations: Option<[f64; 2]>,
}

impl Normalized {
    fn identity(image: ArrayView3<u8>, outcome: NormalizeOutcome) -> Self {
        Self {
            image: image.to_owned(),
            outcome,
            stain_matrix: None,
            max_concentrations: None,
        }
    }
}

/// Normalizes tiles toward one fixed reference appearance.
#[derive(Debug, Clone)]
pub struct StainNormalizer {
    params: MacenkoParams,
}

impl StainNormalizer {
    pub fn new(params: MacenkoParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &MacenkoParams {
        &self.params
    }

    pub fn normalize(&self, image: ArrayView3<u8>) -> Result<Normalized> {
        normalize_validated::<f64>(image, &self.params)
    }
}

impl Default for StainNormalizer {
    fn default() -> Self {
        Self {
            params: MacenkoParams::default(),
        }
    }
}

/// Apply Macenko color normalization to an H&E stained RGB image.
///
/// Computation runs in `F`. The output has the input's shape; fallbacks
/// return the input unchanged and are flagged in [`Normalized::outcome`].
pub fn macenko_normalize<F: MacenkoFloat>(
    image: ArrayView3<u8>,
    params: &MacenkoParams,
) -> Result<Normalized> {
    params.validate()?;
    normalize_validated::<F>(image, params)
}

fn normalize_validated<F: MacenkoFloat>(
    image: ArrayView3<u8>,
    params: &MacenkoParams,
) -> Result<Normalized> {
    let (h, w, _) = image.dim();
    let io = F::lit(params.io);

    let od = rgb_to_od(image, io)?;

    let estimate = match separate_stains_macenko_pca(&od, F::lit(params.alpha), F::lit(params.beta)) {
        StainSeparation::Estimated(e) => e,
        StainSeparation::NoTissue => {
            warn!("No tissue above beta={} in {}x{} image, returning it unchanged", params.beta, w, h);
            return Ok(Normalized::identity(image, NormalizeOutcome::NoTissue));
        }
        StainSeparation::Degenerate => {
            warn!("Degenerate stain estimate for {}x{} image, returning it unchanged", w, h);
            return Ok(Normalized::identity(image, NormalizeOutcome::NonFinite));
        }
    };
    debug!(
        "Stain angles [{:.4}, {:.4}], stain matrix {:?}",
        estimate.min_phi.to_f64_lossy(),
        estimate.max_phi.to_f64_lossy(),
        estimate.stain_matrix.mapv(|v| v.to_f64_lossy())
    );

    let mut concentrations = color_deconvolution(&od, estimate.stain_matrix.view())?;
    drop(od);

    let max_c = max_concentrations(&concentrations);
    let max_c_ref = [F::lit(params.max_c_ref[0]), F::lit(params.max_c_ref[1])];
    rescale_concentrations(&mut concentrations, max_c, max_c_ref);

    let rgb = reconstruct_rgb(&concentrations, params.he_ref_matrix::<F>().view(), io)?;
    drop(concentrations);

    if rgb.iter().any(|&v| !Float::is_finite(v)) {
        warn!("Non-finite reconstruction for {}x{} image, returning it unchanged", w, h);
        return Ok(Normalized::identity(image, NormalizeOutcome::NonFinite));
    }

    Ok(Normalized {
        image: intensities_to_image(&rgb, (h, w))?,
        outcome: NormalizeOutcome::Normalized,
        stain_matrix: Some(estimate.stain_matrix.mapv(|v| v.to_f64_lossy())),
        max_concentrations: Some([max_c[0].to_f64_lossy(), max_c[1].to_f64_lossy()]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn default_params_match_reference_values() {
        let p = MacenkoParams::default();
        assert_eq!(p.io, 240.0);
        assert_eq!(p.alpha, 1.0);
        assert_eq!(p.beta, 0.15);
        assert_eq!(p.he_ref[1], [0.7201, 0.8012]);
        assert_eq!(p.max_c_ref, [1.9705, 1.0308]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn params_serialize_with_short_keys() {
        let json = serde_json::to_value(MacenkoParams::default()).unwrap();
        assert_eq!(json["Io"], 240.0);
        assert!(json.get("HERef").is_some());
        assert!(json.get("maxCRef").is_some());

        let partial: MacenkoParams = serde_json::from_str(r#"{"alpha": 2.5}"#).unwrap();
        assert_eq!(partial.alpha, 2.5);
        assert_eq!(partial.io, 240.0);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let bad_io = MacenkoParams { io: 0.0, ..Default::default() };
        assert!(StainNormalizer::new(bad_io).is_err());
        let bad_alpha = MacenkoParams { alpha: 120.0, ..Default::default() };
        assert!(StainNormalizer::new(bad_alpha).is_err());
        let bad_ref = MacenkoParams { max_c_ref: [f64::NAN, 1.0], ..Default::default() };
        assert!(StainNormalizer::new(bad_ref).is_err());
    }

    #[test]
    fn empty_image_is_an_error() {
        let im = Array3::<u8>::zeros((0, 0, 3));
        assert!(matches!(
            StainNormalizer::default().normalize(im.view()),
            Err(NormalizeError::EmptyImage(0, 0))
        ));
    }

    #[test]
    fn uniform_tissue_colour_falls_back() {
        // A single colour gives a zero covariance; the basis collapses but the
        // result must still be a same-shaped image.
        let im = Array3::<u8>::from_elem((3, 3, 3), 100);
        let out = StainNormalizer::default().normalize(im.view()).unwrap();
        assert_eq!(out.image.dim(), (3, 3, 3));
    }
}
