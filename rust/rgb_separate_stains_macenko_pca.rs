use crate::color_conversion::rgb_to_od;
use crate::error::Result;
use crate::float_trait::MacenkoFloat;
use crate::separate_stains_macenko_pca::{separate_stains_macenko_pca, StainSeparation};
use ndarray::ArrayView3;

/// Compute the stain matrix for color deconvolution with the "Macenko" method from an RGB image.
pub fn rgb_separate_stains_macenko_pca<F: MacenkoFloat>(
    im_rgb: ArrayView3<u8>,
    io: F,
    alpha: F,
    beta: F,
) -> Result<StainSeparation<F>> {
    // Convert RGB to OD space
    let od = rgb_to_od(im_rgb, io)?;

    // Compute stain matrix
    Ok(separate_stains_macenko_pca(&od, alpha, beta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn white_tile_has_no_tissue() {
        let im = Array3::<u8>::from_elem((4, 4, 3), 250);
        let sep = rgb_separate_stains_macenko_pca::<f64>(im.view(), 240.0, 1.0, 0.15).unwrap();
        assert_eq!(sep, StainSeparation::NoTissue);
    }

    #[test]
    fn propagates_shape_errors() {
        let im = Array3::<u8>::zeros((4, 4, 4));
        assert!(rgb_separate_stains_macenko_pca::<f32>(im.view(), 240.0, 1.0, 0.15).is_err());
    }
}
