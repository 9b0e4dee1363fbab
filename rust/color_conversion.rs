use crate::error::{NormalizeError, Result};
use crate::float_trait::MacenkoFloat;
use crate::utils::convert_image_to_matrix;
use rayon::prelude::*;
use ndarray::{Array2, Array3, ArrayView3};
use num_traits::Float;

/// Convert an RGB image to optical density.
///
/// The (H, W, 3) image is flattened to a 3×N matrix with one column per
/// pixel, and every entry is mapped through
///
/// ```text
/// OD = −ln((I + 1) / Io)
/// ```
///
/// The `+ 1` keeps black pixels finite. Nothing is clamped: pixels brighter
/// than `Io − 1` come out with a negative OD.
pub fn rgb_to_od<F: MacenkoFloat>(im_rgb: ArrayView3<u8>, io: F) -> Result<Array2<F>> {
    let (h, w, c) = im_rgb.dim();
    if h == 0 || w == 0 {
        return Err(NormalizeError::EmptyImage(h, w));
    }
    if c != 3 {
        return Err(NormalizeError::ChannelCount(c));
    }
    if !(Float::is_finite(io) && io > F::zero()) {
        return Err(NormalizeError::invalid("io", "must be a positive finite number"));
    }

    let pixels = convert_image_to_matrix(im_rgb)?;
    let mut od = pixels.mapv(|v| F::lit(v as f64));
    let one = F::one();
    od.par_mapv_inplace(|x| -Float::ln((x + one) / io));
    Ok(od)
}

/// Map a 3×N optical-density matrix back to an (H, W, 3) 8-bit image.
///
/// Intensities are `Io · exp(−OD)`, clamped to [0, 255] and truncated.
pub fn od_to_rgb<F: MacenkoFloat>(
    od: &Array2<F>,
    io: F,
    shape: (usize, usize),
) -> Result<Array3<u8>> {
    let (h, w) = shape;
    let intensities = od.mapv(|x| io * Float::exp(-x));
    intensities_to_image(&intensities, shape).map_err(|e| match e {
        NormalizeError::Shape(_) => NormalizeError::invalid(
            "od",
            format!("expected 3×{} matrix, got {:?}", h * w, od.shape()),
        ),
        other => other,
    })
}

/// Pack a 3×N matrix of intensities into an (H, W, 3) image.
///
/// Values above 255 saturate at 255 and values below zero at 0; the rest are
/// truncated toward zero. NaN becomes 0.
pub(crate) fn intensities_to_image<F: MacenkoFloat>(
    intensities: &Array2<F>,
    shape: (usize, usize),
) -> Result<Array3<u8>> {
    let (h, w) = shape;
    let max = F::lit(255.0);
    let mut data = vec![0u8; h * w * 3];
    let n = intensities.ncols();
    if intensities.nrows() != 3 || n != h * w {
        return Err(NormalizeError::Shape(ndarray::ShapeError::from_kind(
            ndarray::ErrorKind::IncompatibleShape,
        )));
    }

    data.par_chunks_mut(3).enumerate().for_each(|(i, pixel)| {
        for (ch, out) in pixel.iter_mut().enumerate() {
            let v = intensities[[ch, i]];
            let v = Float::min(Float::max(v, F::zero()), max);
            *out = v.to_u8().unwrap_or(0);
        }
    });

    Ok(Array3::from_shape_vec((h, w, 3), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn od_of_background_is_near_zero() {
        let im = Array3::<u8>::from_elem((1, 2, 3), 239);
        let od = rgb_to_od::<f64>(im.view(), 240.0).unwrap();
        assert_eq!(od.dim(), (3, 2));
        for &v in od.iter() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn od_of_black_is_finite() {
        let im = Array3::<u8>::zeros((1, 1, 3));
        let od = rgb_to_od::<f64>(im.view(), 240.0).unwrap();
        assert_relative_eq!(od[[0, 0]], 240.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn white_pixels_have_negative_od() {
        let im = Array3::<u8>::from_elem((1, 1, 3), 255);
        let od = rgb_to_od::<f32>(im.view(), 240.0).unwrap();
        assert!(od.iter().all(|&v| v < 0.0));
    }

    #[test]
    fn rejects_bad_shapes_and_io() {
        let empty = Array3::<u8>::zeros((0, 4, 3));
        assert!(matches!(
            rgb_to_od::<f64>(empty.view(), 240.0),
            Err(NormalizeError::EmptyImage(0, 4))
        ));
        let gray = Array3::<u8>::zeros((2, 2, 1));
        assert!(matches!(
            rgb_to_od::<f64>(gray.view(), 240.0),
            Err(NormalizeError::ChannelCount(1))
        ));
        let im = Array3::<u8>::zeros((2, 2, 3));
        assert!(rgb_to_od::<f64>(im.view(), 0.0).is_err());
    }

    #[test]
    fn od_to_rgb_saturates() {
        let od = arr2(&[[-1.0_f64], [0.0], [50.0]]);
        let im = od_to_rgb(&od, 240.0, (1, 1)).unwrap();
        assert_eq!(im[[0, 0, 0]], 255);
        assert_eq!(im[[0, 0, 1]], 240);
        assert_eq!(im[[0, 0, 2]], 0);
    }
}
