use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::prelude::*;
use pyo3::pyfunction;
use pyo3::PyResult;
use pyo3::Python;

use crate::color_conversion;
use crate::color_deconvolution;
use crate::error::NormalizeError;
use crate::macenko_normalize::{self, MacenkoParams};
use crate::rgb_separate_stains_macenko_pca::rgb_separate_stains_macenko_pca;
use crate::separate_stains_macenko_pca::{self, StainSeparation};

fn to_py_err(e: NormalizeError) -> PyErr {
    pyo3::exceptions::PyValueError::new_err(e.to_string())
}

fn build_params(
    io: Option<f64>,
    alpha: Option<f64>,
    beta: Option<f64>,
    he_ref: Option<Vec<Vec<f64>>>,
    max_c_ref: Option<Vec<f64>>,
) -> PyResult<MacenkoParams> {
    let mut params = MacenkoParams::default();
    if let Some(v) = io {
        params.io = v;
    }
    if let Some(v) = alpha {
        params.alpha = v;
    }
    if let Some(v) = beta {
        params.beta = v;
    }
    if let Some(rows) = he_ref {
        if rows.len() != 3 || rows.iter().any(|r| r.len() != 2) {
            return Err(pyo3::exceptions::PyValueError::new_err(
                "HERef must be a 3x2 matrix",
            ));
        }
        for (dst, src) in params.he_ref.iter_mut().zip(&rows) {
            *dst = [src[0], src[1]];
        }
    }
    if let Some(v) = max_c_ref {
        if v.len() != 2 {
            return Err(pyo3::exceptions::PyValueError::new_err(
                "maxCRef must have 2 entries",
            ));
        }
        params.max_c_ref = [v[0], v[1]];
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Macro to stamp out typed PyO3 function variants for each float precision.
//
// Each invocation generates:
//   - py_macenko_normalize_{suffix}
//   - py_rgb_to_od_{suffix}
//   - py_od_to_rgb_{suffix}
//   - py_rgb_separate_stains_macenko_pca_{suffix}
//   - py_separate_stains_macenko_pca_{suffix}
//   - py_color_deconvolution_{suffix}
//   - py_reconstruct_rgb_{suffix}
// ---------------------------------------------------------------------------
macro_rules! define_typed_pyfunctions {
    ($suffix:ident, $f:ty) => {
        ::paste::paste! {

        #[pyfunction]
        #[pyo3(signature = (im_rgb, io=None, alpha=None, beta=None, he_ref=None, max_c_ref=None))]
        fn [<py_macenko_normalize_ $suffix>]<'py>(
            py: Python<'py>,
            im_rgb: PyReadonlyArray3<'py, u8>,
            io: Option<f64>,
            alpha: Option<f64>,
            beta: Option<f64>,
            he_ref: Option<Vec<Vec<f64>>>,
            max_c_ref: Option<Vec<f64>>,
        ) -> PyResult<pyo3::Bound<'py, PyArray3<u8>>> {
            let params = build_params(io, alpha, beta, he_ref, max_c_ref)?;
            let arr = im_rgb.as_array();
            let result = macenko_normalize::macenko_normalize::<$f>(arr, &params)
                .map_err(to_py_err)?;
            Ok(result.image.into_pyarray(py))
        }

        #[pyfunction]
        #[pyo3(signature = (im_rgb, io=None))]
        fn [<py_rgb_to_od_ $suffix>]<'py>(
            py: Python<'py>,
            im_rgb: PyReadonlyArray3<'py, u8>,
            io: Option<f64>,
        ) -> PyResult<pyo3::Bound<'py, PyArray2<$f>>> {
            let arr = im_rgb.as_array();
            let result = color_conversion::rgb_to_od(arr, io.unwrap_or(240.0) as $f)
                .map_err(to_py_err)?;
            Ok(result.into_pyarray(py))
        }

        #[pyfunction]
        #[pyo3(signature = (im_od, height, width, io=None))]
        fn [<py_od_to_rgb_ $suffix>]<'py>(
            py: Python<'py>,
            im_od: PyReadonlyArray2<'py, $f>,
            height: usize,
            width: usize,
            io: Option<f64>,
        ) -> PyResult<pyo3::Bound<'py, PyArray3<u8>>> {
            let od = im_od.as_array().to_owned();
            let result = color_conversion::od_to_rgb(&od, io.unwrap_or(240.0) as $f, (height, width))
                .map_err(to_py_err)?;
            Ok(result.into_pyarray(py))
        }

        /// Returns `None` when no pixel passes `beta` or the estimate is degenerate.
        #[pyfunction]
        #[pyo3(signature = (im_rgb, io=None, alpha=None, beta=None))]
        fn [<py_rgb_separate_stains_macenko_pca_ $suffix>]<'py>(
            py: Python<'py>,
            im_rgb: PyReadonlyArray3<'py, u8>,
            io: Option<f64>,
            alpha: Option<f64>,
            beta: Option<f64>,
        ) -> PyResult<Option<pyo3::Bound<'py, PyArray2<$f>>>> {
            let result = rgb_separate_stains_macenko_pca(
                im_rgb.as_array(),
                io.unwrap_or(240.0) as $f,
                alpha.unwrap_or(1.0) as $f,
                beta.unwrap_or(0.15) as $f,
            )
            .map_err(to_py_err)?;
            Ok(match result {
                StainSeparation::Estimated(e) => Some(e.stain_matrix.into_pyarray(py)),
                _ => None,
            })
        }

        /// Returns `None` when no pixel passes `beta` or the estimate is degenerate.
        #[pyfunction]
        #[pyo3(signature = (im_od, alpha=None, beta=None))]
        fn [<py_separate_stains_macenko_pca_ $suffix>]<'py>(
            py: Python<'py>,
            im_od: PyReadonlyArray2<'py, $f>,
            alpha: Option<f64>,
            beta: Option<f64>,
        ) -> PyResult<Option<pyo3::Bound<'py, PyArray2<$f>>>> {
            let od = im_od.as_array().to_owned();
            if od.nrows() != 3 {
                return Err(pyo3::exceptions::PyValueError::new_err(
                    "im_od must be 3xN",
                ));
            }
            let result = separate_stains_macenko_pca::separate_stains_macenko_pca(
                &od,
                alpha.unwrap_or(1.0) as $f,
                beta.unwrap_or(0.15) as $f,
            );
            Ok(match result {
                StainSeparation::Estimated(e) => Some(e.stain_matrix.into_pyarray(py)),
                _ => None,
            })
        }

        #[pyfunction]
        #[pyo3(signature = (im_od, stain_matrix))]
        fn [<py_color_deconvolution_ $suffix>]<'py>(
            py: Python<'py>,
            im_od: PyReadonlyArray2<'py, $f>,
            stain_matrix: PyReadonlyArray2<'py, $f>,
        ) -> PyResult<pyo3::Bound<'py, PyArray2<$f>>> {
            let od = im_od.as_array().to_owned();
            let result = color_deconvolution::color_deconvolution(&od, stain_matrix.as_array())
                .map_err(to_py_err)?;
            Ok(result.into_pyarray(py))
        }

        #[pyfunction]
        #[pyo3(signature = (concentrations, stain_matrix, io=None))]
        fn [<py_reconstruct_rgb_ $suffix>]<'py>(
            py: Python<'py>,
            concentrations: PyReadonlyArray2<'py, $f>,
            stain_matrix: PyReadonlyArray2<'py, $f>,
            io: Option<f64>,
        ) -> PyResult<pyo3::Bound<'py, PyArray2<$f>>> {
            let c = concentrations.as_array().to_owned();
            let result = color_deconvolution::reconstruct_rgb(
                &c,
                stain_matrix.as_array(),
                io.unwrap_or(240.0) as $f,
            )
            .map_err(to_py_err)?;
            Ok(result.into_pyarray(py))
        }

        } // paste!
    };
}

// Stamp out the concrete f32 and f64 variants.
define_typed_pyfunctions!(f32, f32);
define_typed_pyfunctions!(f64, f64);

// ---------------------------------------------------------------------------
// PyO3 module: register every typed variant.
// ---------------------------------------------------------------------------
#[pymodule]
fn _rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // f64
    m.add_function(wrap_pyfunction!(py_macenko_normalize_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_rgb_to_od_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_od_to_rgb_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_rgb_separate_stains_macenko_pca_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_separate_stains_macenko_pca_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_color_deconvolution_f64, m)?)?;
    m.add_function(wrap_pyfunction!(py_reconstruct_rgb_f64, m)?)?;
    // f32
    m.add_function(wrap_pyfunction!(py_macenko_normalize_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_rgb_to_od_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_od_to_rgb_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_rgb_separate_stains_macenko_pca_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_separate_stains_macenko_pca_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_color_deconvolution_f32, m)?)?;
    m.add_function(wrap_pyfunction!(py_reconstruct_rgb_f32, m)?)?;
    Ok(())
}
