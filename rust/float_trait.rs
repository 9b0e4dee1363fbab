use nalgebra::RealField;
use num_traits::Float;
use std::ops::AddAssign;

/// Supertrait combining all bounds needed by the generic Macenko pipeline.
///
/// Implemented for `f32` and `f64` only. `Float` drives the elementwise work
/// on `ndarray` buffers and `RealField` the small dense solves in `nalgebra`.
///
/// Both traits expose methods with the same names (`sqrt`, `max`, `is_finite`,
/// ...), so call sites spell them out as `Float::sqrt(x)`.
pub trait MacenkoFloat:
    Float + RealField + Copy + AddAssign + Send + Sync + 'static
{
    /// Lossy conversion from an `f64` literal.
    fn lit(v: f64) -> Self;

    /// Widen to `f64` for reporting.
    fn to_f64_lossy(self) -> f64;
}

impl MacenkoFloat for f32 {
    #[inline]
    fn lit(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64_lossy(self) -> f64 {
        self as f64
    }
}

impl MacenkoFloat for f64 {
    #[inline]
    fn lit(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64_lossy(self) -> f64 {
        self
    }
}
