//! Full-reference quality metrics between an original and a normalized tile.
//!
//! PSNR and RMSE use all samples; SSIM follows the usual 7×7 uniform-window
//! formulation (K1 = 0.01, K2 = 0.03, sample covariance) averaged over the
//! window positions that fit inside the image, then over channels.

use crate::error::{NormalizeError, Result};
use crate::image_io::read_rgb;
use crate::pipeline::find_images;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// PSNR reported for identical images, where the true value is infinite.
pub const PSNR_CAP_DB: f64 = 60.0;

const DATA_RANGE: f64 = 255.0;
const SSIM_WIN: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    #[default]
    Rgb,
    Gray,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageMetrics {
    pub psnr: f64,
    pub ssim: f64,
    pub rmse: f64,
}

fn check_same_shape(a: &ArrayView3<u8>, b: &ArrayView3<u8>) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(NormalizeError::invalid(
            "images",
            format!("shape mismatch {:?} vs {:?}", a.dim(), b.dim()),
        ));
    }
    if a.is_empty() {
        let (h, w, _) = a.dim();
        return Err(NormalizeError::EmptyImage(h, w));
    }
    Ok(())
}

fn mse(a: &ArrayView3<u8>, b: &ArrayView3<u8>) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    sum / a.len() as f64
}

pub fn rmse(a: ArrayView3<u8>, b: ArrayView3<u8>) -> Result<f64> {
    check_same_shape(&a, &b)?;
    Ok(mse(&a, &b).sqrt())
}

/// Peak signal-to-noise ratio in dB, capped at [`PSNR_CAP_DB`] for
/// identical inputs.
pub fn psnr(a: ArrayView3<u8>, b: ArrayView3<u8>) -> Result<f64> {
    check_same_shape(&a, &b)?;
    let mse = mse(&a, &b);
    if mse == 0.0 {
        return Ok(PSNR_CAP_DB);
    }
    Ok(10.0 * (DATA_RANGE * DATA_RANGE / mse).log10())
}

/// Mean structural similarity over all channels.
///
/// Both sides must be at least 7×7.
pub fn ssim(a: ArrayView3<u8>, b: ArrayView3<u8>) -> Result<f64> {
    check_same_shape(&a, &b)?;
    let (h, w, c) = a.dim();
    if h < SSIM_WIN || w < SSIM_WIN {
        return Err(NormalizeError::invalid(
            "images",
            format!("SSIM needs at least {SSIM_WIN}x{SSIM_WIN} pixels, got {w}x{h}"),
        ));
    }

    let per_channel: Vec<f64> = (0..c)
        .into_par_iter()
        .map(|ch| ssim_channel(a.index_axis(Axis(2), ch), b.index_axis(Axis(2), ch)))
        .collect();
    Ok(per_channel.iter().sum::<f64>() / c as f64)
}

/// Summed-area table with a zero first row and column.
fn integral<G: Fn(usize, usize) -> f64>(h: usize, w: usize, f: G) -> Array2<f64> {
    let mut s = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row = 0.0;
        for x in 0..w {
            row += f(y, x);
            s[[y + 1, x + 1]] = s[[y, x + 1]] + row;
        }
    }
    s
}

fn window_sum(s: &Array2<f64>, y: usize, x: usize, n: usize) -> f64 {
    s[[y + n, x + n]] - s[[y, x + n]] - s[[y + n, x]] + s[[y, x]]
}

fn ssim_channel(a: ArrayView2<u8>, b: ArrayView2<u8>) -> f64 {
    let (h, w) = a.dim();
    let px = |v: u8| v as f64;
    let sa = integral(h, w, |y, x| px(a[[y, x]]));
    let sb = integral(h, w, |y, x| px(b[[y, x]]));
    let saa = integral(h, w, |y, x| px(a[[y, x]]) * px(a[[y, x]]));
    let sbb = integral(h, w, |y, x| px(b[[y, x]]) * px(b[[y, x]]));
    let sab = integral(h, w, |y, x| px(a[[y, x]]) * px(b[[y, x]]));

    let np = (SSIM_WIN * SSIM_WIN) as f64;
    let cov_norm = np / (np - 1.0);
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in 0..=h - SSIM_WIN {
        for x in 0..=w - SSIM_WIN {
            let ux = window_sum(&sa, y, x, SSIM_WIN) / np;
            let uy = window_sum(&sb, y, x, SSIM_WIN) / np;
            let uxx = window_sum(&saa, y, x, SSIM_WIN) / np;
            let uyy = window_sum(&sbb, y, x, SSIM_WIN) / np;
            let uxy = window_sum(&sab, y, x, SSIM_WIN) / np;

            let vx = cov_norm * (uxx - ux * ux);
            let vy = cov_norm * (uyy - uy * uy);
            let vxy = cov_norm * (uxy - ux * uy);

            let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }
    total / count as f64
}

/// ITU-R BT.601 luma, rounded, as a single-channel (H, W, 1) image.
pub fn to_gray(im: ArrayView3<u8>) -> Array3<u8> {
    let (h, w, _) = im.dim();
    Array3::from_shape_fn((h, w, 1), |(y, x, _)| {
        let l = 0.299 * im[[y, x, 0]] as f64
            + 0.587 * im[[y, x, 1]] as f64
            + 0.114 * im[[y, x, 2]] as f64;
        l.round().clamp(0.0, 255.0) as u8
    })
}

pub fn compute_metrics(
    original: ArrayView3<u8>,
    normalized: ArrayView3<u8>,
    mode: ChannelMode,
) -> Result<ImageMetrics> {
    let (a, b) = match mode {
        ChannelMode::Rgb => (original.to_owned(), normalized.to_owned()),
        ChannelMode::Gray => (to_gray(original), to_gray(normalized)),
    };
    Ok(ImageMetrics {
        psnr: psnr(a.view(), b.view())?,
        ssim: ssim(a.view(), b.view())?,
        rmse: rmse(a.view(), b.view())?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub dataset: String,
    pub image: String,
    pub psnr_db: f64,
    pub ssim: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub dataset: String,
    pub n_images: usize,
    pub psnr_mean: f64,
    pub psnr_std: f64,
    pub ssim_mean: f64,
    pub ssim_std: f64,
    pub rmse_mean: f64,
    pub rmse_std: f64,
}

/// Mean and sample standard deviation; the deviation is NaN below two values.
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

impl MetricsSummary {
    pub fn from_records(dataset: &str, records: &[MetricRecord]) -> Self {
        let pick = |f: fn(&MetricRecord) -> f64| records.iter().map(f).collect::<Vec<_>>();
        let (psnr_mean, psnr_std) = mean_std(&pick(|r| r.psnr_db));
        let (ssim_mean, ssim_std) = mean_std(&pick(|r| r.ssim));
        let (rmse_mean, rmse_std) = mean_std(&pick(|r| r.rmse));
        Self {
            dataset: dataset.to_string(),
            n_images: records.len(),
            psnr_mean,
            psnr_std,
            ssim_mean,
            ssim_std,
            rmse_mean,
            rmse_std,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetMetrics {
    pub records: Vec<MetricRecord>,
    /// Normalized images with no original counterpart.
    pub skipped: usize,
    /// Pairs that could not be read or compared.
    pub failed: usize,
}

/// Find the original for a normalized file: same relative path first, then
/// the same file name at the top of `original_dir`.
fn find_original(original_dir: &Path, normalized_dir: &Path, norm_path: &Path) -> Option<PathBuf> {
    let by_relative = norm_path
        .strip_prefix(normalized_dir)
        .ok()
        .map(|rel| original_dir.join(rel));
    if let Some(p) = by_relative.filter(|p| p.exists()) {
        return Some(p);
    }
    let by_name = original_dir.join(norm_path.file_name()?);
    by_name.exists().then_some(by_name)
}

fn compare_pair(
    dataset: &str,
    orig_path: &Path,
    norm_path: &Path,
    mode: ChannelMode,
) -> Result<MetricRecord> {
    let orig = read_rgb(orig_path)?;
    let norm = read_rgb(norm_path)?;
    let m = compute_metrics(orig.view(), norm.view(), mode)?;
    Ok(MetricRecord {
        dataset: dataset.to_string(),
        image: norm_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        psnr_db: m.psnr,
        ssim: m.ssim,
        rmse: m.rmse,
    })
}

/// Compute metrics for every normalized image of a dataset against its original.
pub fn evaluate_dataset(
    dataset: &str,
    original_dir: &Path,
    normalized_dir: &Path,
    mode: ChannelMode,
) -> Result<DatasetMetrics> {
    let norm_images = find_images(normalized_dir)?;
    info!("Found {} normalized images for {}", norm_images.len(), dataset);

    let results: Vec<Option<Result<MetricRecord>>> = norm_images
        .par_iter()
        .map(|norm_path| {
            let orig_path = find_original(original_dir, normalized_dir, norm_path)?;
            Some(compare_pair(dataset, &orig_path, norm_path, mode))
        })
        .collect();

    let mut out = DatasetMetrics::default();
    for (r, path) in results.into_iter().zip(&norm_images) {
        match r {
            None => out.skipped += 1,
            Some(Ok(record)) => out.records.push(record),
            Some(Err(e)) => {
                warn!("Metrics failed for {}: {}", path.display(), e);
                out.failed += 1;
            }
        }
    }
    info!(
        "{}: {} compared, {} skipped (original not found), {} failed",
        dataset,
        out.records.len(),
        out.skipped,
        out.failed
    );
    Ok(out)
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn write_detailed_csv(path: &Path, records: &[MetricRecord]) -> Result<()> {
    let mut out = String::from("dataset,image,psnr_db,ssim,rmse\n");
    for r in records {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            csv_field(&r.dataset),
            csv_field(&r.image),
            r.psnr_db,
            r.ssim,
            r.rmse
        );
    }
    write_text(path, &out)
}

pub fn write_summary_csv(path: &Path, summaries: &[MetricsSummary]) -> Result<()> {
    let mut out = String::from(
        "dataset,method,n_images,psnr_mean,psnr_std,ssim_mean,ssim_std,rmse_mean,rmse_std\n",
    );
    for s in summaries {
        let _ = writeln!(
            out,
            "{},Macenko Normalization,{},{},{},{},{},{},{}",
            csv_field(&s.dataset),
            s.n_images,
            s.psnr_mean,
            s.psnr_std,
            s.ssim_mean,
            s.ssim_std,
            s.rmse_mean,
            s.rmse_std
        );
    }
    write_text(path, &out)
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, text)?;
    Ok(())
}
