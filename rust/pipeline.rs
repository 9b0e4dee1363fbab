//! Batch driver: normalize every tile of every configured dataset.
//!
//! Tiles are independent, so they are processed in parallel with no ordering.
//! A tile that cannot be read, normalized or written is counted as failed and
//! the run continues.

use crate::config::{DatasetConfig, PipelineConfig, ProcessingConfig};
use crate::error::{NormalizeError, Result};
use crate::image_io::normalize_image_file;
use crate::macenko_normalize::{MacenkoParams, StainNormalizer};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "tif", "tiff"];

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively find all images under `dir`, sorted. A missing directory
/// yields an empty list.
pub fn find_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            NormalizeError::IoError(std::io::Error::other(format!(
                "walking {}: {e}",
                dir.display()
            )))
        })?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();
    Ok(images)
}

/// Where the normalized version of `image` goes.
pub fn output_path_for(
    image: &Path,
    input_dir: &Path,
    output_dir: &Path,
    preserve_structure: bool,
) -> PathBuf {
    match image.strip_prefix(input_dir) {
        Ok(rel) if preserve_structure => output_dir.join(rel),
        _ => output_dir.join(image.file_name().unwrap_or(image.as_os_str())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub name: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// Successes that passed through unchanged (no tissue or degenerate).
    pub fallback: usize,
}

impl DatasetStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.success as f64 / self.total as f64
        }
    }
}

enum TileResult {
    Normalized,
    Fallback,
    Skipped,
    Failed,
}

pub fn process_dataset(
    dataset: &DatasetConfig,
    processing: &ProcessingConfig,
    normalizer: &StainNormalizer,
) -> Result<DatasetStats> {
    info!("Processing {}", dataset.name);
    let images = find_images(&dataset.input_dir)?;
    info!("Found {} images", images.len());

    let mut stats = DatasetStats {
        name: dataset.name.clone(),
        total: images.len(),
        ..Default::default()
    };
    if images.is_empty() {
        warn!("No images found in {}", dataset.input_dir.display());
        return Ok(stats);
    }

    let done = AtomicUsize::new(0);
    let started = Instant::now();
    let results: Vec<TileResult> = images
        .par_iter()
        .map(|img| {
            let out = output_path_for(
                img,
                &dataset.input_dir,
                &dataset.output_dir,
                processing.preserve_structure,
            );
            let result = if processing.skip_existing && out.exists() {
                TileResult::Skipped
            } else {
                match normalize_image_file(img, &out, normalizer) {
                    Ok(outcome) if outcome.is_fallback() => TileResult::Fallback,
                    Ok(_) => TileResult::Normalized,
                    Err(e) => {
                        warn!("Error processing {}: {}", img.display(), e);
                        TileResult::Failed
                    }
                }
            };

            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if processing.log_every > 0 && n % processing.log_every == 0 {
                info!("{}: {}/{} images", dataset.name, n, images.len());
            }
            result
        })
        .collect();

    for r in results {
        match r {
            TileResult::Normalized | TileResult::Skipped => stats.success += 1,
            TileResult::Fallback => {
                stats.success += 1;
                stats.fallback += 1;
            }
            TileResult::Failed => stats.failed += 1,
        }
    }

    info!(
        "{} results: total {}, success {}, failed {}, unchanged {} in {:.1}s",
        stats.name,
        stats.total,
        stats.success,
        stats.failed,
        stats.fallback,
        started.elapsed().as_secs_f64()
    );
    Ok(stats)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub datasets: Vec<DatasetStats>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.datasets.iter().map(|d| d.total).sum()
    }

    pub fn success(&self) -> usize {
        self.datasets.iter().map(|d| d.success).sum()
    }

    pub fn failed(&self) -> usize {
        self.datasets.iter().map(|d| d.failed).sum()
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            100.0 * self.success() as f64 / total as f64
        }
    }
}

/// Normalize every configured dataset and append a summary to the run log.
pub fn run_pipeline(config: &PipelineConfig) -> Result<RunSummary> {
    config.validate()?;
    let normalizer = StainNormalizer::new(config.macenko.clone())?;
    let p = normalizer.params();
    info!(
        "Macenko normalization: Io={}, alpha={}, beta={}",
        p.io, p.alpha, p.beta
    );

    let run = || -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for dataset in &config.datasets {
            summary
                .datasets
                .push(process_dataset(dataset, &config.processing, &normalizer)?);
        }
        Ok(summary)
    };

    let summary = match config.processing.threads {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| NormalizeError::ConfigError(format!("thread pool: {e}")))?
            .install(run)?,
        None => run()?,
    };

    info!(
        "Total {}: success {}, failed {} ({:.2}%)",
        summary.total(),
        summary.success(),
        summary.failed(),
        summary.success_rate()
    );
    append_run_log(&config.log_path, &config.macenko, &summary)?;
    Ok(summary)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `YYYY-MM-DD HH:MM:SS` (UTC) for a unix timestamp.
pub fn format_timestamp(unix: u64) -> String {
    let days = (unix / 86_400) as i64;
    let secs = unix % 86_400;

    // Days since 1970-01-01 to a proleptic Gregorian date, in 400-year eras
    // starting on March 1st.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
        secs / 3_600,
        secs % 3_600 / 60,
        secs % 60
    )
}

/// Render the human-readable block appended to the run log.
pub fn format_run_log(params: &MacenkoParams, summary: &RunSummary) -> String {
    let mut out = format!(
        "\n[{} UTC] Pipeline execution\nMethod: Macenko normalization (Io={}, alpha={}, beta={})\n",
        format_timestamp(unix_seconds()),
        params.io,
        params.alpha,
        params.beta
    );
    for d in &summary.datasets {
        out.push_str(&format!(
            "  {}: {}/{} images normalized ({} failed, {} unchanged)\n",
            d.name, d.success, d.total, d.failed, d.fallback
        ));
    }
    out.push_str(&format!(
        "Total: {}/{} images (Success rate: {:.2}%)\n",
        summary.success(),
        summary.total(),
        summary.success_rate()
    ));
    out
}

pub fn append_run_log(path: &Path, params: &MacenkoParams, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format_run_log(params, summary).as_bytes())?;
    info!("Log saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_io::{read_rgb, write_rgb};
    use ndarray::Array3;

    #[test]
    fn timestamps_are_calendar_dates() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(951_782_400), "2000-02-29 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14 22:13:20");
        assert_eq!(format_timestamp(4_107_542_399), "2100-02-28 23:59:59");
    }

    #[test]
    fn run_log_has_readable_header() {
        let summary = RunSummary {
            datasets: vec![DatasetStats {
                name: "LC25000".into(),
                total: 4,
                success: 3,
                failed: 1,
                fallback: 0,
            }],
        };
        let text = format_run_log(&MacenkoParams::default(), &summary);
        let header = text.lines().nth(1).unwrap();
        assert!(header.starts_with('[') && header.contains(" UTC] Pipeline execution"));
        assert_eq!(header.as_bytes()[5], b'-');
        assert!(text.contains("LC25000: 3/4 images normalized (1 failed, 0 unchanged)"));
        assert!(text.contains("Success rate: 75.00%"));
    }

    fn tile() -> Array3<u8> {
        Array3::from_shape_fn((8, 8, 3), |(y, x, c)| {
            let stained = (x + y) % 2 == 0;
            match (stained, c) {
                (false, _) => 250,
                (true, 0) => 140 + (x * 3) as u8,
                (true, 1) => 60 + (y * 5) as u8,
                (true, _) => 160 + (x * 2) as u8,
            }
        })
    }

    #[test]
    fn extensions_are_case_insensitive() {
        assert!(has_image_extension(Path::new("a/b.TIF")));
        assert!(has_image_extension(Path::new("a/b.jpeg")));
        assert!(!has_image_extension(Path::new("a/b.txt")));
        assert!(!has_image_extension(Path::new("a/b")));
    }

    #[test]
    fn output_paths_preserve_or_flatten() {
        let img = Path::new("/in/class_a/x.png");
        assert_eq!(
            output_path_for(img, Path::new("/in"), Path::new("/out"), true),
            PathBuf::from("/out/class_a/x.png")
        );
        assert_eq!(
            output_path_for(img, Path::new("/in"), Path::new("/out"), false),
            PathBuf::from("/out/x.png")
        );
    }

    #[test]
    fn missing_input_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_images(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn dataset_run_counts_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write_rgb(&input.join("a/tissue.png"), tile().view()).unwrap();
        write_rgb(
            &input.join("b/white.png"),
            Array3::<u8>::from_elem((8, 8, 3), 250).view(),
        )
        .unwrap();
        fs::write(input.join("b/broken.png"), b"not a png").unwrap();
        fs::write(input.join("notes.txt"), b"ignored").unwrap();

        let dataset = DatasetConfig {
            name: "synthetic".into(),
            input_dir: input.clone(),
            output_dir: output.clone(),
            format: None,
        };
        let stats = process_dataset(
            &dataset,
            &ProcessingConfig::default(),
            &StainNormalizer::default(),
        )
        .unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.fallback, 1);
        assert!(output.join("a/tissue.png").exists());
        assert_eq!(
            read_rgb(&output.join("b/white.png")).unwrap(),
            Array3::<u8>::from_elem((8, 8, 3), 250)
        );
    }

    #[test]
    fn skip_existing_counts_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write_rgb(&input.join("t.png"), tile().view()).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("t.png"), b"stale").unwrap();

        let dataset = DatasetConfig {
            name: "s".into(),
            input_dir: input,
            output_dir: output.clone(),
            format: None,
        };
        let processing = ProcessingConfig {
            skip_existing: true,
            ..Default::default()
        };
        let stats = process_dataset(&dataset, &processing, &StainNormalizer::default()).unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(fs::read(output.join("t.png")).unwrap(), b"stale");
    }

    #[test]
    fn run_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/pipeline.log");
        let summary = RunSummary {
            datasets: vec![DatasetStats {
                name: "d".into(),
                total: 4,
                success: 3,
                failed: 1,
                fallback: 0,
            }],
        };
        let params = MacenkoParams::default();
        append_run_log(&log, &params, &summary).unwrap();
        append_run_log(&log, &params, &summary).unwrap();

        let text = fs::read_to_string(&log).unwrap();
        assert_eq!(text.matches("Pipeline execution").count(), 2);
        assert!(text.contains("d: 3/4 images normalized"));
        assert!(text.contains("Success rate: 75.00%"));
    }
}
