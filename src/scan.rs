//! Per-sequence scan loading with instance-wise intensity normalization.
//!
//! Every scan is returned as a 5-D array `[1, 1, z, y, x]` so sequences can
//! be concatenated along the channel axis and batches along the first.

use crate::error::{Error, Result};
use crate::volume::{read_volume, Volume};
use ndarray::{Array, Array3, Array5, Axis, Dimension};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

/// Default upper percentile for intensity clipping.
pub const DEFAULT_PERCENTILE: f32 = 99.5;

/// A normalized scan and the metadata tags found in its file.
#[derive(Debug, Clone)]
pub struct Scan {
    /// Normalized voxels, `[1, 1, z, y, x]`.
    pub image: Array5<f32>,
    /// Key/value metadata embedded in the file.
    pub tags: BTreeMap<String, String>,
}

/// Reads volumes from disk and applies percentile-clipped z-score
/// normalization.
#[derive(Debug, Clone, Copy)]
pub struct ScanLoader {
    percentile: Option<f32>,
}

impl Default for ScanLoader {
    fn default() -> Self {
        Self {
            percentile: Some(DEFAULT_PERCENTILE),
        }
    }
}

impl ScanLoader {
    /// Create a loader. `percentile` must lie in `[50, 100]`; `None` disables
    /// clipping.
    pub fn new(percentile: Option<f32>) -> Result<Self> {
        if let Some(p) = percentile {
            if !(50.0..=100.0).contains(&p) {
                return Err(Error::Configuration(format!(
                    "normalization percentile must be within [50, 100], got {}",
                    p
                )));
            }
        }
        Ok(Self { percentile })
    }

    /// Clipping percentile in use.
    pub fn percentile(&self) -> Option<f32> {
        self.percentile
    }

    /// Load and normalize one sequence, `[1, 1, z, y, x]`.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Array5<f32>> {
        Ok(self.load_scan(path)?.image)
    }

    /// Load and normalize one sequence, keeping its embedded tags.
    pub fn load_scan<P: AsRef<Path>>(&self, path: P) -> Result<Scan> {
        let volume = read_volume(path)?;
        let tags = volume.tags().clone();
        let image = z_score_norm(expand_dims(volume.into_data()), self.percentile);
        Ok(Scan { image, tags })
    }

    /// Load a segmentation mask as `i8`, `[1, 1, z, y, x]`. No normalization.
    pub fn load_mask<P: AsRef<Path>>(&self, path: P) -> Result<Array5<i8>> {
        let volume: Volume = read_volume(path)?;
        Ok(expand_dims(volume.into_data().mapv(|v| v as i8)))
    }
}

/// Add leading batch and channel axes: `[z, y, x]` → `[1, 1, z, y, x]`.
pub fn expand_dims<T>(volume: Array3<T>) -> Array5<T> {
    volume.insert_axis(Axis(0)).insert_axis(Axis(0))
}

/// Z-score normalize an image, optionally clipping intensities to the
/// `[100 - percentile, percentile]` percentile range first.
///
/// Mean and standard deviation are taken over the (clipped) image. A constant
/// image normalizes to all zeros.
///
/// NaN voxels do not take part in the percentile estimate, and clipping maps
/// them to the lower bound, so a clipped image is always finite. Without
/// clipping, a NaN voxel leaves the statistics undefined and the image
/// normalizes to all zeros, as a constant image does.
pub fn z_score_norm<D: Dimension>(mut image: Array<f32, D>, percentile: Option<f32>) -> Array<f32, D> {
    if image.is_empty() {
        return image;
    }

    if let Some(p) = percentile {
        let mut sorted: Vec<f32> = image.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.par_sort_unstable_by(f32::total_cmp);
        let lower = percentile_of_sorted(&sorted, 100.0 - f64::from(p)) as f32;
        let upper = percentile_of_sorted(&sorted, f64::from(p)) as f32;
        image.par_mapv_inplace(|v| v.max(lower).min(upper));
    }

    let (mean, std) = mean_std(&image);
    if std > 0.0 {
        image.par_mapv_inplace(|v| ((f64::from(v) - mean) / std) as f32);
    } else {
        image.fill(0.0);
    }
    image
}

/// Percentile `q` (0-100) of already sorted values, linearly interpolating
/// between the two nearest ranks.
pub fn percentile_of_sorted(sorted: &[f32], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => f64::from(sorted[0]),
        n => {
            let rank = (q / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let a = f64::from(sorted[lo]);
            let b = f64::from(sorted[hi]);
            a + (b - a) * (rank - lo as f64)
        }
    }
}

/// Population mean and standard deviation.
fn mean_std<D: Dimension>(image: &Array<f32, D>) -> (f64, f64) {
    let n = image.len() as f64;
    let mean = image.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = image
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{metaimage, DataType};
    use ndarray::{Array1, Array3};
    use tempfile::tempdir;

    #[test]
    fn test_percentile_interpolates() {
        let sorted: Vec<f32> = (0..=10).map(|v| v as f32).collect();
        assert_eq!(percentile_of_sorted(&sorted, 50.0), 5.0);
        assert!((percentile_of_sorted(&sorted, 99.5) - 9.95).abs() < 1e-9);
        assert!((percentile_of_sorted(&sorted, 0.5) - 0.05).abs() < 1e-9);
        assert_eq!(percentile_of_sorted(&[3.0], 99.5), 3.0);
    }

    #[test]
    fn test_z_score_without_clipping() {
        let image = Array1::from(vec![1.0f32, 2.0, 3.0, 4.0]);
        let out = z_score_norm(image, None);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
        assert!(out[0] < out[3]);
    }

    #[test]
    fn test_clipping_suppresses_outlier() {
        let mut values: Vec<f32> = (0..1000).map(|i| (i % 10) as f32).collect();
        values[0] = 10_000.0;
        let clipped = z_score_norm(Array1::from(values.clone()), Some(99.5));
        let unclipped = z_score_norm(Array1::from(values), None);
        // The bright voxel no longer dominates the scale.
        assert!(clipped[0] < 3.0);
        assert!(unclipped[0] > 20.0);
    }

    #[test]
    fn test_nan_voxels_clip_to_lower_bound() {
        let mut values: Vec<f32> = (0..200).map(|i| i as f32).collect();
        values[17] = f32::NAN;
        let out = z_score_norm(Array1::from(values), Some(99.5));
        assert!(out.iter().all(|v| v.is_finite()));
        let lowest = out.iter().copied().fold(f32::INFINITY, f32::min);
        assert_eq!(out[17], lowest);
        assert_eq!(out[17], out[0]);

        let unclipped = z_score_norm(Array1::from(vec![1.0f32, f32::NAN, 3.0]), None);
        assert!(unclipped.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_constant_image_becomes_zero() {
        let out = z_score_norm(Array3::from_elem((2, 2, 2), 7.0f32), Some(99.5));
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_loader_shapes() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("t2w.mha");
        let mask_path = dir.path().join("lesion.mha");

        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z + y + x) as f32);
        let volume = Volume::new(data.clone()).with_tag("PSA_REPORT", "4.2");
        metaimage::save(&volume, &image_path, DataType::Int16, false).unwrap();
        let mask = Volume::new(data.mapv(|v| if v > 3.0 { 1.0 } else { 0.0 }));
        metaimage::save(&mask, &mask_path, DataType::UInt8, false).unwrap();

        let loader = ScanLoader::default();
        let scan = loader.load_scan(&image_path).unwrap();
        assert_eq!(scan.image.shape(), &[1, 1, 2, 3, 4]);
        assert_eq!(scan.tags["PSA_REPORT"], "4.2");

        let seg = loader.load_mask(&mask_path).unwrap();
        assert_eq!(seg.shape(), &[1, 1, 2, 3, 4]);
        assert_eq!(seg[[0, 0, 1, 2, 3]], 1);
        assert_eq!(seg[[0, 0, 0, 0, 0]], 0);
    }

    #[test]
    fn test_invalid_percentile() {
        assert!(ScanLoader::new(Some(20.0)).is_err());
        assert!(ScanLoader::new(Some(100.5)).is_err());
        assert!(ScanLoader::new(None).is_ok());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = ScanLoader::default().load("/no/such/t2w.nii.gz").unwrap_err();
        assert!(err.to_string().contains("/no/such/t2w.nii.gz"));
    }
}
