//! Intensity transforms for normalized `f32` images.

use super::spatial::check_probability;
use super::{get_rng, stream, VolumeTransform};
use crate::error::{Error, Result};
use crate::seed::derive_seed;
use ndarray::Array5;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

const NOISE_CHUNK_SIZE: usize = 8192;

fn check_range(name: &str, range: f32) -> Result<()> {
    if range.is_finite() && range >= 0.0 {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{} must be finite and non-negative, got {}",
            name, range
        )))
    }
}

/// Multiply intensities by a factor drawn from `[1 - range, 1 + range]`.
#[derive(Debug, Clone, Copy)]
pub struct RandScaleIntensity {
    range: f32,
}

impl RandScaleIntensity {
    pub fn new(range: f32) -> Result<Self> {
        check_range("scale range", range)?;
        Ok(Self { range })
    }

    pub fn sample_factor(&self, seed: u64) -> f32 {
        let mut rng = get_rng(derive_seed(seed, stream::SCALE));
        1.0 + rng.gen_range(-self.range..=self.range)
    }
}

impl VolumeTransform<f32> for RandScaleIntensity {
    fn apply(&self, mut volume: Array5<f32>, seed: u64) -> Result<Array5<f32>> {
        let factor = self.sample_factor(seed);
        volume.par_mapv_inplace(|v| v * factor);
        Ok(volume)
    }
}

/// Add an offset drawn from `[-range, range]`.
#[derive(Debug, Clone, Copy)]
pub struct RandShiftIntensity {
    range: f32,
}

impl RandShiftIntensity {
    pub fn new(range: f32) -> Result<Self> {
        check_range("shift range", range)?;
        Ok(Self { range })
    }

    pub fn sample_offset(&self, seed: u64) -> f32 {
        let mut rng = get_rng(derive_seed(seed, stream::SHIFT));
        rng.gen_range(-self.range..=self.range)
    }
}

impl VolumeTransform<f32> for RandShiftIntensity {
    fn apply(&self, mut volume: Array5<f32>, seed: u64) -> Result<Array5<f32>> {
        let offset = self.sample_offset(seed);
        volume.par_mapv_inplace(|v| v + offset);
        Ok(volume)
    }
}

/// Additive zero-mean Gaussian noise, applied with probability `prob`.
#[derive(Debug, Clone, Copy)]
pub struct RandGaussianNoise {
    std: f32,
    prob: f32,
}

impl RandGaussianNoise {
    pub fn new(std: f32, prob: f32) -> Result<Self> {
        check_range("noise std", std)?;
        check_probability(prob)?;
        Ok(Self { std, prob })
    }
}

impl VolumeTransform<f32> for RandGaussianNoise {
    fn apply(&self, volume: Array5<f32>, seed: u64) -> Result<Array5<f32>> {
        let seed = derive_seed(seed, stream::NOISE);
        let mut rng = get_rng(seed);
        if self.std == 0.0 || rng.gen::<f32>() >= self.prob {
            return Ok(volume);
        }
        gaussian_noise(volume, self.std, rng.gen())
    }
}

/// Add `N(0, std^2)` noise to every voxel.
///
/// Large volumes are processed in parallel chunks, each with its own
/// generator seeded from `seed` and the chunk index, so the result does not
/// depend on the number of threads.
pub fn gaussian_noise(volume: Array5<f32>, std: f32, seed: u64) -> Result<Array5<f32>> {
    let mut volume = if volume.is_standard_layout() {
        volume
    } else {
        volume.as_standard_layout().into_owned()
    };
    let data = volume.as_slice_mut().ok_or_else(|| {
        Error::InvalidDimensions("array must be contiguous for noise operation".to_string())
    })?;

    data.par_chunks_mut(NOISE_CHUNK_SIZE)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(chunk_idx as u64));
            for v in chunk.iter_mut() {
                *v += box_muller(&mut rng) * std;
            }
        });
    Ok(volume)
}

fn box_muller<R: Rng>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen::<f32>().max(1e-10);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Gamma correction with `gamma` drawn from a range.
///
/// The image is rescaled to `[0, 1]` before the power and back afterwards,
/// so z-scored inputs with negative values are handled.
#[derive(Debug, Clone, Copy)]
pub struct RandGamma {
    min: f32,
    max: f32,
}

impl RandGamma {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
            return Err(Error::Configuration(format!(
                "gamma range must satisfy 0 < min <= max, got ({}, {})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn sample_gamma(&self, seed: u64) -> f32 {
        let mut rng = get_rng(derive_seed(seed, stream::GAMMA));
        rng.gen_range(self.min..=self.max)
    }
}

impl VolumeTransform<f32> for RandGamma {
    fn apply(&self, mut volume: Array5<f32>, seed: u64) -> Result<Array5<f32>> {
        let gamma = self.sample_gamma(seed);
        let (lo, hi) = volume
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = hi - lo;
        if range.is_nan() || range <= 0.0 {
            return Ok(volume);
        }
        volume.par_mapv_inplace(|v| ((v - lo) / range).max(0.0).powf(gamma) * range + lo);
        Ok(volume)
    }
}
