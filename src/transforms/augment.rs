//! Training-time augmentation of image/mask pairs.
//!
//! Spatial stages (flip, rot90) are drawn once and applied to both the image
//! and its mask; intensity stages touch the image only.

use super::intensity::{RandGamma, RandGaussianNoise, RandScaleIntensity, RandShiftIntensity};
use super::spatial::{flip, rotate_90, RandFlip, RandRotate90, SPATIAL_AXES};
use super::{get_rng, VolumeTransform};
use crate::dataset::Sample;
use crate::error::Result;
use ndarray::Array5;
use rand::Rng;

/// Builder-style augmentation pipeline.
///
/// ```ignore
/// let pipeline = AugmentPipeline::new()
///     .flip_axes(&[4])
///     .scale_range(0.1)
///     .noise_std(0.02)
///     .no_shift();
/// let sample = pipeline.apply(sample)?;
/// ```
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct AugmentPipeline {
    flip_axes: Vec<usize>,
    flip_prob: f32,
    rotate_plane: Option<(usize, usize)>,
    rotate_prob: f32,
    scale_range: f32,
    shift_range: f32,
    noise_std: f32,
    noise_prob: f32,
    gamma_range: Option<(f32, f32)>,
    enable_flip: bool,
    enable_scale: bool,
    enable_shift: bool,
    enable_noise: bool,
}

impl Default for AugmentPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AugmentPipeline {
    /// Flips on all spatial axes, +-10% scale, +-0.1 shift, noise with
    /// std 0.05. Rotation and gamma are off.
    pub fn new() -> Self {
        Self {
            flip_axes: SPATIAL_AXES.to_vec(),
            flip_prob: 0.5,
            rotate_plane: None,
            rotate_prob: 0.5,
            scale_range: 0.1,
            shift_range: 0.1,
            noise_std: 0.05,
            noise_prob: 1.0,
            gamma_range: None,
            enable_flip: true,
            enable_scale: true,
            enable_shift: true,
            enable_noise: true,
        }
    }

    /// Set axes for random flipping.
    pub fn flip_axes(mut self, axes: &[usize]) -> Self {
        self.flip_axes = axes.to_vec();
        self
    }

    /// Set flip probability per axis.
    pub fn flip_prob(mut self, prob: f32) -> Self {
        self.flip_prob = prob;
        self
    }

    /// Enable quarter-turn rotations in `plane` with probability `prob`.
    pub fn rotate_90(mut self, plane: (usize, usize), prob: f32) -> Self {
        self.rotate_plane = Some(plane);
        self.rotate_prob = prob;
        self
    }

    /// Set intensity scale range (+- this value).
    pub fn scale_range(mut self, range: f32) -> Self {
        self.scale_range = range;
        self
    }

    /// Set intensity shift range (+- this value).
    pub fn shift_range(mut self, range: f32) -> Self {
        self.shift_range = range;
        self
    }

    /// Set Gaussian noise standard deviation.
    pub fn noise_std(mut self, std: f32) -> Self {
        self.noise_std = std;
        self
    }

    /// Set the probability of adding noise at all.
    pub fn noise_prob(mut self, prob: f32) -> Self {
        self.noise_prob = prob;
        self
    }

    /// Enable gamma correction with specified range.
    pub fn gamma(mut self, min: f32, max: f32) -> Self {
        self.gamma_range = Some((min, max));
        self
    }

    pub fn no_flip(mut self) -> Self {
        self.enable_flip = false;
        self
    }

    pub fn no_scale(mut self) -> Self {
        self.enable_scale = false;
        self
    }

    pub fn no_shift(mut self) -> Self {
        self.enable_shift = false;
        self
    }

    pub fn no_noise(mut self) -> Self {
        self.enable_noise = false;
        self
    }

    /// Augment a sample, drawing all randomness from its seed.
    pub fn apply(&self, sample: Sample) -> Result<Sample> {
        let Sample {
            image,
            metadata,
            segmentation,
            label,
            seed,
        } = sample;
        let (image, segmentation) = self.apply_pair(image, segmentation, seed)?;
        Ok(Sample {
            image,
            metadata,
            segmentation,
            label,
            seed,
        })
    }

    /// Augment an image and its optional mask with one seed.
    pub fn apply_pair(
        &self,
        mut image: Array5<f32>,
        mut mask: Option<Array5<i8>>,
        seed: u64,
    ) -> Result<(Array5<f32>, Option<Array5<i8>>)> {
        let mut rng = get_rng(seed);

        if self.enable_flip && !self.flip_axes.is_empty() {
            let flip_seed: u64 = rng.gen();
            let axes = RandFlip::new(&self.flip_axes, self.flip_prob)?.sample_axes(flip_seed);
            image = flip(image, &axes)?;
            mask = mask.map(|m| flip(m, &axes)).transpose()?;
        }

        if let Some(plane) = self.rotate_plane {
            let rotate_seed: u64 = rng.gen();
            let turns = RandRotate90::new(plane, self.rotate_prob)?.sample_turns(rotate_seed);
            image = rotate_90(image, plane, turns)?;
            mask = mask.map(|m| rotate_90(m, plane, turns)).transpose()?;
        }

        if self.enable_scale && self.scale_range > 0.0 {
            let scale_seed: u64 = rng.gen();
            image = RandScaleIntensity::new(self.scale_range)?.apply(image, scale_seed)?;
        }

        if self.enable_shift && self.shift_range > 0.0 {
            let shift_seed: u64 = rng.gen();
            image = RandShiftIntensity::new(self.shift_range)?.apply(image, shift_seed)?;
        }

        if self.enable_noise && self.noise_std > 0.0 {
            let noise_seed: u64 = rng.gen();
            image = RandGaussianNoise::new(self.noise_std, self.noise_prob)?.apply(image, noise_seed)?;
        }

        if let Some((min, max)) = self.gamma_range {
            let gamma_seed: u64 = rng.gen();
            image = RandGamma::new(min, max)?.apply(image, gamma_seed)?;
        }

        Ok((image, mask))
    }
}
