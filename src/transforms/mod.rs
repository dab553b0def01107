//! Seeded volume transforms.
//!
//! Transforms operate on 5-D arrays `[batch, channel, z, y, x]` and take an
//! explicit seed instead of drawing from a global generator, so an image and
//! its mask can be given identical spatial randomness by passing them the
//! same seed.
//!
//! Each random transform derives its own stream from the seed (see
//! [`derive_seed`](crate::seed::derive_seed)), so the outcome of a flip does
//! not depend on which other transforms share its pipeline.

mod augment;
mod intensity;
mod spatial;

pub use augment::AugmentPipeline;
pub use intensity::{
    gaussian_noise, RandGamma, RandGaussianNoise, RandScaleIntensity, RandShiftIntensity,
};
pub use spatial::{
    center_pad_or_crop, flip, rotate_90, RandFlip, RandRotate90, ResizeWithPadOrCrop,
    SPATIAL_AXES,
};

use crate::error::Result;
use ndarray::Array5;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// A seeded transform of a 5-D volume.
pub trait VolumeTransform<T>: Send + Sync {
    /// Transform `volume` using randomness derived only from `seed`.
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>>;
}

impl<T, V: VolumeTransform<T> + ?Sized> VolumeTransform<T> for Box<V> {
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        (**self).apply(volume, seed)
    }
}

impl<T, V: VolumeTransform<T> + ?Sized> VolumeTransform<T> for std::sync::Arc<V> {
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        (**self).apply(volume, seed)
    }
}

/// Adapter turning a closure into a [`VolumeTransform`].
pub struct FnTransform<F>(F);

/// Wrap a closure as a transform.
pub fn from_fn<T, F>(f: F) -> FnTransform<F>
where
    F: Fn(Array5<T>, u64) -> Result<Array5<T>> + Send + Sync,
{
    FnTransform(f)
}

impl<T, F> VolumeTransform<T> for FnTransform<F>
where
    F: Fn(Array5<T>, u64) -> Result<Array5<T>> + Send + Sync,
{
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        (self.0)(volume, seed)
    }
}

impl<F> std::fmt::Debug for FnTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnTransform")
    }
}

/// Sequential composition. Every stage receives the same seed.
pub struct Compose<T> {
    stages: Vec<Box<dyn VolumeTransform<T>>>,
}

impl<T> Default for Compose<T> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T> Compose<T> {
    /// Empty pipeline (identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    #[must_use]
    pub fn then<V: VolumeTransform<T> + 'static>(mut self, stage: V) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when no stages were added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<T> VolumeTransform<T> for Compose<T> {
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        self.stages
            .iter()
            .try_fold(volume, |acc, stage| stage.apply(acc, seed))
    }
}

impl<T> std::fmt::Debug for Compose<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compose")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Stream identifiers mixed into the seed by each random transform.
pub(crate) mod stream {
    pub const FLIP: u64 = 1;
    pub const ROTATE: u64 = 2;
    pub const SCALE: u64 = 3;
    pub const SHIFT: u64 = 4;
    pub const NOISE: u64 = 5;
    pub const GAMMA: u64 = 6;
}

fn get_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}
