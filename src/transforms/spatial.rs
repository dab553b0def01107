//! Spatial transforms. These only move voxels, so they apply to images and
//! label masks alike.

use super::{get_rng, stream, VolumeTransform};
use crate::error::{Error, Result};
use crate::seed::derive_seed;
use ndarray::{s, Array5, Axis};
use rand::Rng;

/// The `z`, `y`, `x` axes of a `[batch, channel, z, y, x]` array.
pub const SPATIAL_AXES: [usize; 3] = [2, 3, 4];

fn check_spatial_axis(axis: usize) -> Result<()> {
    if SPATIAL_AXES.contains(&axis) {
        Ok(())
    } else {
        Err(Error::InvalidDimensions(format!(
            "axis {} is not a spatial axis (expected one of {:?})",
            axis, SPATIAL_AXES
        )))
    }
}

/// Reverse the volume along each of `axes`.
pub fn flip<T: Clone>(mut volume: Array5<T>, axes: &[usize]) -> Result<Array5<T>> {
    if axes.is_empty() {
        return Ok(volume);
    }
    for &axis in axes {
        check_spatial_axis(axis)?;
        volume.invert_axis(Axis(axis));
    }
    Ok(volume.as_standard_layout().into_owned())
}

/// Rotate by `k * 90` degrees in the plane spanned by two spatial axes.
///
/// Odd `k` swaps the extents of the two axes.
pub fn rotate_90<T: Clone>(mut volume: Array5<T>, plane: (usize, usize), k: usize) -> Result<Array5<T>> {
    check_spatial_axis(plane.0)?;
    check_spatial_axis(plane.1)?;
    if plane.0 == plane.1 {
        return Err(Error::InvalidDimensions(
            "rotation axes must be different".into(),
        ));
    }

    let k = k % 4;
    if k == 0 {
        return Ok(volume);
    }
    for _ in 0..k {
        volume.swap_axes(plane.0, plane.1);
        volume.invert_axis(Axis(plane.1));
    }
    Ok(volume.as_standard_layout().into_owned())
}

/// Center the volume in a `[z, y, x]` box of `target` extent, cropping
/// symmetrically where it is larger and padding with `T::default()` where it
/// is smaller. Odd remainders go to the trailing side.
pub fn center_pad_or_crop<T: Clone + Default>(volume: &Array5<T>, target: [usize; 3]) -> Result<Array5<T>> {
    if target.contains(&0) {
        return Err(Error::InvalidDimensions(format!(
            "target shape cannot have zero extent: {:?}",
            target
        )));
    }
    let shape = volume.shape();
    let (batch, channels) = (shape[0], shape[1]);

    let mut src = [(0, 0); 3];
    let mut dst = [(0, 0); 3];
    for d in 0..3 {
        let size = shape[d + 2];
        let keep = size.min(target[d]);
        let from = (size - keep) / 2;
        let to = (target[d] - keep) / 2;
        src[d] = (from, from + keep);
        dst[d] = (to, to + keep);
    }

    let mut out = Array5::from_elem((batch, channels, target[0], target[1], target[2]), T::default());
    out.slice_mut(s![
        ..,
        ..,
        dst[0].0..dst[0].1,
        dst[1].0..dst[1].1,
        dst[2].0..dst[2].1
    ])
    .assign(&volume.slice(s![
        ..,
        ..,
        src[0].0..src[0].1,
        src[1].0..src[1].1,
        src[2].0..src[2].1
    ]));
    Ok(out)
}

/// Flip each listed spatial axis independently with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandFlip {
    axes: Vec<usize>,
    prob: f32,
}

impl Default for RandFlip {
    fn default() -> Self {
        Self {
            axes: SPATIAL_AXES.to_vec(),
            prob: 0.5,
        }
    }
}

impl RandFlip {
    pub fn new(axes: &[usize], prob: f32) -> Result<Self> {
        for &axis in axes {
            check_spatial_axis(axis)?;
        }
        check_probability(prob)?;
        Ok(Self {
            axes: axes.to_vec(),
            prob,
        })
    }

    /// Axes that `seed` selects for flipping.
    pub fn sample_axes(&self, seed: u64) -> Vec<usize> {
        let mut rng = get_rng(derive_seed(seed, stream::FLIP));
        self.axes
            .iter()
            .filter(|_| rng.gen::<f32>() < self.prob)
            .copied()
            .collect()
    }
}

impl<T: Clone + Send + Sync> VolumeTransform<T> for RandFlip {
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        flip(volume, &self.sample_axes(seed))
    }
}

/// Rotate by a random multiple of 90 degrees in a fixed plane.
#[derive(Debug, Clone)]
pub struct RandRotate90 {
    plane: (usize, usize),
    prob: f32,
}

impl Default for RandRotate90 {
    /// Axial-plane rotation, always drawn.
    fn default() -> Self {
        Self {
            plane: (3, 4),
            prob: 1.0,
        }
    }
}

impl RandRotate90 {
    /// Rotate in `plane` with probability `prob`; the number of quarter turns
    /// is uniform over 1..=3 when a rotation happens.
    pub fn new(plane: (usize, usize), prob: f32) -> Result<Self> {
        check_spatial_axis(plane.0)?;
        check_spatial_axis(plane.1)?;
        if plane.0 == plane.1 {
            return Err(Error::InvalidDimensions(
                "rotation axes must be different".into(),
            ));
        }
        check_probability(prob)?;
        Ok(Self { plane, prob })
    }

    /// Number of quarter turns that `seed` selects.
    pub fn sample_turns(&self, seed: u64) -> usize {
        let mut rng = get_rng(derive_seed(seed, stream::ROTATE));
        if rng.gen::<f32>() < self.prob {
            rng.gen_range(1..4)
        } else {
            0
        }
    }
}

impl<T: Clone + Send + Sync> VolumeTransform<T> for RandRotate90 {
    fn apply(&self, volume: Array5<T>, seed: u64) -> Result<Array5<T>> {
        rotate_90(volume, self.plane, self.sample_turns(seed))
    }
}

/// Deterministic center pad/crop to a fixed spatial shape.
#[derive(Debug, Clone, Copy)]
pub struct ResizeWithPadOrCrop {
    shape: [usize; 3],
}

impl ResizeWithPadOrCrop {
    pub fn new(shape: [usize; 3]) -> Result<Self> {
        if shape.contains(&0) {
            return Err(Error::InvalidDimensions(format!(
                "target shape cannot have zero extent: {:?}",
                shape
            )));
        }
        Ok(Self { shape })
    }
}

impl<T: Clone + Default + Send + Sync> VolumeTransform<T> for ResizeWithPadOrCrop {
    fn apply(&self, volume: Array5<T>, _seed: u64) -> Result<Array5<T>> {
        if volume.shape()[2..] == self.shape[..] {
            return Ok(volume);
        }
        center_pad_or_crop(&volume, self.shape)
    }
}

pub(super) fn check_probability(prob: f32) -> Result<()> {
    if (0.0..=1.0).contains(&prob) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "probability must be within [0, 1], got {}",
            prob
        )))
    }
}
