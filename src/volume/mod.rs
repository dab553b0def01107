//! Medical volume readers.
//!
//! Two on-disk formats are understood:
//!
//! - `NIfTI` (`.nii`, `.nii.gz`), NIfTI-1 and NIfTI-2 headers, with textual
//!   header extensions exposed as key/value tags.
//! - `MetaImage` (`.mha`, `.mhd`), whose free-form header keys carry the
//!   clinical fields (`PSA_REPORT`, `0010|1010`, ...).
//!
//! Both decode into a [`Volume`]: voxels as `f32` laid out `[z, y, x]`, the
//! voxel spacing, and a string tag map.

pub(crate) mod header;
pub mod metaimage;
pub mod nifti;

pub use header::{DataType, NiftiHeader, NiftiVersion};

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::{bf16, f16};
use ndarray::Array3;
use std::collections::BTreeMap;
use std::path::Path;

/// A decoded 3-D volume with its embedded key/value metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    spacing: [f64; 3],
    tags: BTreeMap<String, String>,
}

impl Volume {
    /// Wrap a `[z, y, x]` array with unit spacing and no tags.
    pub fn new(data: Array3<f32>) -> Self {
        Self {
            data,
            spacing: [1.0; 3],
            tags: BTreeMap::new(),
        }
    }

    /// Set voxel spacing, ordered `[x, y, z]` as on disk.
    #[must_use]
    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = spacing;
        self
    }

    /// Attach a metadata tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Voxel data, `[z, y, x]`.
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Take ownership of the voxel data.
    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Shape `[z, y, x]`.
    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Voxel spacing `[x, y, z]`.
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// All metadata tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Look up one metadata tag.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub(crate) fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags = tags;
    }
}

/// On-disk formats recognised by [`read_volume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// `.nii`
    Nifti,
    /// `.nii.gz`
    NiftiGz,
    /// `.mha` (header and data in one file)
    MetaImage,
    /// `.mhd` (header with detached data file)
    MetaHeader,
}

impl VolumeFormat {
    /// Infer the format from a file name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii.gz") {
            Ok(Self::NiftiGz)
        } else if name.ends_with(".nii") {
            Ok(Self::Nifti)
        } else if name.ends_with(".mha") {
            Ok(Self::MetaImage)
        } else if name.ends_with(".mhd") {
            Ok(Self::MetaHeader)
        } else {
            Err(Error::InvalidFileFormat(format!(
                "unrecognised volume extension: {}",
                path.display()
            )))
        }
    }
}

/// Read any supported volume, dispatching on the file extension.
///
/// Failures are wrapped in [`Error::Volume`] so the offending path is always
/// part of the message.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let read = || match VolumeFormat::from_path(path)? {
        VolumeFormat::Nifti | VolumeFormat::NiftiGz => nifti::load(path),
        VolumeFormat::MetaImage | VolumeFormat::MetaHeader => metaimage::load(path),
    };
    read().map_err(|e| Error::volume(path, e))
}

/// Decode raw voxel bytes into `f32` samples.
pub(crate) fn decode_samples(bytes: &[u8], dtype: DataType, little_endian: bool) -> Vec<f32> {
    if little_endian {
        decode_with::<LittleEndian>(bytes, dtype)
    } else {
        decode_with::<BigEndian>(bytes, dtype)
    }
}

fn decode_with<E: ByteOrder>(bytes: &[u8], dtype: DataType) -> Vec<f32> {
    let chunks = bytes.chunks_exact(dtype.byte_size());
    match dtype {
        DataType::UInt8 => bytes.iter().map(|&b| f32::from(b)).collect(),
        DataType::Int8 => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
        DataType::Int16 => chunks.map(|c| f32::from(E::read_i16(c))).collect(),
        DataType::UInt16 => chunks.map(|c| f32::from(E::read_u16(c))).collect(),
        DataType::Int32 => chunks.map(|c| E::read_i32(c) as f32).collect(),
        DataType::UInt32 => chunks.map(|c| E::read_u32(c) as f32).collect(),
        DataType::Int64 => chunks.map(|c| E::read_i64(c) as f32).collect(),
        DataType::UInt64 => chunks.map(|c| E::read_u64(c) as f32).collect(),
        DataType::Float16 => chunks.map(|c| f16::from_bits(E::read_u16(c)).to_f32()).collect(),
        DataType::BFloat16 => chunks
            .map(|c| bf16::from_bits(E::read_u16(c)).to_f32())
            .collect(),
        DataType::Float32 => chunks.map(E::read_f32).collect(),
        DataType::Float64 => chunks.map(|c| E::read_f64(c) as f32).collect(),
    }
}

/// Encode `f32` samples as little-endian bytes of the given type.
///
/// Integer targets round to nearest and saturate.
pub(crate) fn encode_samples(samples: &[f32], dtype: DataType) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * dtype.byte_size()];
    let chunks = out.chunks_exact_mut(dtype.byte_size());
    for (chunk, &v) in chunks.zip(samples) {
        let r = v.round();
        match dtype {
            DataType::UInt8 => chunk[0] = r as u8,
            DataType::Int8 => chunk[0] = (r as i8) as u8,
            DataType::Int16 => LittleEndian::write_i16(chunk, r as i16),
            DataType::UInt16 => LittleEndian::write_u16(chunk, r as u16),
            DataType::Int32 => LittleEndian::write_i32(chunk, r as i32),
            DataType::UInt32 => LittleEndian::write_u32(chunk, r as u32),
            DataType::Int64 => LittleEndian::write_i64(chunk, r as i64),
            DataType::UInt64 => LittleEndian::write_u64(chunk, r as u64),
            DataType::Float16 => LittleEndian::write_u16(chunk, f16::from_f32(v).to_bits()),
            DataType::BFloat16 => LittleEndian::write_u16(chunk, bf16::from_f32(v).to_bits()),
            DataType::Float32 => LittleEndian::write_f32(chunk, v),
            DataType::Float64 => LittleEndian::write_f64(chunk, f64::from(v)),
        }
    }
    out
}

/// Build a `[z, y, x]` array from samples stored x-fastest.
pub(crate) fn samples_to_array(samples: Vec<f32>, xyz: [usize; 3]) -> Result<Array3<f32>> {
    let [x, y, z] = xyz;
    Array3::from_shape_vec((z, y, x), samples).map_err(|e| {
        Error::InvalidDimensions(format!(
            "voxel count does not match shape {}x{}x{}: {}",
            x, y, z, e
        ))
    })
}

/// Parse `key=value` lines into a tag map. Blank lines and lines without `=`
/// are skipped.
pub(crate) fn parse_tag_lines(text: &str, tags: &mut BTreeMap<String, String>) {
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                tags.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
}
