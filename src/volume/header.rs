//! `NIfTI` header parsing and serialization.
//!
//! Reads NIfTI-1 (348-byte) and NIfTI-2 (540-byte) headers in either byte
//! order. Only the fields needed to locate and decode voxel data are kept.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// NIfTI format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiftiVersion {
    /// NIfTI-1 format (348-byte header, 16-bit dimensions)
    #[default]
    Nifti1,
    /// NIfTI-2 format (540-byte header, 64-bit dimensions)
    Nifti2,
}

impl NiftiVersion {
    /// Header size in bytes for this version.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Nifti1 => 348,
            Self::Nifti2 => 540,
        }
    }
}

mod offsets_v1 {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const AUX_FILE: usize = 228;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

mod offsets_v2 {
    pub const MAGIC: usize = 4;
    pub const DATATYPE: usize = 12;
    pub const BITPIX: usize = 14;
    pub const DIM: usize = 16;
    pub const PIXDIM: usize = 104;
    pub const VOX_OFFSET: usize = 168;
    pub const SCL_SLOPE: usize = 176;
    pub const SCL_INTER: usize = 184;
    pub const DESCRIP: usize = 240;
}

/// Voxel data type codes shared by the `NIfTI` and `MetaImage` readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit floating point
    Float32 = 16,
    /// 64-bit floating point
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
    /// Signed 64-bit integer
    Int64 = 1024,
    /// Unsigned 64-bit integer
    UInt64 = 1280,
    /// IEEE 754 half precision
    Float16 = 16384,
    /// bfloat16
    BFloat16 = 16385,
}

impl DataType {
    /// Parse from `NIfTI` datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(Self::UInt8),
            4 => Ok(Self::Int16),
            8 => Ok(Self::Int32),
            16 => Ok(Self::Float32),
            64 => Ok(Self::Float64),
            256 => Ok(Self::Int8),
            512 => Ok(Self::UInt16),
            768 => Ok(Self::UInt32),
            1024 => Ok(Self::Int64),
            1280 => Ok(Self::UInt64),
            16384 => Ok(Self::Float16),
            16385 => Ok(Self::BFloat16),
            _ => Err(Error::UnsupportedDataType(code)),
        }
    }

    /// Size of each element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Rust type name, used in error messages.
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::UInt8 => "u8",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float16 => "f16",
            Self::BFloat16 => "bf16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Parsed `NIfTI` header.
///
/// Dimensions and scaling are widened to 64 bits so both versions share one
/// representation.
#[derive(Debug, Clone)]
pub struct NiftiHeader {
    /// Format version.
    pub version: NiftiVersion,
    /// Number of dimensions (1-7).
    pub ndim: u8,
    /// Size along each dimension, x first.
    pub dim: [i64; 7],
    /// Voxel data type.
    pub datatype: DataType,
    /// qfac at index 0, voxel sizes at `1..=ndim`.
    pub pixdim: [f64; 8],
    /// Byte offset of voxel data.
    pub vox_offset: i64,
    /// Intensity scaling slope (0 disables scaling).
    pub scl_slope: f64,
    /// Intensity scaling intercept.
    pub scl_inter: f64,
    /// Free-text description.
    pub descrip: String,
    pub(crate) little_endian: bool,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            version: NiftiVersion::Nifti1,
            ndim: 3,
            dim: [1; 7],
            datatype: DataType::Float32,
            pixdim: [1.0; 8],
            vox_offset: 352,
            scl_slope: 1.0,
            scl_inter: 0.0,
            descrip: String::new(),
            little_endian: true,
        }
    }
}

impl NiftiHeader {
    /// Size of a NIfTI-1 header in bytes.
    pub const SIZE: usize = 348;

    /// Header size for this header's version.
    pub fn header_size(&self) -> usize {
        self.version.header_size()
    }

    /// Read a header with automatic version and endianness detection.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "header too short to detect version",
            )));
        }

        let sizeof_hdr_le = LittleEndian::read_i32(&bytes[0..4]);
        let sizeof_hdr_be = BigEndian::read_i32(&bytes[0..4]);

        let (version, little_endian) = match (sizeof_hdr_le, sizeof_hdr_be) {
            (348, _) => (NiftiVersion::Nifti1, true),
            (_, 348) => (NiftiVersion::Nifti1, false),
            (540, _) => (NiftiVersion::Nifti2, true),
            (_, 540) => (NiftiVersion::Nifti2, false),
            _ => {
                return Err(Error::InvalidMagic([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ]))
            }
        };

        if bytes.len() < version.header_size() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "header too short: got {} bytes, need {} for {:?}",
                    bytes.len(),
                    version.header_size(),
                    version
                ),
            )));
        }

        let header = match (version, little_endian) {
            (NiftiVersion::Nifti1, true) => Self::parse_v1::<LittleEndian>(bytes, true)?,
            (NiftiVersion::Nifti1, false) => Self::parse_v1::<BigEndian>(bytes, false)?,
            (NiftiVersion::Nifti2, true) => Self::parse_v2::<LittleEndian>(bytes, true)?,
            (NiftiVersion::Nifti2, false) => Self::parse_v2::<BigEndian>(bytes, false)?,
        };
        header.validate()?;
        Ok(header)
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v1<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets_v1::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" {
            // "ni1" pairs use a detached .img file, which we do not read.
            return Err(Error::InvalidMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }

        let ndim = E::read_i16(&bytes[DIM..DIM + 2]);
        let mut dim = [1i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            let offset = DIM + 2 + i * 2;
            *d = i64::from(E::read_i16(&bytes[offset..offset + 2]));
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..BITPIX + 2]))?;

        let mut pixdim = [0.0f64; 8];
        for (i, p) in pixdim.iter_mut().enumerate() {
            let offset = PIXDIM + i * 4;
            *p = f64::from(E::read_f32(&bytes[offset..offset + 4]));
        }

        let vox_offset = E::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be a finite integer, got {}",
                vox_offset
            )));
        }

        Ok(Self {
            version: NiftiVersion::Nifti1,
            ndim: checked_ndim(i64::from(ndim))?,
            dim,
            datatype,
            pixdim,
            vox_offset: vox_offset as i64,
            scl_slope: f64::from(E::read_f32(&bytes[SCL_SLOPE..SCL_SLOPE + 4])),
            scl_inter: f64::from(E::read_f32(&bytes[SCL_INTER..SCL_INTER + 4])),
            descrip: read_c_string(&bytes[DESCRIP..AUX_FILE]),
            little_endian,
        })
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v2<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets_v2::*;

        let magic = &bytes[MAGIC..MAGIC + 8];
        if magic != b"n+2\0\r\n\x1a\n" {
            return Err(Error::InvalidMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }

        let ndim = E::read_i64(&bytes[DIM..DIM + 8]);
        let mut dim = [1i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            let offset = DIM + 8 + i * 8;
            *d = E::read_i64(&bytes[offset..offset + 8]);
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..BITPIX + 2]))?;

        let mut pixdim = [0.0f64; 8];
        for (i, p) in pixdim.iter_mut().enumerate() {
            let offset = PIXDIM + i * 8;
            *p = E::read_f64(&bytes[offset..offset + 8]);
        }

        Ok(Self {
            version: NiftiVersion::Nifti2,
            ndim: checked_ndim(ndim)?,
            dim,
            datatype,
            pixdim,
            vox_offset: E::read_i64(&bytes[VOX_OFFSET..VOX_OFFSET + 8]),
            scl_slope: E::read_f64(&bytes[SCL_SLOPE..SCL_SLOPE + 8]),
            scl_inter: E::read_f64(&bytes[SCL_INTER..SCL_INTER + 8]),
            descrip: read_c_string(&bytes[DESCRIP..DESCRIP + 80]),
            little_endian,
        })
    }

    /// Serialize as a little-endian NIfTI-1 header.
    ///
    /// The sform is set to a diagonal of the voxel spacing.
    #[allow(clippy::wildcard_imports)]
    pub fn to_bytes(&self) -> Vec<u8> {
        use offsets_v1::*;

        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_i32(&mut buf[SIZEOF_HDR..SIZEOF_HDR + 4], Self::SIZE as i32);

        LittleEndian::write_i16(&mut buf[DIM..DIM + 2], i16::from(self.ndim));
        for (i, &d) in self.dim.iter().enumerate() {
            let offset = DIM + 2 + i * 2;
            LittleEndian::write_i16(&mut buf[offset..offset + 2], d.min(i64::from(i16::MAX)) as i16);
        }

        LittleEndian::write_i16(&mut buf[DATATYPE..DATATYPE + 2], self.datatype as i16);
        LittleEndian::write_i16(
            &mut buf[BITPIX..BITPIX + 2],
            (self.datatype.byte_size() * 8) as i16,
        );

        for (i, &p) in self.pixdim.iter().enumerate() {
            let offset = PIXDIM + i * 4;
            LittleEndian::write_f32(&mut buf[offset..offset + 4], p as f32);
        }

        LittleEndian::write_f32(&mut buf[VOX_OFFSET..VOX_OFFSET + 4], self.vox_offset as f32);
        LittleEndian::write_f32(&mut buf[SCL_SLOPE..SCL_SLOPE + 4], self.scl_slope as f32);
        LittleEndian::write_f32(&mut buf[SCL_INTER..SCL_INTER + 4], self.scl_inter as f32);

        // millimetres
        buf[XYZT_UNITS] = 2;

        let descrip = self.descrip.as_bytes();
        let len = descrip.len().min(79);
        buf[DESCRIP..DESCRIP + len].copy_from_slice(&descrip[..len]);

        LittleEndian::write_i16(&mut buf[SFORM_CODE..SFORM_CODE + 2], 1);
        for row in 0..3 {
            let offset = SROW_X + row * 16 + row * 4;
            LittleEndian::write_f32(&mut buf[offset..offset + 4], self.pixdim[row + 1] as f32);
        }

        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        buf
    }

    /// Spatial shape `[x, y, z]`. Missing trailing dimensions count as 1.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let mut shape = [1usize; 3];
        for (i, s) in shape.iter_mut().enumerate().take(self.ndim as usize) {
            *s = self.dim[i] as usize;
        }
        shape
    }

    /// Voxel spacing `[x, y, z]`.
    pub fn spacing(&self) -> [f64; 3] {
        [self.pixdim[1], self.pixdim[2], self.pixdim[3]]
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .product()
    }

    /// Total size of voxel data in bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// True if the file was little endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Check the invariants the reader relies on.
    pub fn validate(&self) -> Result<()> {
        for i in 0..self.ndim as usize {
            if self.dim[i] <= 0 {
                return Err(Error::InvalidDimensions(format!(
                    "dimension {} must be positive, got {}",
                    i, self.dim[i]
                )));
            }
        }

        // Volumes only: anything past z must be a singleton.
        if let Some(i) = (3..self.ndim as usize).find(|&i| self.dim[i] != 1) {
            return Err(Error::InvalidDimensions(format!(
                "expected a 3-D volume, dimension {} has size {}",
                i, self.dim[i]
            )));
        }

        for i in 0..(self.ndim as usize).min(3) {
            let spacing = self.pixdim[i + 1];
            if !spacing.is_finite() || spacing <= 0.0 {
                return Err(Error::InvalidDimensions(format!(
                    "pixdim[{}] must be finite and > 0, got {}",
                    i + 1,
                    spacing
                )));
            }
        }

        let min_offset = self.version.header_size() as i64;
        if self.vox_offset < min_offset {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset {} before header end ({})",
                self.vox_offset, min_offset
            )));
        }

        let mut voxels: usize = 1;
        for i in 0..self.ndim as usize {
            voxels = voxels
                .checked_mul(self.dim[i] as usize)
                .ok_or_else(|| Error::InvalidDimensions("dimension product overflow".into()))?;
        }
        voxels
            .checked_mul(self.datatype.byte_size())
            .ok_or_else(|| Error::InvalidDimensions("data size overflow".into()))?;

        Ok(())
    }
}

fn checked_ndim(raw: i64) -> Result<u8> {
    if (1..=7).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(Error::InvalidDimensions(format!(
            "ndim must be 1..=7, got {}",
            raw
        )))
    }
}

fn check_bitpix(datatype: DataType, bitpix: i16) -> Result<()> {
    let expected = (datatype.byte_size() * 8) as i16;
    if bitpix == expected {
        Ok(())
    } else {
        Err(Error::InvalidDimensions(format!(
            "bitpix {} does not match datatype {} (expected {})",
            bitpix, datatype, expected
        )))
    }
}

fn read_c_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_v1(ndim: i16, dims: [i16; 3]) -> Vec<u8> {
        let mut bytes = vec![0u8; 348];
        LittleEndian::write_i32(&mut bytes[0..4], 348);
        bytes[344..348].copy_from_slice(b"n+1\0");
        LittleEndian::write_i16(&mut bytes[40..42], ndim);
        for (i, &d) in dims.iter().enumerate() {
            LittleEndian::write_i16(&mut bytes[42 + i * 2..44 + i * 2], d);
        }
        LittleEndian::write_i16(&mut bytes[70..72], 4); // Int16
        LittleEndian::write_i16(&mut bytes[72..74], 16);
        for i in 0..3 {
            LittleEndian::write_f32(&mut bytes[80 + i * 4..84 + i * 4], 0.5);
        }
        LittleEndian::write_f32(&mut bytes[108..112], 352.0);
        bytes
    }

    #[test]
    fn test_parse_v1_little_endian() {
        let header = NiftiHeader::from_bytes(&minimal_v1(3, [4, 5, 6])).unwrap();
        assert_eq!(header.version, NiftiVersion::Nifti1);
        assert_eq!(header.datatype, DataType::Int16);
        assert_eq!(header.spatial_shape(), [4, 5, 6]);
        assert_eq!(header.spacing(), [0.5, 0.5, 0.5]);
        assert_eq!(header.data_size(), 4 * 5 * 6 * 2);
        assert!(header.is_little_endian());
    }

    #[test]
    fn test_two_dimensional_header_is_padded() {
        let header = NiftiHeader::from_bytes(&minimal_v1(2, [4, 5, 0])).unwrap();
        assert_eq!(header.spatial_shape(), [4, 5, 1]);
    }

    #[test]
    fn test_rejects_non_singleton_fourth_dimension() {
        let mut bytes = minimal_v1(4, [4, 5, 6]);
        LittleEndian::write_i16(&mut bytes[48..50], 3);
        let err = NiftiHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("3-D volume"));
    }

    #[test]
    fn test_rejects_bad_bitpix() {
        let mut bytes = minimal_v1(3, [2, 2, 2]);
        LittleEndian::write_i16(&mut bytes[72..74], 8);
        assert!(NiftiHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_roundtrip_through_writer() {
        let header = NiftiHeader {
            dim: [7, 8, 9, 1, 1, 1, 1],
            pixdim: [1.0, 0.5, 0.5, 3.0, 0.0, 0.0, 0.0, 0.0],
            datatype: DataType::UInt8,
            descrip: "t2w".into(),
            ..NiftiHeader::default()
        };
        let parsed = NiftiHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.spatial_shape(), [7, 8, 9]);
        assert_eq!(parsed.spacing(), [0.5, 0.5, 3.0]);
        assert_eq!(parsed.datatype, DataType::UInt8);
        assert_eq!(parsed.descrip, "t2w");
    }

    #[test]
    fn test_big_endian_detection() {
        let mut bytes = vec![0u8; 348];
        BigEndian::write_i32(&mut bytes[0..4], 348);
        bytes[344..348].copy_from_slice(b"n+1\0");
        BigEndian::write_i16(&mut bytes[40..42], 3);
        for i in 0..3 {
            BigEndian::write_i16(&mut bytes[42 + i * 2..44 + i * 2], 2);
            BigEndian::write_f32(&mut bytes[80 + i * 4..84 + i * 4], 1.0);
        }
        BigEndian::write_i16(&mut bytes[70..72], 16);
        BigEndian::write_i16(&mut bytes[72..74], 32);
        BigEndian::write_f32(&mut bytes[108..112], 352.0);

        let header = NiftiHeader::from_bytes(&bytes).unwrap();
        assert!(!header.is_little_endian());
        assert_eq!(header.spatial_shape(), [2, 2, 2]);
    }

    #[test]
    fn test_version2_detection() {
        let mut bytes = vec![0u8; 540];
        LittleEndian::write_i32(&mut bytes[0..4], 540);
        bytes[4..12].copy_from_slice(b"n+2\0\r\n\x1a\n");
        LittleEndian::write_i16(&mut bytes[12..14], 16);
        LittleEndian::write_i16(&mut bytes[14..16], 32);
        LittleEndian::write_i64(&mut bytes[16..24], 3);
        for i in 0..3 {
            LittleEndian::write_i64(&mut bytes[24 + i * 8..32 + i * 8], 10);
            LittleEndian::write_f64(&mut bytes[112 + i * 8..120 + i * 8], 1.0);
        }
        LittleEndian::write_i64(&mut bytes[168..176], 544);

        let header = NiftiHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.version, NiftiVersion::Nifti2);
        assert_eq!(header.spatial_shape(), [10, 10, 10]);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = minimal_v1(3, [2, 2, 2]);
        bytes[344..348].copy_from_slice(b"BAD!");
        let err = NiftiHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("invalid NIfTI magic"));
    }
}
