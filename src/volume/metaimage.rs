//! `MetaImage` (`.mha` / `.mhd`) reading and writing.
//!
//! The header is ASCII `Key = Value` lines terminated by `ElementDataFile`.
//! Keys that are not part of the format are returned as volume tags; this is
//! where scanner exports put clinical fields such as `PSA_REPORT`.

use super::header::DataType;
use super::{decode_samples, encode_samples, samples_to_array, Volume};
use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Header keys defined by the format itself; everything else is a tag.
const RESERVED_KEYS: &[&str] = &[
    "ObjectType",
    "ObjectSubType",
    "NDims",
    "Name",
    "Comment",
    "TransformType",
    "BinaryData",
    "BinaryDataByteOrderMSB",
    "ElementByteOrderMSB",
    "CompressedData",
    "CompressedDataSize",
    "TransformMatrix",
    "Rotation",
    "Orientation",
    "Offset",
    "Position",
    "Origin",
    "CenterOfRotation",
    "AnatomicalOrientation",
    "ElementSpacing",
    "ElementSize",
    "DimSize",
    "HeaderSize",
    "ElementNumberOfChannels",
    "ElementMin",
    "ElementMax",
    "ElementType",
    "ElementDataFile",
];

fn element_type(name: &str) -> Result<DataType> {
    let dtype = match name {
        "MET_UCHAR" => DataType::UInt8,
        "MET_CHAR" => DataType::Int8,
        "MET_SHORT" => DataType::Int16,
        "MET_USHORT" => DataType::UInt16,
        "MET_INT" | "MET_LONG" => DataType::Int32,
        "MET_UINT" | "MET_ULONG" => DataType::UInt32,
        "MET_LONG_LONG" => DataType::Int64,
        "MET_ULONG_LONG" => DataType::UInt64,
        "MET_FLOAT" => DataType::Float32,
        "MET_DOUBLE" => DataType::Float64,
        other => {
            return Err(Error::InvalidFileFormat(format!(
                "unsupported MetaImage ElementType: {}",
                other
            )))
        }
    };
    Ok(dtype)
}

fn element_type_name(dtype: DataType) -> Result<&'static str> {
    let name = match dtype {
        DataType::UInt8 => "MET_UCHAR",
        DataType::Int8 => "MET_CHAR",
        DataType::Int16 => "MET_SHORT",
        DataType::UInt16 => "MET_USHORT",
        DataType::Int32 => "MET_INT",
        DataType::UInt32 => "MET_UINT",
        DataType::Int64 => "MET_LONG_LONG",
        DataType::UInt64 => "MET_ULONG_LONG",
        DataType::Float32 => "MET_FLOAT",
        DataType::Float64 => "MET_DOUBLE",
        DataType::Float16 | DataType::BFloat16 => {
            return Err(Error::InvalidFileFormat(format!(
                "MetaImage has no element type for {}",
                dtype
            )))
        }
    };
    Ok(name)
}

/// Parsed `MetaImage` header.
#[derive(Debug, Clone)]
struct MetaHeader {
    fields: BTreeMap<String, String>,
    /// Byte offset of inline data (`ElementDataFile = LOCAL`).
    data_offset: usize,
}

impl MetaHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut fields = BTreeMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let line_end = bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |i| pos + i);
            let line = String::from_utf8_lossy(&bytes[pos..line_end]);
            pos = (line_end + 1).min(bytes.len());

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            fields.insert(key.to_string(), value.to_string());
            if key == "ElementDataFile" {
                return Ok(Self {
                    fields,
                    data_offset: pos,
                });
            }
        }
        Err(Error::InvalidFileFormat(
            "MetaImage header has no ElementDataFile entry".into(),
        ))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::InvalidFileFormat(format!("MetaImage header is missing {}", key))
        })
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
    }

    fn numbers<T: std::str::FromStr>(&self, key: &str) -> Result<Vec<T>> {
        self.require(key)?
            .split_whitespace()
            .map(|tok| {
                tok.parse().map_err(|_| {
                    Error::InvalidFileFormat(format!("invalid {} entry: {}", key, tok))
                })
            })
            .collect()
    }

    fn shape(&self) -> Result<[usize; 3]> {
        let dims: Vec<usize> = self.numbers("DimSize")?;
        if dims.is_empty() || dims.len() > 4 || dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidDimensions(format!(
                "unsupported DimSize {:?}",
                dims
            )));
        }
        if dims.len() == 4 && dims[3] != 1 {
            return Err(Error::InvalidDimensions(format!(
                "expected a 3-D volume, got DimSize {:?}",
                dims
            )));
        }
        let mut shape = [1usize; 3];
        for (s, &d) in shape.iter_mut().zip(&dims) {
            *s = d;
        }
        Ok(shape)
    }

    fn spacing(&self) -> Result<[f64; 3]> {
        let key = if self.get("ElementSpacing").is_some() {
            "ElementSpacing"
        } else if self.get("ElementSize").is_some() {
            "ElementSize"
        } else {
            return Ok([1.0; 3]);
        };
        let values: Vec<f64> = self.numbers(key)?;
        let mut spacing = [1.0; 3];
        for (s, &v) in spacing.iter_mut().zip(&values) {
            *s = v;
        }
        Ok(spacing)
    }

    fn tags(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Load a `.mha` or `.mhd` volume.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let header = MetaHeader::parse(&bytes)?;

    if header.get("BinaryData").is_some() && !header.flag("BinaryData") {
        return Err(Error::InvalidFileFormat(
            "ASCII MetaImage data is not supported".into(),
        ));
    }
    if header
        .get("ElementNumberOfChannels")
        .is_some_and(|c| c.trim() != "1")
    {
        return Err(Error::InvalidFileFormat(
            "multi-channel MetaImage volumes are not supported".into(),
        ));
    }

    let dtype = element_type(header.require("ElementType")?)?;
    let shape = header.shape()?;
    let expected = shape
        .iter()
        .try_fold(dtype.byte_size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            Error::InvalidDimensions(format!("data size overflow for DimSize {:?}", shape))
        })?;

    let data_file = header.require("ElementDataFile")?;
    let raw: Vec<u8> = if data_file.eq_ignore_ascii_case("LOCAL") {
        bytes[header.data_offset..].to_vec()
    } else if data_file.eq_ignore_ascii_case("LIST") || data_file.contains('%') {
        return Err(Error::InvalidFileFormat(format!(
            "multi-file MetaImage data ({}) is not supported",
            data_file
        )));
    } else {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::read(dir.join(data_file))?
    };

    let payload = if header.flag("CompressedData") {
        // The header size is untrusted until the payload is decoded.
        let mut out = Vec::with_capacity(expected.min(raw.len().saturating_mul(4)));
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| Error::Decompression(format!("zlib decode failed: {e}")))?;
        out
    } else {
        raw
    };

    if payload.len() < expected {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "MetaImage data truncated: {} bytes, need {}",
                payload.len(),
                expected
            ),
        )));
    }

    let msb = header.flag("BinaryDataByteOrderMSB") || header.flag("ElementByteOrderMSB");
    let samples = decode_samples(&payload[..expected], dtype, !msb);
    let mut volume = Volume::new(samples_to_array(samples, shape)?).with_spacing(header.spacing()?);
    volume.set_tags(header.tags());
    Ok(volume)
}

/// Write a volume as a single-file `.mha`, tags included in the header.
pub fn save<P: AsRef<Path>>(volume: &Volume, path: P, dtype: DataType, compress: bool) -> Result<()> {
    let type_name = element_type_name(dtype)?;
    for key in volume.tags().keys() {
        if key.contains('=') || key.contains('\n') || RESERVED_KEYS.contains(&key.as_str()) {
            return Err(Error::Configuration(format!(
                "tag {:?} cannot be stored in a MetaImage header",
                key
            )));
        }
    }

    let samples: Vec<f32> = volume.data().iter().copied().collect();
    let mut data = encode_samples(&samples, dtype);
    if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&data)?;
        data = encoder.finish()?;
    }

    let [z, y, x] = volume.shape();
    let [sx, sy, sz] = volume.spacing();
    let mut text = String::new();
    text.push_str("ObjectType = Image\nNDims = 3\nBinaryData = True\n");
    text.push_str("BinaryDataByteOrderMSB = False\n");
    if compress {
        text.push_str(&format!(
            "CompressedData = True\nCompressedDataSize = {}\n",
            data.len()
        ));
    } else {
        text.push_str("CompressedData = False\n");
    }
    text.push_str(&format!("ElementSpacing = {} {} {}\n", sx, sy, sz));
    text.push_str(&format!("DimSize = {} {} {}\n", x, y, z));
    for (key, value) in volume.tags() {
        text.push_str(&format!("{} = {}\n", key, value.replace('\n', " ")));
    }
    text.push_str(&format!("ElementType = {}\nElementDataFile = LOCAL\n", type_name));

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(text.as_bytes())?;
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(())
}
