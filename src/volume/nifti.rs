//! `NIfTI` reading and writing.
//!
//! - Uncompressed `.nii` files are memory-mapped.
//! - `.nii.gz` files are decompressed in a single pass with libdeflate, sized
//!   from the gzip trailer, falling back to a streaming decoder for
//!   multi-member or >4GB payloads.
//! - Comment extensions (`ecode` 6) are parsed as `key=value` lines into
//!   the volume's tags.

use super::header::{DataType, NiftiHeader};
use super::{decode_samples, encode_samples, parse_tag_lines, samples_to_array, Volume};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use libdeflater::{DecompressionError, Decompressor};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Extension code for free-text comments.
const ECODE_COMMENT: i32 = 6;

const GZIP_BUFFER_SIZE: usize = 256 * 1024;

thread_local! {
    static DECOMPRESSOR: std::cell::RefCell<Decompressor> = std::cell::RefCell::new(Decompressor::new());
}

/// Load a `NIfTI` volume. `.gz` files are decompressed transparently.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    if path.extension().is_some_and(|e| e == "gz") {
        load_gzipped(path)
    } else {
        load_uncompressed(path)
    }
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path) -> Result<Volume> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before returning; external
    // modification can only yield inconsistent voxel values.
    let mmap = unsafe { Mmap::map(&file)? };
    decode_nifti(&mmap)
}

fn load_gzipped(path: &Path) -> Result<Volume> {
    let compressed = std::fs::read(path)?;
    let bytes = decompress_gzip(&compressed)?;
    decode_nifti(&bytes)
}

fn estimate_gzip_uncompressed_size(compressed: &[u8]) -> usize {
    // ISIZE (RFC 1952) is the input size modulo 2^32.
    if compressed.len() >= 4 {
        let trailer = &compressed[compressed.len() - 4..];
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
    } else {
        compressed.len() * 4
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, compressed));
    let mut output = Vec::with_capacity(estimate_gzip_uncompressed_size(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let buffer_size = estimate_gzip_uncompressed_size(compressed).max(NiftiHeader::SIZE);
    let mut output = vec![0u8; buffer_size];

    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));
    match result {
        Ok(written) => {
            output.truncate(written);
            // Only the first member of a multi-member stream is decoded here;
            // the header tells us whether anything is missing.
            if has_complete_payload(&output) {
                Ok(output)
            } else {
                decompress_gzip_streaming(compressed)
            }
        }
        Err(DecompressionError::InsufficientSpace) => decompress_gzip_streaming(compressed),
        Err(e) => Err(Error::Decompression(format!("{}", e))),
    }
}

fn has_complete_payload(bytes: &[u8]) -> bool {
    NiftiHeader::from_bytes(bytes)
        .map(|h| bytes.len() >= h.vox_offset as usize + h.data_size())
        .unwrap_or(false)
}

/// Decode a complete in-memory `.nii` image.
fn decode_nifti(bytes: &[u8]) -> Result<Volume> {
    let header = NiftiHeader::from_bytes(bytes)?;
    let offset = header.vox_offset as usize;
    let end = offset + header.data_size();
    if bytes.len() < end {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("file truncated: {} bytes, need {}", bytes.len(), end),
        )));
    }

    let mut samples = decode_samples(&bytes[offset..end], header.datatype, header.is_little_endian());
    let (slope, inter) = (header.scl_slope, header.scl_inter);
    if slope != 0.0 && (slope != 1.0 || inter != 0.0) {
        for v in &mut samples {
            *v = (f64::from(*v) * slope + inter) as f32;
        }
    }

    let data = samples_to_array(samples, header.spatial_shape())?;
    let mut volume = Volume::new(data).with_spacing(header.spacing());
    volume.set_tags(read_extension_tags(bytes, &header));
    Ok(volume)
}

/// Collect `key=value` pairs from comment extensions between the header and
/// the voxel data.
fn read_extension_tags(bytes: &[u8], header: &NiftiHeader) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    let start = header.header_size();
    let end = (header.vox_offset as usize).min(bytes.len());
    if end < start + 4 || bytes[start] == 0 {
        return tags;
    }

    let read_i32 = |b: &[u8]| {
        if header.is_little_endian() {
            LittleEndian::read_i32(b)
        } else {
            BigEndian::read_i32(b)
        }
    };

    let mut pos = start + 4;
    while pos + 8 <= end {
        let esize = read_i32(&bytes[pos..pos + 4]);
        let ecode = read_i32(&bytes[pos + 4..pos + 8]);
        if esize < 8 || pos + esize as usize > end {
            tracing::trace!(esize, pos, "stopping at malformed NIfTI extension");
            break;
        }
        if ecode == ECODE_COMMENT {
            let payload = &bytes[pos + 8..pos + esize as usize];
            let text = String::from_utf8_lossy(payload);
            parse_tag_lines(text.trim_end_matches('\0'), &mut tags);
        }
        pos += esize as usize;
    }
    tags
}

/// Write a volume as `NIfTI-1`. Paths ending in `.gz` are gzip-compressed.
///
/// Tags are stored in a single comment extension.
pub fn save<P: AsRef<Path>>(volume: &Volume, path: P, dtype: DataType) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode_nifti(volume, dtype);

    let file = File::create(path)?;
    if path.extension().is_some_and(|e| e == "gz") {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    Ok(())
}

fn encode_nifti(volume: &Volume, dtype: DataType) -> Vec<u8> {
    let extension = encode_comment_extension(volume);
    let [z, y, x] = volume.shape();
    let [sx, sy, sz] = volume.spacing();

    let header = NiftiHeader {
        dim: [x as i64, y as i64, z as i64, 1, 1, 1, 1],
        pixdim: [1.0, sx, sy, sz, 0.0, 0.0, 0.0, 0.0],
        datatype: dtype,
        vox_offset: (NiftiHeader::SIZE + 4 + extension.len()) as i64,
        ..NiftiHeader::default()
    };

    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(&[u8::from(!extension.is_empty()), 0, 0, 0]);
    bytes.extend_from_slice(&extension);

    let samples: Vec<f32> = volume.data().iter().copied().collect();
    bytes.extend_from_slice(&encode_samples(&samples, dtype));
    bytes
}

fn encode_comment_extension(volume: &Volume) -> Vec<u8> {
    if volume.tags().is_empty() {
        return Vec::new();
    }
    let mut text = String::new();
    for (key, value) in volume.tags() {
        text.push_str(key);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    }
    // esize covers the 8-byte preamble and must be a multiple of 16.
    let esize = (text.len() + 8).div_ceil(16) * 16;
    let mut ext = vec![0u8; esize];
    LittleEndian::write_i32(&mut ext[0..4], esize as i32);
    LittleEndian::write_i32(&mut ext[4..8], ECODE_COMMENT);
    ext[8..8 + text.len()].copy_from_slice(text.as_bytes());
    ext
}
