//! Error types for the data pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while configuring the pipeline, reading volumes, or
/// assembling samples.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed construction-time arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A volume file could not be read or decoded.
    #[error("failed to load volume {}: {source}", path.display())]
    Volume {
        /// File that failed.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The file does not start with a valid NIfTI header.
    #[error("invalid NIfTI magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Voxel data type code is not supported.
    #[error("unsupported data type code: {0}")]
    UnsupportedDataType(i16),

    /// Header dimensions are inconsistent or out of range.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The file is not a recognised volume format.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Gzip or zlib payload could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Sample index outside `[0, len)`.
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// Arrays that must agree in shape do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Building the sample at `index` failed.
    #[error("failed to build sample {index}: {source}")]
    Sample {
        /// Subject index.
        index: usize,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// Sample construction panicked on a worker thread.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    /// Manifest or configuration JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`], used by callers that implement
/// their own retry or skip policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad construction-time arguments.
    Config,
    /// Unreadable or corrupt file.
    FileIo,
    /// Out-of-range access.
    Index,
    /// Data that was read but cannot be processed (shapes, dtypes).
    Data,
}

impl Error {
    /// Classify this error. Any failure to decode a volume counts as a file
    /// error; [`Error::Sample`] reports the kind of its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Json(_) => ErrorKind::Config,
            Self::Io(_)
            | Self::InvalidMagic(_)
            | Self::UnsupportedDataType(_)
            | Self::InvalidFileFormat(_)
            | Self::Decompression(_)
            | Self::Volume { .. } => ErrorKind::FileIo,
            Self::IndexOutOfRange { .. } => ErrorKind::Index,
            Self::InvalidDimensions(_) | Self::ShapeMismatch(_) | Self::WorkerPanic(_) => {
                ErrorKind::Data
            }
            Self::Sample { source, .. } => source.kind(),
        }
    }

    pub(crate) fn volume(path: impl Into<PathBuf>, source: Error) -> Self {
        Self::Volume {
            path: path.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_wrapped_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::Sample {
            index: 3,
            source: Box::new(Error::volume("t2w.mha", Error::Io(io))),
        };
        assert_eq!(err.kind(), ErrorKind::FileIo);
        assert!(err.to_string().contains("sample 3"));
        assert!(err.to_string().contains("t2w.mha"));
    }

    #[test]
    fn test_kind_of_index_error() {
        let err = Error::IndexOutOfRange { index: 9, len: 2 };
        assert_eq!(err.kind(), ErrorKind::Index);
    }
}
