//! # mpmri
//!
//! Data pipeline for multi-sequence prostate MRI classification.
//!
//! A subject is three co-registered sequences (T2W, ADC, HBV), an optional
//! lesion mask, an optional case label and a handful of clinical fields. This
//! crate turns such subjects into training samples:
//!
//! - [`volume`] decodes `NIfTI` and `MetaImage` files, including the key/value
//!   tags that carry clinical fields.
//! - [`scan::ScanLoader`] loads one sequence as `[1, 1, z, y, x]` with
//!   percentile-clipped z-score normalization.
//! - [`metadata::MetadataResolver`] imputes, log-transforms and standardizes
//!   the clinical fields against fixed population statistics.
//! - [`dataset::PairedVolumeDataset`] assembles indexed [`Sample`]s, drawing a
//!   fresh seed per access from a lock-free [`seed::SeedSequence`].
//! - [`loader::Augmenter`] augments samples on a worker pool and collates
//!   them into [`Batch`]es.
//!
//! ## Example
//!
//! ```ignore
//! use mpmri::{Augmenter, DatasetConfig, Manifest, PairedVolumeDataset};
//! use std::sync::Arc;
//!
//! let manifest = Manifest::from_overview("overviews/train-fold-0.json")?;
//! let config = DatasetConfig::from_json_file("dataset.json")?;
//! let dataset = Arc::new(PairedVolumeDataset::from_manifest(manifest, config)?);
//!
//! let mut augmenter = Augmenter::wrap(dataset, 4, false);
//! augmenter.restart()?;
//! for batch in augmenter.batches(8) {
//!     let batch = batch?;
//!     // batch.image: [8, 3, z, y, x], batch.metadata: [8, 4]
//! }
//! ```
//!
//! The library emits `tracing` events but never installs a subscriber.

pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod metadata;
pub mod scan;
pub mod seed;
pub mod transforms;
pub mod volume;

pub use config::DatasetConfig;
pub use dataset::{DatasetBuilder, PairedVolumeDataset, Sample, SampleSource};
pub use error::{Error, ErrorKind, Result};
pub use loader::{collate, Augmenter, Batch};
pub use manifest::{class_weights, Manifest, SubjectEntry};
pub use metadata::{FieldParser, FieldSpec, MetadataConfig, MetadataResolver, PopulationStats, RawRecord, RawValue};
pub use scan::{z_score_norm, ScanLoader};
pub use seed::{SeedSequence, SeedSource};
pub use transforms::{AugmentPipeline, Compose, VolumeTransform};
pub use volume::{read_volume, Volume};
