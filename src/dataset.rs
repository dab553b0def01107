//! Indexed multi-sequence samples.
//!
//! [`PairedVolumeDataset`] turns one [`SubjectEntry`] into one [`Sample`]:
//! the three sequences are loaded and normalized independently, stacked on
//! the channel axis, and paired with the resolved clinical feature vector,
//! the optional lesion mask and the optional case label.
//!
//! Every call to [`get`](SampleSource::get) draws a fresh seed, so two reads
//! of the same index are augmented differently, while the image and mask of
//! one read share a seed and therefore the same spatial transform.

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, SubjectEntry, NUM_SEQUENCES};
use crate::metadata::{MetadataResolver, RawRecord};
use crate::scan::{Scan, ScanLoader};
use crate::seed::{SeedSequence, SeedSource};
use crate::transforms::VolumeTransform;
use ndarray::{Array1, Array5, ArrayView5, Axis};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

/// One fully assembled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Normalized sequences, `[1, 3, z, y, x]`, channels in manifest order.
    pub image: Array5<f32>,
    /// Standardized clinical features in declared field order.
    pub metadata: Array1<f32>,
    /// Lesion mask, `[1, 1, z, y, x]`.
    pub segmentation: Option<Array5<i8>>,
    /// Case-level label.
    pub label: Option<f32>,
    /// Seed drawn for this access; all randomness of the sample derives
    /// from it.
    pub seed: u64,
}

/// An indexable, length-reporting source of samples, safe to read from many
/// threads at once.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build sample `index`. Fails with [`Error::IndexOutOfRange`] outside
    /// `0..len()`.
    fn get(&self, index: usize) -> Result<Sample>;
}

impl<S: SampleSource + ?Sized> SampleSource for Arc<S> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        (**self).get(index)
    }
}

/// Dataset over paired multi-sequence volumes and masks.
pub struct PairedVolumeDataset {
    entries: Vec<SubjectEntry>,
    loader: ScanLoader,
    resolver: Arc<MetadataResolver>,
    transform: Option<Arc<dyn VolumeTransform<f32>>>,
    seg_transform: Option<Arc<dyn VolumeTransform<i8>>>,
    seeds: Arc<dyn SeedSource>,
}

impl std::fmt::Debug for PairedVolumeDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedVolumeDataset")
            .field("subjects", &self.entries.len())
            .field("loader", &self.loader)
            .field("fields", &self.resolver.len())
            .field("transform", &self.transform.is_some())
            .field("seg_transform", &self.seg_transform.is_some())
            .field("seeds", &self.seeds)
            .finish()
    }
}

/// Builder for [`PairedVolumeDataset`].
pub struct DatasetBuilder {
    entries: Vec<SubjectEntry>,
    config: DatasetConfig,
    labels: Option<Vec<f32>>,
    seg_files: Option<Vec<PathBuf>>,
    transform: Option<Arc<dyn VolumeTransform<f32>>>,
    seg_transform: Option<Arc<dyn VolumeTransform<i8>>>,
    seed_source: Option<Arc<dyn SeedSource>>,
}

impl DatasetBuilder {
    /// Use `config` for normalization, metadata and seeding.
    pub fn config(mut self, config: DatasetConfig) -> Self {
        self.config = config;
        self
    }

    /// Case labels, one per subject. Replaces labels from the entries.
    pub fn labels(mut self, labels: Vec<f32>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Segmentation files, one per subject. Replaces masks from the entries.
    pub fn seg_files<P: Into<PathBuf>>(mut self, files: Vec<P>) -> Self {
        self.seg_files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    /// Transform applied to the stacked image after normalization.
    pub fn transform<T: VolumeTransform<f32> + 'static>(mut self, transform: T) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Transform applied to the mask, with the image's seed.
    pub fn seg_transform<T: VolumeTransform<i8> + 'static>(mut self, transform: T) -> Self {
        self.seg_transform = Some(Arc::new(transform));
        self
    }

    /// Replace the seed sequence derived from the configuration.
    pub fn seed_source(mut self, source: Arc<dyn SeedSource>) -> Self {
        self.seed_source = Some(source);
        self
    }

    /// Validate counts and configuration, then build the dataset.
    pub fn build(self) -> Result<PairedVolumeDataset> {
        let mut entries = self.entries;
        let n = entries.len();

        if let Some(labels) = self.labels {
            if labels.len() != n {
                return Err(Error::Configuration(format!(
                    "got {} labels for {} image sets",
                    labels.len(),
                    n
                )));
            }
            for (entry, label) in entries.iter_mut().zip(labels) {
                entry.label = Some(label);
            }
        }

        if let Some(seg_files) = self.seg_files {
            if seg_files.len() != n {
                return Err(Error::Configuration(format!(
                    "got {} segmentation files for {} image sets",
                    seg_files.len(),
                    n
                )));
            }
            for (entry, seg) in entries.iter_mut().zip(seg_files) {
                entry.segmentation = Some(seg);
            }
        }

        let loader = ScanLoader::new(self.config.percentile)?;
        let resolver = Arc::new(MetadataResolver::new(self.config.metadata)?);
        let seeds: Arc<dyn SeedSource> = match (self.seed_source, self.config.seed) {
            (Some(source), _) => source,
            (None, Some(base)) => Arc::new(SeedSequence::new(base)),
            (None, None) => Arc::new(SeedSequence::from_entropy()),
        };

        tracing::info!(
            subjects = n,
            segmentations = entries.iter().filter(|e| e.segmentation.is_some()).count(),
            labels = entries.iter().filter(|e| e.label.is_some()).count(),
            fields = resolver.len(),
            percentile = ?loader.percentile(),
            "built paired volume dataset"
        );

        Ok(PairedVolumeDataset {
            entries,
            loader,
            resolver,
            transform: self.transform,
            seg_transform: self.seg_transform,
            seeds,
        })
    }
}

impl PairedVolumeDataset {
    /// Dataset over `entries` with the given configuration.
    pub fn new(entries: Vec<SubjectEntry>, config: DatasetConfig) -> Result<Self> {
        Self::builder(entries).config(config).build()
    }

    /// Dataset over every subject of a manifest.
    pub fn from_manifest(manifest: Manifest, config: DatasetConfig) -> Result<Self> {
        Self::new(manifest.subjects, config)
    }

    pub fn builder(entries: Vec<SubjectEntry>) -> DatasetBuilder {
        DatasetBuilder {
            entries,
            config: DatasetConfig::default(),
            labels: None,
            seg_files: None,
            transform: None,
            seg_transform: None,
            seed_source: None,
        }
    }

    /// Builder over parallel lists of sequence paths, one triple per subject.
    pub fn from_image_files<P: Into<PathBuf>>(images: Vec<[P; NUM_SEQUENCES]>) -> DatasetBuilder {
        Self::builder(images.into_iter().map(SubjectEntry::new).collect())
    }

    pub fn entries(&self) -> &[SubjectEntry] {
        &self.entries
    }

    pub fn resolver(&self) -> &Arc<MetadataResolver> {
        &self.resolver
    }

    /// Shared handle to the seed source.
    pub fn seed_source(&self) -> &Arc<dyn SeedSource> {
        &self.seeds
    }

    fn build_sample(&self, entry: &SubjectEntry, seed: u64) -> Result<Sample> {
        let scans = entry
            .images
            .par_iter()
            .map(|path| self.loader.load_scan(path))
            .collect::<Result<Vec<Scan>>>()?;

        let spatial = &scans[0].image.shape()[2..];
        for (scan, path) in scans.iter().zip(&entry.images).skip(1) {
            if &scan.image.shape()[2..] != spatial {
                return Err(Error::ShapeMismatch(format!(
                    "{} has shape {:?}, expected {:?} like {}",
                    path.display(),
                    &scan.image.shape()[2..],
                    spatial,
                    entry.images[0].display()
                )));
            }
        }
        let views: Vec<ArrayView5<'_, f32>> = scans.iter().map(|s| s.image.view()).collect();
        let image = ndarray::concatenate(Axis(1), &views)
            .map_err(|e| Error::ShapeMismatch(format!("cannot stack sequences: {e}")))?;

        let mut record = RawRecord::from_tags(&scans[0].tags);
        if let Some(overrides) = &entry.metadata {
            record.overlay(overrides);
        }
        let metadata = self.resolver.resolve(&record);

        let segmentation = match &entry.segmentation {
            Some(path) => {
                let mask = self.loader.load_mask(path)?;
                if mask.shape()[2..] != image.shape()[2..] {
                    return Err(Error::ShapeMismatch(format!(
                        "mask {} has shape {:?}, image has {:?}",
                        path.display(),
                        &mask.shape()[2..],
                        &image.shape()[2..]
                    )));
                }
                Some(mask)
            }
            None => None,
        };

        let image = match &self.transform {
            Some(t) => t.apply(image, seed)?,
            None => image,
        };
        let segmentation = match (&self.seg_transform, segmentation) {
            (Some(t), Some(mask)) => Some(t.apply(mask, seed)?),
            (_, mask) => mask,
        };

        Ok(Sample {
            image,
            metadata,
            segmentation,
            label: entry.label,
            seed,
        })
    }
}

impl SampleSource for PairedVolumeDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })?;
        let seed = self.seeds.next_seed();
        tracing::debug!(index, seed, "building sample");

        self.build_sample(entry, seed).map_err(|source| Error::Sample {
            index,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::seed::ScriptedSeeds;
    use crate::transforms::from_fn;
    use crate::volume::{metaimage, DataType, Volume};
    use ndarray::Array3;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn write_volume(dir: &Path, name: &str, offset: f32) -> PathBuf {
        let path = dir.join(name);
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| offset + (z * 12 + y * 4 + x) as f32);
        let volume = Volume::new(data)
            .with_tag("PSA_REPORT", "10.0")
            .with_tag("PROSTATE_VOLUME_REPORT", "50");
        metaimage::save(&volume, &path, DataType::Float32, false).unwrap();
        path
    }

    fn fixture(subjects: usize) -> (TempDir, Vec<SubjectEntry>) {
        let dir = tempdir().unwrap();
        let entries = (0..subjects)
            .map(|i| {
                SubjectEntry::new([
                    write_volume(dir.path(), &format!("{i}_t2w.mha"), 0.0),
                    write_volume(dir.path(), &format!("{i}_adc.mha"), 100.0),
                    write_volume(dir.path(), &format!("{i}_hbv.mha"), 1000.0),
                ])
            })
            .collect();
        (dir, entries)
    }

    #[test]
    fn test_sample_has_three_channels() {
        let (_dir, entries) = fixture(2);
        let dataset = PairedVolumeDataset::new(entries, DatasetConfig::default().seed(1)).unwrap();
        assert_eq!(dataset.len(), 2);

        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.image.shape(), &[1, 3, 2, 3, 4]);
        assert_eq!(sample.metadata.len(), 4);
        assert!(sample.segmentation.is_none());
        assert!(sample.label.is_none());
    }

    #[test]
    fn test_metadata_from_tags_and_manifest_override() {
        let (_dir, mut entries) = fixture(1);
        let dataset = PairedVolumeDataset::new(entries.clone(), DatasetConfig::default()).unwrap();
        let from_tags = dataset.get(0).unwrap().metadata;
        // density = 10 / 50 = 0.2
        assert!((from_tags[1] - -3.3106).abs() < 1e-3);

        entries[0].metadata = Some(RawRecord::new().with("PSAD_REPORT", 0.15));
        let dataset = PairedVolumeDataset::new(entries, DatasetConfig::default()).unwrap();
        let overridden = dataset.get(0).unwrap().metadata;
        let want = ((0.15f64.ln_1p() - 2.300051) / 0.639685) as f32;
        assert_eq!(overridden[1], want);
    }

    #[test]
    fn test_count_mismatch_fails_at_construction() {
        let (_dir, entries) = fixture(5);
        let seg: Vec<PathBuf> = entries.iter().take(4).map(|e| e.images[0].clone()).collect();
        let err = PairedVolumeDataset::builder(entries.clone())
            .seg_files(seg)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = PairedVolumeDataset::builder(entries)
            .labels(vec![1.0; 3])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_index_out_of_range() {
        let (_dir, entries) = fixture(1);
        let dataset = PairedVolumeDataset::new(entries, DatasetConfig::default()).unwrap();
        let err = dataset.get(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Index);
    }

    #[test]
    fn test_repeated_get_draws_new_seeds() {
        let (_dir, entries) = fixture(1);
        let dataset = PairedVolumeDataset::builder(entries)
            .seed_source(Arc::new(ScriptedSeeds::new(vec![11, 22])))
            .build()
            .unwrap();
        assert_eq!(dataset.get(0).unwrap().seed, 11);
        assert_eq!(dataset.get(0).unwrap().seed, 22);
    }

    #[test]
    fn test_image_and_mask_share_seed() {
        let (dir, entries) = fixture(1);
        let seg = write_volume(dir.path(), "seg.mha", 0.0);
        let dataset = PairedVolumeDataset::builder(entries)
            .seg_files(vec![seg])
            .labels(vec![1.0])
            .transform(from_fn(|v: Array5<f32>, seed| Ok(v.mapv(|_| seed as f32))))
            .seg_transform(from_fn(|v: Array5<i8>, seed| Ok(v.mapv(|_| seed as i8))))
            .seed_source(Arc::new(ScriptedSeeds::new(vec![7])))
            .build()
            .unwrap();

        let sample = dataset.get(0).unwrap();
        assert!(sample.image.iter().all(|&v| v == 7.0));
        assert!(sample.segmentation.unwrap().iter().all(|&v| v == 7));
        assert_eq!(sample.label, Some(1.0));
    }

    #[test]
    fn test_missing_file_names_index_and_path() {
        let (dir, mut entries) = fixture(1);
        entries[0].images[2] = dir.path().join("missing_hbv.mha");
        let dataset = PairedVolumeDataset::new(entries, DatasetConfig::default()).unwrap();
        let err = dataset.get(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileIo);
        let message = err.to_string();
        assert!(message.contains("sample 0"));
        assert!(message.contains("missing_hbv.mha"));
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let (dir, entries) = fixture(1);
        let seg = dir.path().join("small_seg.mha");
        metaimage::save(&Volume::new(Array3::zeros((1, 3, 4))), &seg, DataType::UInt8, false).unwrap();
        let dataset = PairedVolumeDataset::builder(entries).seg_files(vec![seg]).build().unwrap();
        let err = dataset.get(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
    }
}
