//! Subject manifests.
//!
//! Two JSON layouts are accepted. The native manifest lists subjects
//! explicitly:
//!
//! ```json
//! { "subjects": [
//!     { "images": ["t2w.mha", "adc.mha", "hbv.mha"],
//!       "segmentation": "lesion.nii.gz",
//!       "label": 1,
//!       "metadata": { "PSA_REPORT": 7.2, "PSAD_REPORT": null } }
//! ] }
//! ```
//!
//! The overview sheet layout stores parallel columns (`image_paths`,
//! `label_paths`, `case_label`) and is read with [`Manifest::from_overview`].
//!
//! Relative paths are resolved against the directory holding the JSON file.

use crate::error::{Error, Result};
use crate::metadata::RawRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of co-registered sequences per subject (T2W, ADC, HBV).
pub const NUM_SEQUENCES: usize = 3;

/// One subject: its three sequences and optional annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectEntry {
    /// Sequence paths in channel order.
    pub images: [PathBuf; NUM_SEQUENCES],
    /// Lesion segmentation mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<PathBuf>,
    /// Case-level label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<f32>,
    /// Clinical fields; these take precedence over tags in the image file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RawRecord>,
}

impl SubjectEntry {
    /// Entry with images only.
    pub fn new<P: Into<PathBuf>>(images: [P; NUM_SEQUENCES]) -> Self {
        Self {
            images: images.map(Into::into),
            segmentation: None,
            label: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_segmentation(mut self, path: impl Into<PathBuf>) -> Self {
        self.segmentation = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: f32) -> Self {
        self.label = Some(label);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, record: RawRecord) -> Self {
        self.metadata = Some(record);
        self
    }

    fn rebase(&mut self, base: &Path) {
        for image in &mut self.images {
            *image = rebase_path(base, image);
        }
        if let Some(seg) = &mut self.segmentation {
            *seg = rebase_path(base, seg);
        }
    }
}

fn rebase_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Ordered list of subjects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub subjects: Vec<SubjectEntry>,
}

#[derive(Debug, Deserialize)]
struct Overview {
    image_paths: Vec<Vec<PathBuf>>,
    #[serde(default)]
    label_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    case_label: Option<Vec<f32>>,
}

impl Manifest {
    pub fn new(subjects: Vec<SubjectEntry>) -> Self {
        Self { subjects }
    }

    /// Read a native manifest.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut manifest = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            manifest.rebase(base);
        }
        Ok(manifest)
    }

    /// Parse a native manifest; paths are kept as written.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read an overview sheet with parallel `image_paths`, `label_paths`
    /// and `case_label` columns.
    pub fn from_overview<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut manifest = Self::from_overview_str(&std::fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            manifest.rebase(base);
        }
        Ok(manifest)
    }

    /// Parse an overview sheet; paths are kept as written.
    pub fn from_overview_str(text: &str) -> Result<Self> {
        let overview: Overview = serde_json::from_str(text)?;
        let n = overview.image_paths.len();
        for (column, len) in [
            ("label_paths", overview.label_paths.as_ref().map(Vec::len)),
            ("case_label", overview.case_label.as_ref().map(Vec::len)),
        ] {
            if let Some(len) = len {
                if len != n {
                    return Err(Error::Configuration(format!(
                        "overview column {} has {} entries but image_paths has {}",
                        column, len, n
                    )));
                }
            }
        }

        let mut segmentations = overview.label_paths.map(Vec::into_iter);
        let mut labels = overview.case_label.map(Vec::into_iter);
        let subjects = overview
            .image_paths
            .into_iter()
            .enumerate()
            .map(|(i, images)| -> Result<SubjectEntry> {
                let images: [PathBuf; NUM_SEQUENCES] = images.try_into().map_err(|v: Vec<PathBuf>| {
                    Error::Configuration(format!(
                        "subject {} lists {} sequences, expected {}",
                        i,
                        v.len(),
                        NUM_SEQUENCES
                    ))
                })?;
                Ok(SubjectEntry {
                    images,
                    segmentation: segmentations.as_mut().and_then(Iterator::next),
                    label: labels.as_mut().and_then(Iterator::next),
                    metadata: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { subjects })
    }

    fn rebase(&mut self, base: &Path) {
        for subject in &mut self.subjects {
            subject.rebase(base);
        }
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Case labels, if every subject has one.
    pub fn labels(&self) -> Option<Vec<f32>> {
        self.subjects.iter().map(|s| s.label).collect()
    }
}

/// Loss weights for a binary case-level task, indexed by class.
///
/// The weight of each class is the relative frequency of the other class,
/// so the rarer class weighs more and the two weights sum to one.
pub fn class_weights(labels: &[f32]) -> Result<[f64; 2]> {
    if labels.is_empty() {
        return Err(Error::Configuration(
            "cannot derive class weights from an empty label list".into(),
        ));
    }
    let positives = labels.iter().filter(|&&l| l > 0.5).count() as f64;
    let total = labels.len() as f64;
    Ok([positives / total, (total - positives) / total])
}
