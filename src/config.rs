//! Dataset configuration.
//!
//! Everything defaults to the training cohort, so an empty JSON object is a
//! valid configuration:
//!
//! ```json
//! {
//!   "percentile": 99.5,
//!   "seed": 1234,
//!   "metadata": {
//!     "fields": [
//!       { "name": "PSAD_REPORT" },
//!       { "name": "PSA_REPORT", "parser": { "kind": "numeric" } },
//!       { "name": "PROSTATE_VOLUME_REPORT" }
//!     ],
//!     "stats": {
//!       "medians": [8.5, 0.15, 57],
//!       "means": [2.3, 0.18, 4.06],
//!       "stds": [0.64, 0.19, 0.51]
//!     }
//!   }
//! }
//! ```

use crate::error::Result;
use crate::metadata::{MetadataConfig, MetadataResolver};
use crate::scan::{ScanLoader, DEFAULT_PERCENTILE};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_percentile() -> Option<f32> {
    Some(DEFAULT_PERCENTILE)
}

/// Settings for [`PairedVolumeDataset`](crate::dataset::PairedVolumeDataset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Declared clinical fields and their population statistics.
    pub metadata: MetadataConfig,
    /// Upper clipping percentile for z-score normalization; `null` disables
    /// clipping.
    #[serde(default = "default_percentile")]
    pub percentile: Option<f32>,
    /// Base of the per-access seed sequence; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            metadata: MetadataConfig::default(),
            percentile: default_percentile(),
            seed: None,
        }
    }
}

impl DatasetConfig {
    /// Parse and validate a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the normalization percentile.
    #[must_use]
    pub fn percentile(mut self, percentile: Option<f32>) -> Self {
        self.percentile = percentile;
        self
    }

    /// Set the base seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the metadata fields and statistics.
    #[must_use]
    pub fn metadata(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check that the configuration can build a loader and a resolver.
    pub fn validate(&self) -> Result<()> {
        ScanLoader::new(self.percentile)?;
        MetadataResolver::new(self.metadata.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = DatasetConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DatasetConfig::default());
        assert_eq!(config.percentile, Some(99.5));
        assert_eq!(config.metadata.fields.len(), 4);
    }

    #[test]
    fn test_null_percentile_disables_clipping() {
        let config = DatasetConfig::from_json_str(r#"{"percentile": null, "seed": 7}"#).unwrap();
        assert_eq!(config.percentile, None);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_custom_metadata() {
        let json = r#"{
            "metadata": {
                "fields": [
                    {"name": "0010|1010", "parser": {"kind": "banded", "prefix_len": 3}},
                    {"name": "PSAD_REPORT"},
                    {"name": "PSA_REPORT"},
                    {"name": "PROSTATE_VOLUME_REPORT"}
                ],
                "stats": {
                    "medians": [60, 0.1, 5, 40],
                    "means": [60, 0.1, 1.5, 3.7],
                    "stds": [8, 0.1, 0.5, 0.4]
                }
            }
        }"#;
        let config = DatasetConfig::from_json_str(json).unwrap();
        assert_eq!(config.metadata.stats.medians[3], 40.0);
    }

    #[test]
    fn test_psa_fields_without_age() {
        let json = r#"{
            "percentile": 99.5,
            "seed": 1234,
            "metadata": {
                "fields": [
                    {"name": "PSAD_REPORT"},
                    {"name": "PSA_REPORT", "parser": {"kind": "numeric"}},
                    {"name": "PROSTATE_VOLUME_REPORT"}
                ],
                "stats": {
                    "medians": [8.5, 0.15, 57],
                    "means": [2.3, 0.18, 4.06],
                    "stds": [0.64, 0.19, 0.51]
                }
            }
        }"#;
        let config = DatasetConfig::from_json_str(json).unwrap();
        assert_eq!(config.metadata.fields.len(), 3);
        assert_eq!(config.seed, Some(1234));

        let psa_only = r#"{"metadata": {
            "fields": [{"name": "PSA_REPORT"}],
            "stats": {"medians": [8.5], "means": [2.3], "stds": [0.64]}
        }}"#;
        let err = DatasetConfig::from_json_str(psa_only).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = DatasetConfig::from_json_str(r#"{"percentile": 10}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = DatasetConfig::from_json_str(r#"{"percentile": "high"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, r#"{"seed": 99}"#).unwrap();
        let config = DatasetConfig::from_json_file(&path).unwrap();
        assert_eq!(config.seed, Some(99));
        assert!(DatasetConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
