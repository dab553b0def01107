//! Clinical metadata extraction, imputation and normalization.
//!
//! Raw per-subject fields go through four stages, always in this order:
//!
//! 1. **extract**: parse each declared field into a present/absent value
//! 2. **impute**: derive one missing field among PSA density, PSA and prostate
//!    volume from the other two (`density = psa / volume`), then fill anything
//!    still missing with the population median
//! 3. **log transform**: `ln(1 + x)` on the three PSA-related fields
//! 4. **standardize**: `(x - mean) / std` on every field
//!
//! The population statistics are fixed at construction. Means and standard
//! deviations describe the training cohort *after* imputation and the log
//! transform.

use crate::error::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PSA density field name.
pub const PSA_DENSITY: &str = "PSAD_REPORT";
/// PSA value field name.
pub const PSA_VALUE: &str = "PSA_REPORT";
/// Prostate volume field name.
pub const PROSTATE_VOLUME: &str = "PROSTATE_VOLUME_REPORT";
/// DICOM patient age tag, stored as a banded code like `066Y`.
pub const PATIENT_AGE: &str = "0010|1010";

/// How a raw field value is coerced to a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldParser {
    /// Parse the whole value as a floating point number.
    #[default]
    Numeric,
    /// Parse only the first `prefix_len` characters as an integer.
    Banded {
        /// Number of leading characters holding the number.
        prefix_len: usize,
    },
}

/// One declared metadata field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Tag name as stored in the image file or manifest.
    pub name: String,
    /// Coercion rule.
    #[serde(default)]
    pub parser: FieldParser,
}

impl FieldSpec {
    /// A plain numeric field.
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parser: FieldParser::Numeric,
        }
    }

    /// A banded integer code read from the first `prefix_len` characters.
    pub fn banded(name: impl Into<String>, prefix_len: usize) -> Self {
        Self {
            name: name.into(),
            parser: FieldParser::Banded { prefix_len },
        }
    }
}

/// A raw field value before coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Already numeric (manifest JSON).
    Number(f64),
    /// Text as found in an image header.
    Text(String),
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Raw clinical fields of one subject. `None` marks a field explicitly
/// recorded as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: BTreeMap<String, Option<RawValue>>,
}

impl RawRecord {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from image header tags.
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Self {
        Self {
            fields: tags
                .iter()
                .map(|(k, v)| (k.clone(), Some(RawValue::Text(v.clone()))))
                .collect(),
        }
    }

    /// Set a field, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    /// Mark a field as explicitly absent, builder style.
    #[must_use]
    pub fn with_missing(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), None);
        self
    }

    /// Raw value of a field, if present.
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.fields.get(name).and_then(Option::as_ref)
    }

    /// Overwrite this record's entries with those of `other`, including
    /// explicit absences.
    pub fn overlay(&mut self, other: &RawRecord) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// Number of entries, absent ones included.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record has no entries.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Result of coercing one raw field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A usable finite number.
    Present(f64),
    /// Not recorded.
    Absent,
    /// Recorded but not a usable number.
    Invalid(String),
}

impl FieldValue {
    /// The number, if present.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Present(v) => Some(*v),
            Self::Absent | Self::Invalid(_) => None,
        }
    }
}

/// Coerce a raw value according to `parser`.
pub fn parse_field(raw: Option<&RawValue>, parser: FieldParser) -> FieldValue {
    let Some(raw) = raw else {
        return FieldValue::Absent;
    };
    let parsed = match (raw, parser) {
        (RawValue::Number(v), _) => Some(*v),
        (RawValue::Text(text), FieldParser::Numeric) => text.trim().parse::<f64>().ok(),
        (RawValue::Text(text), FieldParser::Banded { prefix_len }) => {
            let prefix: String = text.chars().take(prefix_len).collect();
            prefix.trim().parse::<i64>().ok().map(|v| v as f64)
        }
    };
    match parsed {
        Some(v) if v.is_finite() => FieldValue::Present(v),
        _ => FieldValue::Invalid(match raw {
            RawValue::Number(v) => v.to_string(),
            RawValue::Text(t) => t.clone(),
        }),
    }
}

/// Population statistics, parallel to the declared field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    /// Imputation fallback per field.
    pub medians: Vec<f64>,
    /// Mean per field after imputation and log transform.
    pub means: Vec<f64>,
    /// Standard deviation per field after imputation and log transform.
    pub stds: Vec<f64>,
}

/// Declared fields plus their population statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Fields in output order.
    pub fields: Vec<FieldSpec>,
    /// Statistics in the same order as `fields`.
    pub stats: PopulationStats,
}

impl Default for MetadataConfig {
    /// Patient age, PSA density, PSA and prostate volume with the statistics
    /// of the training cohort.
    fn default() -> Self {
        Self {
            fields: vec![
                FieldSpec::banded(PATIENT_AGE, 3),
                FieldSpec::numeric(PSA_DENSITY),
                FieldSpec::numeric(PSA_VALUE),
                FieldSpec::numeric(PROSTATE_VOLUME),
            ],
            stats: PopulationStats {
                medians: vec![66.0, 8.5, 0.15, 57.0],
                means: vec![65.595333, 2.300051, 0.184540, 4.059110],
                stds: vec![7.191527, 0.639685, 0.187901, 0.512711],
            },
        }
    }
}

/// Turns raw clinical fields into a fixed-order normalized feature vector.
///
/// Stateless after construction; safe to share between threads.
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    fields: Vec<FieldSpec>,
    stats: PopulationStats,
    density: usize,
    value: usize,
    volume: usize,
}

impl MetadataResolver {
    /// Validate the configuration and build a resolver.
    pub fn new(config: MetadataConfig) -> Result<Self> {
        let MetadataConfig { fields, stats } = config;
        let n = fields.len();

        for (name, len) in [
            ("medians", stats.medians.len()),
            ("means", stats.means.len()),
            ("stds", stats.stds.len()),
        ] {
            if len != n {
                return Err(Error::Configuration(format!(
                    "{} has {} entries but {} metadata fields are declared",
                    name, len, n
                )));
            }
        }

        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::Configuration(format!(
                    "metadata field {} is declared twice",
                    field.name
                )));
            }
            let std = stats.stds[i];
            if !std.is_finite() || std <= 0.0 {
                return Err(Error::Configuration(format!(
                    "standard deviation for {} must be finite and positive, got {}",
                    field.name, std
                )));
            }
            if !stats.medians[i].is_finite() || !stats.means[i].is_finite() {
                return Err(Error::Configuration(format!(
                    "median and mean for {} must be finite",
                    field.name
                )));
            }
        }

        let index_of = |name: &str| {
            fields.iter().position(|f| f.name == name).ok_or_else(|| {
                Error::Configuration(format!(
                    "metadata field {} must be declared for PSA imputation",
                    name
                ))
            })
        };
        let density = index_of(PSA_DENSITY)?;
        let value = index_of(PSA_VALUE)?;
        let volume = index_of(PROSTATE_VOLUME)?;

        Ok(Self {
            fields,
            stats,
            density,
            value,
            volume,
        })
    }

    /// Declared fields in output order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Population statistics in use.
    pub fn stats(&self) -> &PopulationStats {
        &self.stats
    }

    /// Length of the output vector.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if no fields are declared (never, given the PSA requirement).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Stage 1: coerce every declared field, `None` where missing.
    pub fn extract(&self, record: &RawRecord) -> Vec<Option<f64>> {
        self.fields
            .iter()
            .map(|field| match parse_field(record.get(&field.name), field.parser) {
                FieldValue::Present(v) => Some(v),
                FieldValue::Absent => None,
                FieldValue::Invalid(raw) => {
                    tracing::trace!(field = %field.name, raw = %raw, "metadata value is not numeric");
                    None
                }
            })
            .collect()
    }

    /// Stage 2: relational imputation of the PSA triple, then medians.
    ///
    /// # Panics
    ///
    /// If `values` is shorter than the declared field list; pass the output
    /// of [`extract`](Self::extract).
    pub fn impute(&self, mut values: Vec<Option<f64>>) -> Vec<f64> {
        let (d, p, v) = (self.density, self.value, self.volume);

        if values[d].is_none() {
            if let (Some(psa), Some(vol)) = (values[p], values[v]) {
                if vol != 0.0 {
                    values[d] = Some(psa / vol);
                    tracing::trace!(field = PSA_DENSITY, "derived from PSA and volume");
                }
            }
        }
        if values[p].is_none() {
            if let (Some(dens), Some(vol)) = (values[d], values[v]) {
                values[p] = Some(dens * vol);
                tracing::trace!(field = PSA_VALUE, "derived from density and volume");
            }
        }
        if values[v].is_none() {
            if let (Some(psa), Some(dens)) = (values[p], values[d]) {
                if dens != 0.0 {
                    values[v] = Some(psa / dens);
                    tracing::trace!(field = PROSTATE_VOLUME, "derived from PSA and density");
                }
            }
        }

        values
            .into_iter()
            .zip(&self.stats.medians)
            .map(|(value, &median)| value.unwrap_or(median))
            .collect()
    }

    /// Stage 3: `ln(1 + x)` on the PSA triple.
    pub fn log_transform(&self, values: &mut [f64]) {
        for i in [self.density, self.value, self.volume] {
            values[i] = values[i].ln_1p();
        }
    }

    /// Stage 4: z-score every field with the population statistics.
    pub fn standardize(&self, values: &mut [f64]) {
        for ((x, &mean), &std) in values
            .iter_mut()
            .zip(&self.stats.means)
            .zip(&self.stats.stds)
        {
            *x = (*x - mean) / std;
        }
    }

    /// Run all four stages.
    pub fn resolve(&self, record: &RawRecord) -> Array1<f32> {
        let mut values = self.impute(self.extract(record));
        self.log_transform(&mut values);
        self.standardize(&mut values);
        values.into_iter().map(|v| v as f32).collect()
    }
}
