//! Species threshold tables
//!
//! Each classifiable species carries a (dynamic) threshold triple:
//!
//! - `population_cap`: number of objects per species still affected by the
//!   dynamic threshold. A count above the cap exempts the species.
//! - `base_score`: minimum classification score. Below it an object is
//!   sorted out as `Undefined` at classification time. It is also the lower
//!   asymptote of the dynamic threshold curve.
//! - `ceiling_score`: upper asymptote of the dynamic threshold. When all
//!   objects of a species score at or above it, the dynamic threshold has no
//!   effect.
//!
//! The table is loaded once at start-up and shared read-only afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Threshold triple for one species.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeciesThreshold {
    pub population_cap: u32,
    pub base_score: f64,
    pub ceiling_score: f64,
}

/// One species known to the classifier, with localized names and threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesInfo {
    pub name_de: String,
    pub name_lat: String,
    pub name_en: String,
    pub sub_class: String,
    pub threshold: SpeciesThreshold,
}

impl SpeciesInfo {
    /// Synthetic record assigned to pollen fragments, which are never sent to
    /// the classifier.
    pub fn fragment() -> Self {
        SpeciesInfo {
            name_de: "Fragment".to_string(),
            name_lat: "Fragment".to_string(),
            name_en: "Fragment".to_string(),
            sub_class: String::new(),
            threshold: SpeciesThreshold {
                population_cap: 0,
                base_score: 0.0,
                ceiling_score: 0.0,
            },
        }
    }
}

/// Immutable species table keyed by the local (German) species name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeciesTable {
    entries: BTreeMap<String, SpeciesInfo>,
}

impl SpeciesTable {
    /// Parse the threshold configuration section.
    ///
    /// Keys have the shape `"{german},{latin},{english};{subClass}"`, values
    /// `"{populationCap};{baseScore};{ceilingScore}"`. Any malformed entry is
    /// a fatal configuration error.
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (key, value) in raw {
            let key_parts: Vec<&str> = key.split(';').collect();
            if key_parts.len() != 2 {
                tracing::error!(key = %key, "Wrong format in threshold table");
                return Err(Error::Config(format!(
                    "wrong threshold key format: {key}"
                )));
            }

            let names: Vec<&str> = key_parts[0].split(',').collect();
            if names.len() != 3 {
                tracing::error!(key = %key, "Wrong format in threshold table");
                return Err(Error::Config(format!(
                    "wrong threshold key format: {key}"
                )));
            }

            let values: Vec<&str> = value.split(';').collect();
            if values.len() != 3 {
                tracing::error!(value = %value, "Wrong format in threshold table");
                return Err(Error::Config(format!(
                    "wrong threshold value format: {value}"
                )));
            }

            let threshold = SpeciesThreshold {
                population_cap: values[0].trim().parse().map_err(|_| {
                    Error::Config(format!("threshold population cap not an integer: {value}"))
                })?,
                base_score: values[1].trim().parse().map_err(|_| {
                    Error::Config(format!("threshold base score not a number: {value}"))
                })?,
                ceiling_score: values[2].trim().parse().map_err(|_| {
                    Error::Config(format!("threshold ceiling score not a number: {value}"))
                })?,
            };

            let info = SpeciesInfo {
                name_de: names[0].trim().to_string(),
                name_lat: names[1].trim().to_string(),
                name_en: names[2].trim().to_string(),
                sub_class: key_parts[1].trim().to_string(),
                threshold,
            };

            entries.insert(info.name_de.clone(), info);
        }

        Ok(SpeciesTable { entries })
    }

    pub fn get(&self, name_de: &str) -> Option<&SpeciesInfo> {
        self.entries.get(name_de)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpeciesInfo> {
        self.entries.values()
    }
}
