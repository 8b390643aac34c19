//! Artifact name codec for the instrument filename grammar
//!
//! Every input/output artifact the instrument produces or consumes is named
//! by seven hyphen-separated fields:
//!
//! `{prefix}-{position}-{captureDateTime}-pmon-{device}-{barcode}-{elemType}`
//!
//! An alternate long form carries more than seven fields; it is accepted when
//! field 0 is `polle` and field 3 is `pmon`. Any other shape is a format
//! error for that one artifact.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Literal marker carried in field 3 of every well-formed name.
pub const MARKER: &str = "pmon";

/// Prefix identifying the long-form name variant.
pub const LONG_PREFIX: &str = "polle";

/// Field positions within an artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathField {
    Prefix = 0,
    Position = 1,
    DateTime = 2,
    Marker = 3,
    Device = 4,
    Barcode = 5,
    ElemType = 6,
}

/// Element-type suffixes the instrument uses for region artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    /// Raw depth stack
    Stack,
    /// Synthesized (flattened) image
    Synth,
    /// Segmentation overlay image
    Seg,
}

impl ElemKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ElemKind::Stack => "tiff.tif",
            ElemKind::Synth => "tiffSYN.png",
            ElemKind::Seg => "tiffSEG.png",
        }
    }
}

/// Grid position of a region, decoded from the position field.
///
/// Coordinates are kept as the instrument's zero-padded strings; they are
/// reproduced verbatim in checkpoint and report names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPos {
    pub z: String,
    pub x: String,
    pub y: String,
}

impl RegionPos {
    /// Fallback position used when a name carries no parseable coordinates.
    pub fn unknown() -> Self {
        RegionPos {
            z: "01".to_string(),
            x: "01".to_string(),
            y: "01".to_string(),
        }
    }
}

/// A decoded artifact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    fields: Vec<String>,
}

impl ArtifactName {
    /// Decode an artifact name (a bare file name or a full path; only the
    /// final component is considered).
    ///
    /// Accepts exactly seven hyphen-separated fields, or more than seven when
    /// the `polle`/`pmon` long-form markers are present.
    pub fn decode(name: &str) -> Result<Self> {
        let tail = Path::new(name)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());

        let fields: Vec<String> = tail.split('-').map(str::to_string).collect();

        if fields.len() == 7
            || (fields.len() > 7 && fields[0] == LONG_PREFIX && fields[3] == MARKER)
        {
            Ok(ArtifactName { fields })
        } else {
            Err(Error::Format(tail))
        }
    }

    /// Re-encode the name; `encode(decode(n)) == n` for any accepted `n`.
    pub fn encode(&self) -> String {
        self.fields.join("-")
    }

    pub fn field(&self, field: PathField) -> &str {
        &self.fields[field as usize]
    }

    pub fn device(&self) -> &str {
        self.field(PathField::Device)
    }

    pub fn barcode(&self) -> &str {
        self.field(PathField::Barcode)
    }

    pub fn date_time(&self) -> &str {
        self.field(PathField::DateTime)
    }

    pub fn elem_type(&self) -> &str {
        self.field(PathField::ElemType)
    }

    /// Replace one field and re-encode.
    pub fn with_field(&self, field: PathField, value: &str) -> ArtifactName {
        let mut fields = self.fields.clone();
        fields[field as usize] = value.to_string();
        ArtifactName { fields }
    }

    /// Decode the position field into z/x/y grid coordinates.
    ///
    /// The instrument writes either `{tag}_{z}_{x}_{y}` or a bare
    /// `{z}_{x}_{y}`. Returns `None` for anything else; callers fall back to
    /// [`RegionPos::unknown`].
    pub fn position(&self) -> Option<RegionPos> {
        let tokens: Vec<&str> = self.field(PathField::Position).split('_').collect();
        match tokens.len() {
            3 => Some(RegionPos {
                z: tokens[0].to_string(),
                x: tokens[1].to_string(),
                y: tokens[2].to_string(),
            }),
            n if n >= 4 => Some(RegionPos {
                z: tokens[1].to_string(),
                x: tokens[2].to_string(),
                y: tokens[3].to_string(),
            }),
            _ => None,
        }
    }
}

/// Decode, replace one field, re-encode.
pub fn modify(name: &str, field: PathField, value: &str) -> Result<String> {
    Ok(ArtifactName::decode(name)?.with_field(field, value).encode())
}
