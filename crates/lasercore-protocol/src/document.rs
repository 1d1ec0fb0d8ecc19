//! Protocol file interchange.
//!
//! Protocols are stored as human-readable JSON or TOML documents. The field
//! names are part of the file format and do not change between releases;
//! `format_version` is bumped for incompatible layouts.
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "metadata": { "name": "demo", "author": "", "description": "" },
//!   "loop_count": 1,
//!   "safety_limits": { "max_power_watts": 5.0, ... },
//!   "lines": [
//!     { "actions": [ { "enabled": true, "action": { "kind": "dwell", "duration_s": 3.0 } } ] }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use lasercore_types::ValidationError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::LineBasedProtocol;
use crate::validation::ProtocolValidator;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse protocol document: {0}")]
    Parse(String),

    #[error("cannot serialise protocol document: {0}")]
    Serialize(String),

    #[error("unsupported format_version {found} (this build reads {FORMAT_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("unrecognised protocol file extension on {0} (expected .json or .toml)")]
    UnknownFormat(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Toml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(DocumentFormat::Json),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(DocumentFormat::Toml),
            _ => Err(DocumentError::UnknownFormat(path.display().to_string())),
        }
    }
}

/// On-disk envelope around a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolDocument {
    pub format_version: u32,
    #[serde(flatten)]
    pub protocol: LineBasedProtocol,
}

pub fn to_string(protocol: &LineBasedProtocol, format: DocumentFormat) -> Result<String, DocumentError> {
    let doc = ProtocolDocument {
        format_version: FORMAT_VERSION,
        protocol: protocol.clone(),
    };
    match format {
        DocumentFormat::Json => {
            serde_json::to_string_pretty(&doc).map_err(|e| DocumentError::Serialize(e.to_string()))
        }
        DocumentFormat::Toml => {
            toml::to_string_pretty(&doc).map_err(|e| DocumentError::Serialize(e.to_string()))
        }
    }
}

/// Parse a document. Does not validate.
pub fn from_str(raw: &str, format: DocumentFormat) -> Result<LineBasedProtocol, DocumentError> {
    let doc: ProtocolDocument = match format {
        DocumentFormat::Json => {
            serde_json::from_str(raw).map_err(|e| DocumentError::Parse(e.to_string()))?
        }
        DocumentFormat::Toml => toml::from_str(raw).map_err(|e| DocumentError::Parse(e.to_string()))?,
    };
    if doc.format_version != FORMAT_VERSION {
        return Err(DocumentError::UnsupportedVersion {
            found: doc.format_version,
        });
    }
    Ok(doc.protocol)
}

/// Validate, then write. Nothing is written when validation fails.
pub fn save(
    path: &Path,
    protocol: &LineBasedProtocol,
    validator: &ProtocolValidator,
) -> Result<(), DocumentError> {
    let format = DocumentFormat::from_path(path)?;
    validator.validate(protocol)?;
    let raw = to_string(protocol, format)?;
    fs::write(path, raw).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), protocol = protocol.name(), "protocol saved");
    Ok(())
}

/// Read, parse and validate.
pub fn load(path: &Path, validator: &ProtocolValidator) -> Result<LineBasedProtocol, DocumentError> {
    let format = DocumentFormat::from_path(path)?;
    let raw = fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let protocol = from_str(&raw, format)?;
    validator.validate(&protocol)?;
    Ok(protocol)
}

/// JSON Schema describing the document format.
pub fn json_schema() -> String {
    let schema = schemars::schema_for!(ProtocolDocument);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
