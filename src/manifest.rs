//! The backup manifest: a canonical JSON record sufficient to reverse the
//! transform chain. Written last during backup, read first during restore,
//! never encrypted.

use crate::config::{CompressionType, IntegrityType};
use crate::error::Error;
use crate::schema::{EngineInfo, FeatureSet};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub tool_version: String,
    pub engine: EngineInfo,
    pub features: FeatureSet,
    pub multiple_files: bool,
    /// Ordered list of the transforms applied after extraction. Applying it
    /// in reverse takes stored bytes back to the raw artifacts.
    pub transforms: Vec<Transform>,
    /// Raw (pre-transform) artifact hashes.
    pub artifacts: Vec<ArtifactEntry>,
    /// Stored files with post-transform hashes; one entry per output file.
    pub outputs: Vec<OutputEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Transform {
    Compress {
        #[serde(rename = "type")]
        kind: CompressionType,
    },
    Encrypt {
        alg_id: u8,
        key_provider: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub name: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityEntry {
    #[serde(rename = "type")]
    pub kind: IntegrityType,
    pub value: String,
}

impl Manifest {
    /// Canonical serialization: UTF-8 JSON with sorted keys and no
    /// insignificant whitespace.
    pub fn canonical_json(&self) -> Result<String> {
        // Round-tripping through `Value` sorts object keys.
        let value = serde_json::to_value(self)?;
        Ok(value.to_string())
    }

    /// Canonical form with the integrity value blanked. The tag is computed
    /// over this form, then inserted, which breaks the cycle of the tag
    /// covering the manifest that records it.
    pub fn canonical_json_unsigned(&self) -> Result<String> {
        let mut unsigned = self.clone();
        if let Some(integrity) = &mut unsigned.integrity {
            integrity.value = String::new();
        }
        unsigned.canonical_json()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::ConfigInvalid(format!("invalid manifest: {}", e)))?;
        check_transform_formats(&value)?;
        serde_json::from_value(value)
            .map_err(|e| Error::ConfigInvalid(format!("invalid manifest: {}", e)))
    }

    pub fn compression(&self) -> Option<CompressionType> {
        self.transforms.iter().find_map(|t| match t {
            Transform::Compress { kind } => Some(*kind),
            _ => None,
        })
    }

    pub fn encryption(&self) -> Option<(u8, &str)> {
        self.transforms.iter().find_map(|t| match t {
            Transform::Encrypt {
                alg_id,
                key_provider,
            } => Some((*alg_id, key_provider.as_str())),
            _ => None,
        })
    }
}

/// A compress transform with a format this build cannot reverse must fail
/// as `CompressionFormatUnsupported`, not as a generic parse error, so the
/// declared formats are checked before typed deserialization.
fn check_transform_formats(value: &serde_json::Value) -> Result<()> {
    let Some(transforms) = value.get("transforms").and_then(|t| t.as_array()) else {
        return Ok(());
    };
    for transform in transforms {
        if transform.get("op").and_then(|op| op.as_str()) != Some("compress") {
            continue;
        }
        let kind = transform
            .get("type")
            .and_then(|k| k.as_str())
            .unwrap_or("");
        if !matches!(kind, "zip" | "tar") {
            return Err(Error::CompressionFormatUnsupported(kind.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            backup_id: Uuid::nil(),
            created_at: DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            tool_version: "0.1.0".into(),
            engine: EngineInfo {
                kind: "mysql".into(),
                version: "8.0.36".into(),
            },
            features: FeatureSet::default(),
            multiple_files: false,
            transforms: vec![
                Transform::Compress {
                    kind: CompressionType::Tar,
                },
                Transform::Encrypt {
                    alg_id: 1,
                    key_provider: "local".into(),
                },
            ],
            artifacts: vec![ArtifactEntry {
                name: "dump.sql".into(),
                sha256: "ab".repeat(32),
                size: 1024,
            }],
            outputs: vec![OutputEntry {
                name: "dump.backy".into(),
                sha256: "cd".repeat(32),
                size: 512,
            }],
            integrity: Some(IntegrityEntry {
                kind: IntegrityType::Hmac,
                value: "ef".repeat(32),
            }),
        }
    }

    #[test]
    fn canonical_form_sorts_keys_and_strips_whitespace() {
        let json = sample().canonical_json().unwrap();
        assert!(!json.contains('\n'));
        assert!(!json.contains(": "));
        // Top-level keys in sorted order.
        let artifacts = json.find("\"artifacts\"").unwrap();
        let backup_id = json.find("\"backup_id\"").unwrap();
        let transforms = json.find("\"transforms\"").unwrap();
        assert!(artifacts < backup_id);
        assert!(backup_id < transforms);
    }

    #[test]
    fn transform_chain_serializes_with_op_tags() {
        let json = sample().canonical_json().unwrap();
        assert!(json.contains(r#"{"op":"compress","type":"tar"}"#));
        assert!(json.contains(r#"{"alg_id":1,"key_provider":"local","op":"encrypt"}"#));
    }

    #[test]
    fn unsigned_form_blanks_only_the_tag() {
        let manifest = sample();
        let unsigned = manifest.canonical_json_unsigned().unwrap();
        assert!(unsigned.contains(r#""value":"""#));
        assert!(unsigned.contains(&"cd".repeat(32)));
        // The original manifest is untouched.
        assert_eq!(manifest.integrity.as_ref().unwrap().value, "ef".repeat(32));
    }

    #[test]
    fn round_trips_through_json() {
        let manifest = sample();
        let json = manifest.canonical_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(parsed.backup_id, manifest.backup_id);
        assert_eq!(parsed.transforms, manifest.transforms);
        assert_eq!(parsed.compression(), Some(CompressionType::Tar));
        assert_eq!(parsed.encryption(), Some((1, "local")));
    }

    #[test]
    fn created_at_is_rfc3339_utc() {
        let json = sample().canonical_json().unwrap();
        assert!(json.contains(r#""created_at":"2025-06-01T12:00:00Z""#));
    }

    #[test]
    fn garbage_manifest_is_config_invalid() {
        assert!(matches!(
            Manifest::from_json("{not json"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn unknown_compression_format_is_its_own_error() {
        let json = sample().canonical_json().unwrap();
        let doctored = json.replace(
            r#"{"op":"compress","type":"tar"}"#,
            r#"{"op":"compress","type":"rar"}"#,
        );
        assert_ne!(json, doctored);
        match Manifest::from_json(&doctored) {
            Err(Error::CompressionFormatUnsupported(kind)) => assert_eq!(kind, "rar"),
            other => panic!("expected CompressionFormatUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn missing_compression_format_is_unsupported_too() {
        let json = sample().canonical_json().unwrap();
        let doctored = json.replace(
            r#"{"op":"compress","type":"tar"}"#,
            r#"{"op":"compress"}"#,
        );
        assert!(matches!(
            Manifest::from_json(&doctored),
            Err(Error::CompressionFormatUnsupported(_))
        ));
    }

    #[test]
    fn known_formats_still_parse() {
        for kind in ["zip", "tar"] {
            let json = sample().canonical_json().unwrap().replace(
                r#"{"op":"compress","type":"tar"}"#,
                &format!(r#"{{"op":"compress","type":"{}"}}"#, kind),
            );
            Manifest::from_json(&json).unwrap();
        }
    }
}
