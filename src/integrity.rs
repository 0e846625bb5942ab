//! Integrity proofs for evidence records.
//!
//! Two SHA-256 digests are computed:
//!
//! - `hash_raw` over the raw snapshot bytes exactly as captured;
//! - `hash_structured` over the canonical JSON of the `structured` section
//!   (object keys sorted recursively, no whitespace).
//!
//! Custody metadata sits next to the proof but is not covered by it.
//! Verification recomputes both digests from the stored record; any
//! difference is a hard failure.

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::assemble::validate_structured;
use crate::error::HarvestError;
use crate::models::{
    CollectorInfo, Collection, Custody, EnvironmentInfo, EvidenceRecord, ExtractionParameters,
    IntegrityProof, PlatformInfo, SourceInfo, StorageInfo, StructuredData, FORMAT_VERSION,
};

pub const HASH_ALGORITHM: &str = "SHA-256";

/// Current UTC time, RFC 3339 with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Deterministic encoding: keys sorted at every level, compact separators.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// Canonical encoding of a structured section.
pub fn canonical_structured(structured: &StructuredData) -> Result<String> {
    canonical_json(&serde_json::to_value(structured)?)
}

pub fn compute_proof(raw_snapshot: &str, structured: &StructuredData) -> Result<IntegrityProof> {
    Ok(IntegrityProof {
        hash_raw: sha256_hex(raw_snapshot.as_bytes()),
        hash_structured: sha256_hex(canonical_structured(structured)?.as_bytes()),
        algorithm: HASH_ALGORITHM.to_string(),
        computed_at: timestamp_now(),
    })
}

/// Everything needed to package a record besides the content itself.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub platform: PlatformInfo,
    pub source: SourceInfo,
    pub extraction: ExtractionParameters,
    /// Where the record is going to be stored.
    pub location: String,
}

fn environment() -> EnvironmentInfo {
    EnvironmentInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
    }
}

/// Hash and package a raw snapshot and its structured derivation.
pub fn build_record(
    raw_snapshot: String,
    structured: StructuredData,
    provenance: Provenance,
) -> Result<EvidenceRecord> {
    validate_structured(&structured)?;
    let integrity = compute_proof(&raw_snapshot, &structured)?;
    let now = timestamp_now();

    Ok(EvidenceRecord {
        id: uuid::Uuid::new_v4().to_string(),
        format_version: FORMAT_VERSION.to_string(),
        platform: provenance.platform,
        exported_at: now.clone(),
        raw_snapshot,
        structured,
        integrity,
        custody: Custody {
            collection: Collection {
                timestamp: now,
                collector: CollectorInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                source: provenance.source,
                environment: environment(),
                extraction_parameters: provenance.extraction,
            },
            storage: StorageInfo {
                location: provenance.location,
                format: "json".to_string(),
                compression: "none".to_string(),
            },
        },
    })
}

/// Recompute both digests and check the structured invariants. Returns the
/// first failure.
pub fn verify_record(record: &EvidenceRecord) -> Result<(), HarvestError> {
    match VerificationReport::for_record(record).failures.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Every check run against one record.
#[derive(Debug)]
pub struct VerificationReport {
    pub record_id: String,
    pub failures: Vec<HarvestError>,
}

impl VerificationReport {
    pub fn for_record(record: &EvidenceRecord) -> Self {
        let mut failures = Vec::new();
        let proof = &record.integrity;

        if proof.algorithm != HASH_ALGORITHM {
            failures.push(HarvestError::IntegrityMismatch {
                field: "algorithm".to_string(),
                stored: proof.algorithm.clone(),
                computed: HASH_ALGORITHM.to_string(),
            });
        }

        let raw = sha256_hex(record.raw_snapshot.as_bytes());
        if raw != proof.hash_raw {
            failures.push(HarvestError::IntegrityMismatch {
                field: "hash_raw".to_string(),
                stored: proof.hash_raw.clone(),
                computed: raw,
            });
        }

        match canonical_structured(&record.structured) {
            Ok(canonical) => {
                let structured = sha256_hex(canonical.as_bytes());
                if structured != proof.hash_structured {
                    failures.push(HarvestError::IntegrityMismatch {
                        field: "hash_structured".to_string(),
                        stored: proof.hash_structured.clone(),
                        computed: structured,
                    });
                }
            }
            Err(e) => failures.push(HarvestError::SchemaViolation(format!(
                "structured section cannot be serialized: {e}"
            ))),
        }

        if let Err(e) = validate_structured(&record.structured) {
            failures.push(e);
        }

        for failure in &failures {
            tracing::warn!(record = %record.id, error = %failure, "verification failed");
        }
        Self {
            record_id: record.id.clone(),
            failures,
        }
    }

    /// Parse a serialized record and verify it. Malformed input is reported
    /// as a schema violation.
    pub fn for_json(json: &str) -> Self {
        match serde_json::from_str::<EvidenceRecord>(json) {
            Ok(record) => Self::for_record(&record),
            Err(e) => Self {
                record_id: String::new(),
                failures: vec![HarvestError::SchemaViolation(format!(
                    "not an evidence record: {e}"
                ))],
            },
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}
