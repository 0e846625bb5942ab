//! Error kinds raised by the extraction pipeline.
//!
//! Orchestration seams return `anyhow::Result`; the variants here are the
//! typed conditions callers match on (via `downcast_ref`) to decide whether an
//! item is persisted, skipped, or rejected.

use thiserror::Error;

/// One strategy attempt recorded by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub reason: String,
}

impl std::fmt::Display for StrategyAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn join_attempts(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum HarvestError {
    /// No strategy reached the verification threshold.
    #[error("no revelation strategy succeeded ({})", join_attempts(.attempts))]
    Revelation { attempts: Vec<StrategyAttempt> },

    /// A revealed block never grew past the minimum content size.
    #[error("block {identity} did not reach {min_chars} chars after {attempts} polls")]
    ExtractionTimeout {
        identity: String,
        attempts: u32,
        min_chars: usize,
    },

    /// Stage parsing found no structural boundaries; the raw text was kept as one stage.
    #[error("no stage boundaries in block {identity}; kept {chars} chars as a single stage")]
    ParseFallback { identity: String, chars: usize },

    #[error("identity mismatch: stored key {stored:?} vs lookup key {lookup:?}")]
    IdentityMismatch { stored: String, lookup: String },

    #[error("integrity mismatch on {field}: stored {stored}, computed {computed}")]
    IntegrityMismatch {
        field: String,
        stored: String,
        computed: String,
    },

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("orchestration fault: {0}")]
    OrchestrationFault(String),

    /// A node handle was used after the source recycled it.
    #[error("stale handle {handle} (generation {held}, source is at {current})")]
    StaleHandle { handle: u64, held: u64, current: u64 },
}

impl HarvestError {
    /// Short machine-friendly name of the kind, used in progress output.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Revelation { .. } => "revelation_error",
            HarvestError::ExtractionTimeout { .. } => "extraction_timeout",
            HarvestError::ParseFallback { .. } => "parse_fallback",
            HarvestError::IdentityMismatch { .. } => "identity_mismatch",
            HarvestError::IntegrityMismatch { .. } => "integrity_mismatch",
            HarvestError::SchemaViolation(_) => "schema_violation",
            HarvestError::OrchestrationFault(_) => "orchestration_fault",
            HarvestError::StaleHandle { .. } => "stale_handle",
        }
    }
}
