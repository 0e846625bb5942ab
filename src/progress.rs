//! Batch progress reporting.
//!
//! Reports observable progress during `cev run` so users see which item is
//! being processed, what happened to it, and how much is left. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::MachineState;

/// A single progress event for a batch run.
#[derive(Clone, Debug)]
pub enum BatchProgressEvent {
    /// Catalog enumerated; `total` items will be visited.
    Started { total: u64 },
    /// The orchestrator entered a new state for item `n`.
    State { n: u64, state: MachineState },
    /// Item persisted as `sequence`.
    Persisted {
        n: u64,
        total: u64,
        identity: String,
        sequence: usize,
        revealed: usize,
        revelation_error: bool,
    },
    /// Item already holds a sequence number in this run.
    Skipped { n: u64, identity: String },
    /// Item failed; the batch moves on.
    Failed {
        n: u64,
        identity: String,
        kind: String,
        message: String,
    },
    /// Waiting before the next item.
    Pacing { delay_ms: u64 },
    Finished {
        succeeded: u64,
        skipped: u64,
        failed: u64,
        cancelled: bool,
    },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait BatchProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly progress on stderr: "run  3 / 1,204  persisted 0002_abc123".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Started { total } => {
                format!("run  {} items\n", format_number(*total))
            }
            // State changes are in the debug log; too chatty for a terminal.
            BatchProgressEvent::State { .. } | BatchProgressEvent::Pacing { .. } => return,
            BatchProgressEvent::Persisted {
                n,
                total,
                identity,
                sequence,
                revealed,
                revelation_error,
            } => format!(
                "run  {} / {}  persisted {:04}_{}  ({} thinking blocks{})\n",
                format_number(*n),
                format_number(*total),
                sequence,
                identity,
                revealed,
                if *revelation_error {
                    ", revelation incomplete"
                } else {
                    ""
                }
            ),
            BatchProgressEvent::Skipped { n, identity } => {
                format!("run  {}  skipped {} (already exported)\n", format_number(*n), identity)
            }
            BatchProgressEvent::Failed {
                n,
                identity,
                kind,
                message,
            } => format!(
                "run  {}  FAILED {} [{}]: {}\n",
                format_number(*n),
                identity,
                kind,
                message
            ),
            BatchProgressEvent::Finished {
                succeeded,
                skipped,
                failed,
                cancelled,
            } => format!(
                "run  done{}  {} succeeded, {} skipped, {} failed\n",
                if *cancelled { " (cancelled)" } else { "" },
                format_number(*succeeded),
                format_number(*skipped),
                format_number(*failed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = match &event {
            BatchProgressEvent::Started { total } => serde_json::json!({
                "event": "started",
                "total": total
            }),
            BatchProgressEvent::State { n, state } => serde_json::json!({
                "event": "state",
                "n": n,
                "state": state
            }),
            BatchProgressEvent::Persisted {
                n,
                total,
                identity,
                sequence,
                revealed,
                revelation_error,
            } => serde_json::json!({
                "event": "persisted",
                "n": n,
                "total": total,
                "identity": identity,
                "sequence": sequence,
                "revealed": revealed,
                "revelation_error": revelation_error
            }),
            BatchProgressEvent::Skipped { n, identity } => serde_json::json!({
                "event": "skipped",
                "n": n,
                "identity": identity
            }),
            BatchProgressEvent::Failed {
                n,
                identity,
                kind,
                message,
            } => serde_json::json!({
                "event": "failed",
                "n": n,
                "identity": identity,
                "kind": kind,
                "message": message
            }),
            BatchProgressEvent::Pacing { delay_ms } => serde_json::json!({
                "event": "pacing",
                "delay_ms": delay_ms
            }),
            BatchProgressEvent::Finished {
                succeeded,
                skipped,
                failed,
                cancelled,
            } => serde_json::json!({
                "event": "finished",
                "succeeded": succeeded,
                "skipped": skipped,
                "failed": failed,
                "cancelled": cancelled
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
