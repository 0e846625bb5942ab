//! Thinking-block diagnostics over a directory of evidence files.
//!
//! Gives a quick summary of how well thinking content was captured:
//! thinking coverage per exchange, thinking messages without stages,
//! responses that repeat a stage name of the same exchange (thinking text
//! leaking into the visible answer), and responses that read like thinking
//! in exchanges that have none. Used by `cev diagnose`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crate::models::{EvidenceRecord, MessageType};

/// Phrases that usually open a reasoning paragraph.
const THINKING_KEYWORDS: &[&str] = &[
    "I'm thinking",
    "I'm now thinking",
    "I'm focusing",
    "My current thinking",
    "Clarifying",
    "Analyzing",
    "Developing",
    "Crafting",
    "Simplifying",
    "I've been thinking",
    "I am thinking",
];

/// Issues shown per file in the human report.
const ISSUES_SHOWN: usize = 5;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileDiagnostics {
    pub file: String,
    pub exported_at: String,
    pub format_version: String,
    pub exchange_count: usize,
    pub message_count: usize,
    pub thinking_messages: usize,
    pub thinking_with_stages: usize,
    pub thinking_without_stages: usize,
    pub responses_with_thinking_text: usize,
    pub exchanges_with_thinking: usize,
    pub exchanges_without_thinking: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionBreakdown {
    pub total: usize,
    pub with_thinking: usize,
    pub with_duplicates: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticReport {
    pub files: Vec<FileDiagnostics>,
    pub by_version: BTreeMap<String, VersionBreakdown>,
    /// Files that could not be read as evidence records, with the reason.
    pub unreadable: Vec<(String, String)>,
}

impl DiagnosticReport {
    pub fn files_with_issues(&self) -> usize {
        self.files.iter().filter(|f| !f.issues.is_empty()).count()
    }
}

pub fn analyze_record(file: &str, record: &EvidenceRecord) -> FileDiagnostics {
    let mut stats = FileDiagnostics {
        file: file.to_string(),
        exported_at: record.exported_at.clone(),
        format_version: record.format_version.clone(),
        exchange_count: record.structured.exchange_count,
        message_count: record.structured.message_count,
        ..FileDiagnostics::default()
    };

    for (ex_idx, exchange) in record.structured.exchanges.iter().enumerate() {
        let mut has_thinking = false;
        let mut stage_names: Vec<&str> = Vec::new();

        for message in &exchange.messages {
            match message.message_type {
                MessageType::Thinking => {
                    stats.thinking_messages += 1;
                    has_thinking = true;
                    match message.stages.as_deref() {
                        Some(stages) if !stages.is_empty() => {
                            stats.thinking_with_stages += 1;
                            stage_names = stages.iter().map(|s| s.name.as_str()).collect();
                        }
                        _ => {
                            stats.thinking_without_stages += 1;
                            stats
                                .issues
                                .push(format!("Exchange {ex_idx}: thinking message has no stages"));
                        }
                    }
                }
                MessageType::AssistantResponse => {
                    let text = message.text.as_deref().unwrap_or("");
                    if !stage_names.is_empty() {
                        if stage_names.iter().any(|n| !n.is_empty() && text.contains(n)) {
                            stats.responses_with_thinking_text += 1;
                            stats.issues.push(format!(
                                "Exchange {ex_idx}: response repeats thinking stage text"
                            ));
                        }
                    } else if !has_thinking && THINKING_KEYWORDS.iter().any(|k| text.contains(k)) {
                        stats.issues.push(format!(
                            "Exchange {ex_idx}: response has thinking keywords but no thinking message"
                        ));
                    }
                }
                MessageType::UserInput => {}
            }
        }

        if has_thinking {
            stats.exchanges_with_thinking += 1;
        } else {
            stats.exchanges_without_thinking += 1;
        }
    }
    stats
}

/// Analyze every `*.json` file under `dir`, in path order.
pub fn diagnose_dir(dir: &Path) -> Result<DiagnosticReport> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();

    let mut report = DiagnosticReport::default();
    for path in paths {
        let name = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|s| Ok(serde_json::from_str::<EvidenceRecord>(&s)?));
        match parsed {
            Ok(record) => {
                let stats = analyze_record(&name, &record);
                let version = report.by_version.entry(stats.format_version.clone()).or_default();
                version.total += 1;
                if stats.thinking_messages > 0 {
                    version.with_thinking += 1;
                }
                if stats.responses_with_thinking_text > 0 {
                    version.with_duplicates += 1;
                }
                report.files.push(stats);
            }
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "skipping unreadable evidence file");
                report.unreadable.push((name, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Print the human-readable report to stdout.
pub fn print_report(dir: &Path, report: &DiagnosticReport) {
    println!("Thinking Block Diagnostics");
    println!("==========================");
    println!();
    println!("  Directory:         {}", dir.display());
    println!("  Files analyzed:    {}", report.files.len());
    println!("  Files with issues: {}", report.files_with_issues());
    if !report.unreadable.is_empty() {
        println!("  Unreadable:        {}", report.unreadable.len());
    }

    let no_thinking = report.files.iter().filter(|f| f.thinking_messages == 0).count();
    let duplicates = report
        .files
        .iter()
        .filter(|f| f.responses_with_thinking_text > 0)
        .count();
    let empty = report
        .files
        .iter()
        .filter(|f| f.thinking_without_stages > 0)
        .count();
    println!();
    println!("  No thinking blocks:     {}", no_thinking);
    println!("  Duplicate thinking:     {}", duplicates);
    println!("  Empty thinking stages:  {}", empty);

    if !report.by_version.is_empty() {
        println!();
        println!("  By format version:");
        println!(
            "  {:<12} {:>6} {:>14} {:>16}",
            "VERSION", "FILES", "WITH THINKING", "WITH DUPLICATES"
        );
        println!("  {}", "-".repeat(51));
        for (version, v) in &report.by_version {
            println!(
                "  {:<12} {:>6} {:>14} {:>16}",
                version, v.total, v.with_thinking, v.with_duplicates
            );
        }
    }

    let with_issues: Vec<_> = report.files.iter().filter(|f| !f.issues.is_empty()).collect();
    if !with_issues.is_empty() {
        println!();
        println!("  Files with issues:");
        for f in with_issues {
            println!();
            println!("  {} ({})", f.file, f.exported_at);
            println!(
                "    thinking: {}  with stages: {}  duplicate responses: {}",
                f.thinking_messages, f.thinking_with_stages, f.responses_with_thinking_text
            );
            for issue in f.issues.iter().take(ISSUES_SHOWN) {
                println!("    - {}", issue);
            }
            if f.issues.len() > ISSUES_SHOWN {
                println!("    ... and {} more", f.issues.len() - ISSUES_SHOWN);
            }
        }
    }

    for (file, reason) in &report.unreadable {
        println!();
        println!("  unreadable: {} ({})", file, reason);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::{assemble_exchanges, structure, CapturedExchange};
    use crate::integrity::{build_record, Provenance};
    use crate::models::{
        ExtractionParameters, PlatformInfo, RevealedContentMap, SourceInfo, ThinkingStage,
    };

    fn record(exchanges: Vec<(&str, Option<&str>, &str)>) -> EvidenceRecord {
        let mut revealed = RevealedContentMap::new();
        let captured = exchanges
            .iter()
            .enumerate()
            .map(|(i, (user, stage, response))| {
                if let Some(stage) = stage {
                    revealed.insert(
                        format!("id{i}"),
                        vec![ThinkingStage {
                            name: stage.to_string(),
                            text: "body".into(),
                        }],
                    );
                }
                CapturedExchange {
                    container_identity: format!("id{i}"),
                    user_variants: vec![user.to_string()],
                    response_variants: vec![response.to_string()],
                }
            })
            .collect::<Vec<_>>();
        let structured = structure(
            "x",
            "t",
            "u",
            assemble_exchanges(&captured, &revealed),
            "now",
        )
        .unwrap();
        build_record(
            "raw".into(),
            structured,
            Provenance {
                platform: PlatformInfo {
                    name: "gemini".into(),
                    version: "unknown".into(),
                    adapter_version: "1".into(),
                },
                source: SourceInfo {
                    item_id: "x".into(),
                    url: "u".into(),
                    platform: "gemini".into(),
                },
                extraction: ExtractionParameters {
                    strategy: "button".into(),
                    revealed_count: 1,
                    verified: true,
                },
                location: "x.json".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn detects_leaked_stage_names_and_keywords() {
        let r = record(vec![
            ("q0", Some("Weighing Options"), "Weighing Options: go with A."),
            ("q1", None, "Analyzing the request, the answer is B."),
            ("q2", Some("Checking"), "Plain answer."),
        ]);
        let stats = analyze_record("a.json", &r);
        assert_eq!(stats.thinking_messages, 2);
        assert_eq!(stats.thinking_with_stages, 2);
        assert_eq!(stats.responses_with_thinking_text, 1);
        assert_eq!(stats.exchanges_with_thinking, 2);
        assert_eq!(stats.exchanges_without_thinking, 1);
        assert_eq!(stats.issues.len(), 2);
        assert!(stats.issues[1].contains("Exchange 1"));
    }

    #[test]
    fn empty_stage_list_is_an_issue() {
        let mut r = record(vec![("q", Some("Stage"), "a")]);
        r.structured.exchanges[0].messages[1].stages = Some(vec![]);
        let stats = analyze_record("b.json", &r);
        assert_eq!(stats.thinking_without_stages, 1);
        assert_eq!(stats.issues.len(), 1);
    }

    #[test]
    fn directory_report_groups_by_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        let r = record(vec![("q", Some("Stage"), "a")]);
        std::fs::write(tmp.path().join("0000_x.json"), serde_json::to_string(&r).unwrap()).unwrap();
        std::fs::write(tmp.path().join("0001_y.json"), "not json").unwrap();

        let report = diagnose_dir(tmp.path()).unwrap();
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.unreadable.len(), 1);
        let v = &report.by_version["1.0"];
        assert_eq!(v.total, 1);
        assert_eq!(v.with_thinking, 1);
        assert_eq!(v.with_duplicates, 0);
    }
}
