//! Library-level batch runs over fixture directories.

use std::fs;
use std::path::Path;

use convo_evidence::config::Config;
use convo_evidence::integrity::VerificationReport;
use convo_evidence::models::{EvidenceRecord, MessageType};
use convo_evidence::orchestrator::{ItemOutcome, Orchestrator};
use convo_evidence::progress::NoProgress;
use convo_evidence::replay::ReplayCatalog;
use convo_evidence::sink::DirectorySink;
use tempfile::TempDir;

fn write_fixture(dir: &Path, name: &str, identity: &str, stubborn: bool) {
    let turns: Vec<serde_json::Value> = (0..4)
        .map(|i| {
            serde_json::json!({
                "user": [format!("{identity} question {i}")],
                "responses": [format!("{identity} answer {i}")],
                "thinking": {
                    "fragments": [
                        {"text": "Weighing Options", "emphasis": "Weighing Options"},
                        {"text": format!("Comparing the routes for question {i}.")}
                    ],
                    "stubborn": stubborn,
                    "reveal_latency": 2
                }
            })
        })
        .collect();
    let doc = serde_json::json!({
        "identity": identity,
        "window": 150,
        "overscan": 50,
        "turns": turns
    });
    fs::write(dir.join(name), doc.to_string()).unwrap();
}

fn config(root: &Path) -> Config {
    let mut cfg = Config::minimal();
    cfg.source.fixtures = root.join("fixtures");
    cfg.output.dir = root.join("evidence");
    cfg.extraction.poll_attempts = 6;
    cfg.extraction.poll_interval_ms = 0;
    cfg.extraction.settle_ms = 0;
    cfg.extraction.small_step = 50;
    cfg.extraction.large_step = 150;
    cfg.batch.min_delay_ms = 0;
    cfg.batch.max_delay_ms = 0;
    cfg
}

async fn run_batch(cfg: &Config) -> convo_evidence::orchestrator::BatchSummary {
    let catalog = ReplayCatalog::new(cfg.source.clone(), cfg.selectors.clone());
    let sink = DirectorySink::new(&cfg.output.dir);
    let mut orchestrator = Orchestrator::new(cfg, Box::new(catalog), Box::new(sink)).unwrap();
    orchestrator.run(&NoProgress).await.unwrap()
}

#[tokio::test]
async fn mixed_directory_exports_what_it_can() {
    let tmp = TempDir::new().unwrap();
    let fixtures = tmp.path().join("fixtures");
    fs::create_dir_all(&fixtures).unwrap();
    write_fixture(&fixtures, "a_first.json", "c_x", false);
    fs::write(fixtures.join("b_broken.json"), "{ not json").unwrap();
    write_fixture(&fixtures, "c_again.json", "x", false);
    write_fixture(&fixtures, "d_locked.json", "c_locked", true);

    let cfg = config(tmp.path());
    let summary = run_batch(&cfg).await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.revelation_errors, 1);
    assert!(!summary.cancelled);

    assert!(matches!(
        &summary.outcomes[1],
        ItemOutcome::Failed { identity, .. } if identity == "b_broken"
    ));
    assert!(matches!(
        &summary.outcomes[2],
        ItemOutcome::Skipped { identity, sequence: 0 } if identity == "x"
    ));
    assert!(matches!(
        &summary.outcomes[3],
        ItemOutcome::Persisted { sequence: 1, revelation_error: true, .. }
    ));

    let mut names: Vec<String> = fs::read_dir(&cfg.output.dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["0000_x.json", "0001_locked.json"]);

    for name in &names {
        let json = fs::read_to_string(cfg.output.dir.join(name)).unwrap();
        let report = VerificationReport::for_json(&json);
        assert!(report.passed(), "{name}: {:?}", report.failures);
    }

    let first: EvidenceRecord =
        serde_json::from_str(&fs::read_to_string(cfg.output.dir.join("0000_x.json")).unwrap())
            .unwrap();
    assert_eq!(first.structured.item_id, "x");
    assert_eq!(first.structured.exchange_count, 4);
    assert_eq!(first.structured.message_count, 12);
    assert!(first.custody.collection.extraction_parameters.verified);
    for exchange in &first.structured.exchanges {
        let thinking = &exchange.messages[1];
        assert_eq!(thinking.message_type, MessageType::Thinking);
        let stages = thinking.stages.as_ref().unwrap();
        assert_eq!(stages[0].name, "Weighing Options");
    }

    let locked: EvidenceRecord = serde_json::from_str(
        &fs::read_to_string(cfg.output.dir.join("0001_locked.json")).unwrap(),
    )
    .unwrap();
    assert!(!locked.custody.collection.extraction_parameters.verified);
    assert!(locked
        .structured
        .exchanges
        .iter()
        .all(|e| e.messages.iter().all(|m| m.message_type != MessageType::Thinking)));
}

#[tokio::test]
async fn existing_evidence_is_never_overwritten() {
    let tmp = TempDir::new().unwrap();
    let fixtures = tmp.path().join("fixtures");
    fs::create_dir_all(&fixtures).unwrap();
    write_fixture(&fixtures, "a.json", "c_x", false);

    let cfg = config(tmp.path());
    fs::create_dir_all(&cfg.output.dir).unwrap();
    fs::write(cfg.output.dir.join("0000_x.json"), "earlier export").unwrap();

    let summary = run_batch(&cfg).await;
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        fs::read_to_string(cfg.output.dir.join("0000_x.json")).unwrap(),
        "earlier export"
    );
}
