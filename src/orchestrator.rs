//! Batch orchestration.
//!
//! One [`Orchestrator`] drives a whole batch through an explicit state
//! machine, one item at a time:
//!
//! ```text
//! Idle ─▶ Selecting ─▶ Revealing ─▶ Extracting ─▶ Persisting ─▶ Scheduling ─┐
//!            ▲  │            │             │             │          │        │
//!            │  ▼            └──────┬──────┴─────────────┘          │        │
//!            │ Paused               ▼                               │        │
//!            │                    Failed ───────────────────────────┘        │
//!            └───────────────────────(pacing delay elapses)──────────────────┘
//!   Selecting ─▶ Completed (catalog exhausted or cancelled)
//! ```
//!
//! The pacing delay between items is armed in exactly one place,
//! [`Orchestrator::schedule_next`], which is only legal in `Scheduling`, and
//! the [`PacingTimer`] refuses to be armed twice. All batch state lives in
//! [`BatchState`] and is only mutated here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::assemble::{assemble_exchanges, capture_document, structure};
use crate::config::{Config, PlatformConfig};
use crate::error::HarvestError;
use crate::extract::{SweepExtractor, SweepOutcome};
use crate::identity::IdentityNormalizer;
use crate::integrity::{build_record, timestamp_now, verify_record, Provenance};
use crate::models::{
    BatchState, ExtractionParameters, MachineState, PlatformInfo, SourceInfo, SourceItem,
    StructuredData,
};
use crate::progress::{BatchProgressEvent, BatchProgressReporter};
use crate::strategy::{RevelationFailure, Selection, StrategySelector};
use crate::traits::{CatalogTitle, ContentSource, EvidenceSink, ItemCatalog, TitleResolver};

const POLL_SLICE: Duration = Duration::from_millis(50);

// ═══════════════════════════════════════════════════════════════════════
// Control and pacing
// ═══════════════════════════════════════════════════════════════════════

/// Cooperative cancel/pause flags, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// The batch's only timer. At most one delay can be pending.
pub struct PacingTimer {
    min_ms: u64,
    max_ms: u64,
    rng: StdRng,
    pending: Option<Duration>,
}

impl PacingTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self::from_rng(min_ms, max_ms, StdRng::from_entropy())
    }

    pub fn with_seed(min_ms: u64, max_ms: u64, seed: u64) -> Self {
        Self::from_rng(min_ms, max_ms, StdRng::seed_from_u64(seed))
    }

    fn from_rng(min_ms: u64, max_ms: u64, rng: StdRng) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            rng,
            pending: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Pick a uniformly random delay in `[min, max]` and hold it until
    /// [`wait`](Self::wait) runs. Fails if a delay is already pending.
    pub fn arm(&mut self) -> Result<Duration, HarvestError> {
        if let Some(pending) = self.pending {
            return Err(HarvestError::OrchestrationFault(format!(
                "pacing timer already armed ({} ms pending)",
                pending.as_millis()
            )));
        }
        let ms = if self.min_ms == self.max_ms {
            self.min_ms
        } else {
            self.rng.gen_range(self.min_ms..=self.max_ms)
        };
        let delay = Duration::from_millis(ms);
        self.pending = Some(delay);
        Ok(delay)
    }

    /// Sleep out the pending delay, returning early on cancellation. Disarms.
    pub async fn wait(&mut self, control: &BatchControl) {
        let Some(delay) = self.pending else {
            return;
        };
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            if control.is_cancelled() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(POLL_SLICE)).await;
        }
        self.pending = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-item pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Result of the reveal phase for one item.
#[derive(Debug, Default)]
pub struct Revealed {
    /// The verified selection, or the best partial one after a failure.
    pub selection: Option<Selection>,
    /// Set when no strategy verified.
    pub failure: Option<HarvestError>,
}

impl Revealed {
    pub fn extraction_parameters(&self) -> ExtractionParameters {
        match &self.selection {
            Some(s) => ExtractionParameters {
                strategy: s.strategy.clone(),
                revealed_count: s.revealed_count(),
                verified: s.verified,
            },
            None => ExtractionParameters {
                strategy: "unresolved".to_string(),
                revealed_count: 0,
                verified: false,
            },
        }
    }
}

/// Reveal, extract and assemble for a single source. Stateless between
/// items; shared by the batch and by one-off inspection.
pub struct ItemPipeline {
    selector: StrategySelector,
    extractor: SweepExtractor,
}

impl ItemPipeline {
    pub fn new(selector: StrategySelector, extractor: SweepExtractor) -> Self {
        Self {
            selector,
            extractor,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            StrategySelector::from_config(&config.revelation)?,
            SweepExtractor::new(config.extraction.clone(), config.selectors.clone()),
        ))
    }

    /// Run the strategy chain. A [`RevelationFailure`] is not an error here:
    /// its partial selection is kept so the item can still be persisted.
    pub async fn reveal(&self, source: &dyn ContentSource) -> Result<Revealed> {
        match self.selector.select(source, &self.extractor).await {
            Ok(selection) => Ok(Revealed {
                selection: Some(selection),
                failure: None,
            }),
            Err(e) => match e.downcast::<RevelationFailure>() {
                Ok(failure) => Ok(Revealed {
                    selection: failure.partial,
                    failure: Some(failure.error),
                }),
                Err(e) => Err(e),
            },
        }
    }

    /// Capture the document and assemble the structured section.
    /// Returns the raw snapshot alongside it.
    pub async fn assemble(
        &self,
        source: &dyn ContentSource,
        revealed: &Revealed,
        item_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(String, StructuredData)> {
        let empty = SweepOutcome::default();
        let outcome = revealed
            .selection
            .as_ref()
            .map(|s| &s.outcome)
            .unwrap_or(&empty);
        let captured = capture_document(
            source,
            self.extractor.selectors(),
            self.extractor.config(),
            &outcome.markup,
        )
        .await?;
        let exchanges = assemble_exchanges(&captured.exchanges, &outcome.revealed);
        let structured = structure(item_id, title, url, exchanges, &timestamp_now())?;
        Ok((captured.raw_snapshot, structured))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

/// What happened to one catalog item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Persisted {
        identity: String,
        sequence: usize,
        location: String,
        /// Thinking blocks captured.
        revealed: usize,
        revelation_error: bool,
    },
    Skipped {
        identity: String,
        sequence: usize,
    },
    Failed {
        identity: String,
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Persisted items whose revelation chain did not verify.
    pub revelation_errors: usize,
    pub cancelled: bool,
    pub outcomes: Vec<ItemOutcome>,
}

/// An item as it would be processed, for `--dry-run`.
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub item: SourceItem,
    pub key: String,
    /// Position of an earlier item with the same normalized identity.
    pub duplicate_of: Option<usize>,
}

/// `{sequence:04}_{identity}.json`, with the identity reduced to a safe
/// file-name alphabet.
pub fn evidence_file_name(sequence: usize, key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = if safe.is_empty() { "item".to_string() } else { safe };
    format!("{:04}_{}.json", sequence, safe)
}

fn allowed(from: MachineState, to: MachineState) -> bool {
    use MachineState::*;
    matches!(
        (from, to),
        (Idle, Selecting)
            | (Selecting, Revealing)
            | (Selecting, Paused)
            | (Selecting, Failed)
            | (Selecting, Completed)
            | (Paused, Selecting)
            | (Revealing, Extracting)
            | (Extracting, Persisting)
            | (Persisting, Scheduling)
            | (Revealing | Extracting | Persisting, Failed)
            | (Revealing | Extracting | Persisting, Completed)
            | (Failed, Scheduling)
            | (Scheduling, Selecting)
    )
}

fn error_kind(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<HarvestError>() {
        return e.kind();
    }
    if err.downcast_ref::<RevelationFailure>().is_some() {
        return "revelation_error";
    }
    "orchestration_fault"
}

pub struct Orchestrator {
    catalog: Box<dyn ItemCatalog>,
    sink: Box<dyn EvidenceSink>,
    titles: Box<dyn TitleResolver>,
    pipeline: ItemPipeline,
    normalizer: IdentityNormalizer,
    platform: PlatformConfig,
    limit: usize,
    timer: PacingTimer,
    control: BatchControl,
    state: BatchState,
    next_sequence: usize,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        catalog: Box<dyn ItemCatalog>,
        sink: Box<dyn EvidenceSink>,
    ) -> Result<Self> {
        Ok(Self {
            catalog,
            sink,
            titles: Box::new(CatalogTitle),
            pipeline: ItemPipeline::from_config(config)?,
            normalizer: IdentityNormalizer::new(&config.batch.identity_prefixes),
            platform: config.platform.clone(),
            limit: config.batch.limit,
            timer: PacingTimer::new(config.batch.min_delay_ms, config.batch.max_delay_ms),
            control: BatchControl::new(),
            state: BatchState::default(),
            next_sequence: 0,
        })
    }

    pub fn with_titles(mut self, titles: Box<dyn TitleResolver>) -> Self {
        self.titles = titles;
        self
    }

    pub fn with_timer(mut self, timer: PacingTimer) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Shared handle for cancelling or pausing a running batch.
    pub fn control(&self) -> BatchControl {
        self.control.clone()
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    fn transition(&mut self, next: MachineState) -> Result<(), HarvestError> {
        let current = self.state.machine_state;
        if !allowed(current, next) {
            return Err(HarvestError::OrchestrationFault(format!(
                "illegal transition {current} -> {next}"
            )));
        }
        tracing::debug!(from = %current, to = %next, index = self.state.current_index, "transition");
        self.state.machine_state = next;
        Ok(())
    }

    fn enter(
        &mut self,
        next: MachineState,
        progress: &dyn BatchProgressReporter,
    ) -> Result<(), HarvestError> {
        self.transition(next)?;
        progress.report(BatchProgressEvent::State {
            n: self.state.current_index as u64 + 1,
            state: next,
        });
        Ok(())
    }

    async fn items(&self) -> Result<Vec<SourceItem>> {
        let mut items = self.catalog.items().await?;
        if self.limit > 0 {
            items.truncate(self.limit);
        }
        Ok(items)
    }

    /// List the items a run would visit, with their normalized identities.
    pub async fn plan(&self) -> Result<Vec<PlannedItem>> {
        let mut planned: Vec<PlannedItem> = Vec::new();
        for item in self.items().await? {
            let key = self.normalizer.normalize(&item.identity);
            let duplicate_of = planned.iter().position(|p| p.key == key);
            planned.push(PlannedItem {
                item,
                key,
                duplicate_of,
            });
        }
        Ok(planned)
    }

    /// The single scheduling point. Only legal in `Scheduling`.
    async fn schedule_next(&mut self, progress: &dyn BatchProgressReporter) -> Result<()> {
        if self.state.machine_state != MachineState::Scheduling {
            return Err(HarvestError::OrchestrationFault(format!(
                "schedule requested in state {}",
                self.state.machine_state
            ))
            .into());
        }
        let delay = self.timer.arm()?;
        tracing::debug!(delay_ms = delay.as_millis() as u64, "pacing delay");
        progress.report(BatchProgressEvent::Pacing {
            delay_ms: delay.as_millis() as u64,
        });
        self.timer.wait(&self.control).await;
        Ok(())
    }

    async fn wait_while_paused(&mut self, progress: &dyn BatchProgressReporter) -> Result<()> {
        if !self.control.is_paused() {
            return Ok(());
        }
        self.enter(MachineState::Paused, progress)?;
        tracing::info!("batch paused");
        while self.control.is_paused() && !self.control.is_cancelled() {
            tokio::time::sleep(POLL_SLICE).await;
        }
        self.enter(MachineState::Selecting, progress)?;
        tracing::info!("batch resumed");
        Ok(())
    }

    /// Process one item from `Selecting` through `Persisting`.
    ///
    /// Returns `None` when cancellation was observed between steps; nothing
    /// has been persisted in that case.
    async fn process_item(
        &mut self,
        item: &SourceItem,
        key: &str,
        progress: &dyn BatchProgressReporter,
    ) -> Result<Option<ItemOutcome>> {
        self.enter(MachineState::Revealing, progress)?;
        let source = self.catalog.open(item).await?;
        let revealed = self.pipeline.reveal(source.as_ref()).await?;
        if let Some(failure) = &revealed.failure {
            tracing::warn!(identity = %key, error = %failure, "revelation incomplete; keeping partial content");
        }
        if self.control.is_cancelled() {
            return Ok(None);
        }

        self.enter(MachineState::Extracting, progress)?;
        let title = self.titles.resolve(item).await;
        let (raw_snapshot, structured) = self
            .pipeline
            .assemble(source.as_ref(), &revealed, key, &title, &item.locator)
            .await?;
        drop(source);
        if self.control.is_cancelled() {
            return Ok(None);
        }

        self.enter(MachineState::Persisting, progress)?;
        let sequence = self.next_sequence;
        let name = evidence_file_name(sequence, key);
        let record = build_record(
            raw_snapshot,
            structured,
            Provenance {
                platform: PlatformInfo {
                    name: self.platform.name.clone(),
                    version: self.platform.version.clone(),
                    adapter_version: env!("CARGO_PKG_VERSION").to_string(),
                },
                source: SourceInfo {
                    item_id: key.to_string(),
                    url: item.locator.clone(),
                    platform: self.platform.name.clone(),
                },
                extraction: revealed.extraction_parameters(),
                location: name.clone(),
            },
        )?;
        // A record that fails its own proof is never written.
        verify_record(&record)?;
        let bytes = serde_json::to_vec_pretty(&record)?;
        let location = self.sink.write(&name, &bytes).await?;

        // The sequence is only consumed once the record is on disk.
        self.normalizer
            .store(&mut self.state.identity_to_sequence, &item.identity, sequence)?;
        self.next_sequence += 1;
        match self
            .normalizer
            .lookup(&self.state.identity_to_sequence, &item.identity)?
        {
            Some(found) if found == sequence => {}
            other => {
                return Err(HarvestError::OrchestrationFault(format!(
                    "identity {key:?} stored as {sequence} but reads back as {other:?}"
                ))
                .into())
            }
        }

        Ok(Some(ItemOutcome::Persisted {
            identity: key.to_string(),
            sequence,
            location,
            revealed: revealed
                .selection
                .as_ref()
                .map(Selection::revealed_count)
                .unwrap_or(0),
            revelation_error: revealed.failure.is_some(),
        }))
    }

    fn record_failure(
        &mut self,
        summary: &mut BatchSummary,
        key: &str,
        err: &anyhow::Error,
        progress: &dyn BatchProgressReporter,
    ) -> Result<()> {
        let kind = error_kind(err);
        tracing::error!(identity = %key, kind, error = %err, "item failed");
        self.enter(MachineState::Failed, progress)?;
        summary.failed += 1;
        progress.report(BatchProgressEvent::Failed {
            n: self.state.current_index as u64 + 1,
            identity: key.to_string(),
            kind: kind.to_string(),
            message: err.to_string(),
        });
        summary.outcomes.push(ItemOutcome::Failed {
            identity: key.to_string(),
            kind: kind.to_string(),
            message: err.to_string(),
        });
        Ok(())
    }

    /// Run the whole batch. Per-item errors are recorded in the summary;
    /// only catalog enumeration and state-machine faults end the run early.
    pub async fn run(&mut self, progress: &dyn BatchProgressReporter) -> Result<BatchSummary> {
        if self.state.machine_state != MachineState::Idle {
            return Err(HarvestError::OrchestrationFault(format!(
                "batch already started (state {})",
                self.state.machine_state
            ))
            .into());
        }
        self.transition(MachineState::Selecting)?;

        let items = self.items().await?;
        let total = items.len() as u64;
        progress.report(BatchProgressEvent::Started { total });
        let mut summary = BatchSummary::default();

        while self.state.current_index < items.len() {
            self.wait_while_paused(progress).await?;
            if self.control.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let item = &items[self.state.current_index];
            let n = self.state.current_index as u64 + 1;
            let key = self.normalizer.normalize(&item.identity);

            let existing = if key.is_empty() {
                Err(HarvestError::OrchestrationFault(format!(
                    "item {:?} has an empty identity",
                    item.identity
                ))
                .into())
            } else {
                self.normalizer
                    .lookup(&self.state.identity_to_sequence, &item.identity)
            };

            match existing {
                Ok(Some(sequence)) => {
                    tracing::info!(identity = %key, sequence, "already exported; skipping");
                    summary.skipped += 1;
                    summary.outcomes.push(ItemOutcome::Skipped {
                        identity: key.clone(),
                        sequence,
                    });
                    progress.report(BatchProgressEvent::Skipped { n, identity: key });
                    self.state.current_index += 1;
                    continue;
                }
                Ok(None) => match self.process_item(item, &key, progress).await {
                    Ok(Some(outcome)) => {
                        if let ItemOutcome::Persisted {
                            sequence,
                            revealed,
                            revelation_error,
                            ..
                        } = &outcome
                        {
                            summary.succeeded += 1;
                            if *revelation_error {
                                summary.revelation_errors += 1;
                            }
                            progress.report(BatchProgressEvent::Persisted {
                                n,
                                total,
                                identity: key.clone(),
                                sequence: *sequence,
                                revealed: *revealed,
                                revelation_error: *revelation_error,
                            });
                        }
                        summary.outcomes.push(outcome);
                        self.transition(MachineState::Scheduling)?;
                    }
                    Ok(None) => {
                        tracing::info!(identity = %key, "cancelled; discarding in-flight item");
                        summary.cancelled = true;
                        break;
                    }
                    Err(e) => {
                        self.record_failure(&mut summary, &key, &e, progress)?;
                        self.transition(MachineState::Scheduling)?;
                    }
                },
                Err(e) => {
                    self.record_failure(&mut summary, &key, &e, progress)?;
                    self.transition(MachineState::Scheduling)?;
                }
            }

            self.state.current_index += 1;
            if self.state.current_index < items.len() {
                self.schedule_next(progress).await?;
            }
            self.transition(MachineState::Selecting)?;
        }

        self.transition(MachineState::Completed)?;
        progress.report(BatchProgressEvent::Finished {
            succeeded: summary.succeeded as u64,
            skipped: summary.skipped as u64,
            failed: summary.failed as u64,
            cancelled: summary.cancelled,
        });
        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            revelation_errors = summary.revelation_errors,
            cancelled = summary.cancelled,
            "batch finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::VerificationReport;
    use crate::models::EvidenceRecord;
    use crate::progress::NoProgress;
    use crate::replay::{ReplayDocument, ReplaySource, ReplayThinking, ReplayTurn};
    use crate::traits::TextFragment;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn thinking(stubborn: bool) -> ReplayThinking {
        ReplayThinking {
            fragments: vec![
                TextFragment::header("Exploring"),
                TextFragment::plain("Looking at the options one by one."),
            ],
            collapsed: true,
            toggle: true,
            stubborn,
            reveal_latency: 1,
        }
    }

    fn doc(tag: &str, stubborn_second: bool) -> ReplayDocument {
        ReplayDocument::for_turns(vec![
            ReplayTurn {
                user: vec![format!("{tag}: first question")],
                responses: vec![format!("{tag}: first answer")],
                thinking: Some(thinking(false)),
                height: None,
            },
            ReplayTurn {
                user: vec![format!("{tag}: second question")],
                responses: vec![format!("{tag}: second answer")],
                thinking: Some(thinking(stubborn_second)),
                height: None,
            },
        ])
    }

    struct MemoryCatalog {
        entries: Vec<(SourceItem, Option<ReplayDocument>)>,
    }

    impl MemoryCatalog {
        fn new(entries: Vec<(&str, Option<ReplayDocument>)>) -> Self {
            Self {
                entries: entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, (id, doc))| {
                        (
                            SourceItem {
                                identity: id.to_string(),
                                title: Some(format!("Conversation {i}")),
                                locator: format!("mem://{i}"),
                            },
                            doc,
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ItemCatalog for MemoryCatalog {
        async fn items(&self) -> Result<Vec<SourceItem>> {
            Ok(self.entries.iter().map(|(item, _)| item.clone()).collect())
        }

        async fn open(&self, item: &SourceItem) -> Result<Box<dyn ContentSource>> {
            match self.entries.iter().find(|(i, _)| i.locator == item.locator) {
                Some((_, Some(doc))) => Ok(Box::new(ReplaySource::new(doc.clone()))),
                _ => bail!("source unavailable: {}", item.locator),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        cancel_after_write: Option<BatchControl>,
    }

    impl MemorySink {
        fn names(&self) -> Vec<String> {
            self.files.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }

        fn record(&self, name: &str) -> EvidenceRecord {
            let files = self.files.lock().unwrap();
            let (_, bytes) = files.iter().find(|(n, _)| n == name).unwrap();
            serde_json::from_slice(bytes).unwrap()
        }
    }

    #[async_trait]
    impl EvidenceSink for MemorySink {
        async fn write(&self, name: &str, bytes: &[u8]) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .push((name.to_string(), bytes.to_vec()));
            if let Some(control) = &self.cancel_after_write {
                control.cancel();
            }
            Ok(format!("mem://{name}"))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BatchProgressEvent>>);

    impl BatchProgressReporter for Recorder {
        fn report(&self, event: BatchProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn config() -> Config {
        let mut config = Config::minimal();
        config.extraction.poll_attempts = 4;
        config.extraction.poll_interval_ms = 0;
        config.extraction.settle_ms = 0;
        config.extraction.small_step = 50;
        config.extraction.large_step = 200;
        config.batch.min_delay_ms = 0;
        config.batch.max_delay_ms = 0;
        config
    }

    fn orchestrator(catalog: MemoryCatalog, sink: MemorySink) -> Orchestrator {
        Orchestrator::new(&config(), Box::new(catalog), Box::new(sink)).unwrap()
    }

    #[test]
    fn timer_refuses_a_second_arm() {
        let mut timer = PacingTimer::with_seed(10, 20, 7);
        let delay = timer.arm().unwrap();
        assert!((10..=20).contains(&(delay.as_millis() as u64)));
        let err = timer.arm().unwrap_err();
        assert_eq!(err.kind(), "orchestration_fault");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_disarms_the_timer() {
        let mut timer = PacingTimer::with_seed(1500, 4000, 1);
        let control = BatchControl::new();
        for _ in 0..5 {
            let delay = timer.arm().unwrap();
            assert!(delay >= Duration::from_millis(1500) && delay <= Duration::from_millis(4000));
            timer.wait(&control).await;
            assert!(!timer.is_armed());
        }
    }

    #[test]
    fn transition_table_is_strict() {
        use MachineState::*;
        assert!(allowed(Idle, Selecting));
        assert!(allowed(Persisting, Scheduling));
        assert!(allowed(Failed, Scheduling));
        assert!(allowed(Scheduling, Selecting));
        assert!(!allowed(Idle, Persisting));
        assert!(!allowed(Selecting, Scheduling));
        assert!(!allowed(Revealing, Scheduling));
        assert!(!allowed(Completed, Selecting));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(evidence_file_name(3, "abc123"), "0003_abc123.json");
        assert_eq!(evidence_file_name(12, "a b/c"), "0012_a_b_c.json");
        assert_eq!(evidence_file_name(0, ""), "0000_item.json");
    }

    #[tokio::test]
    async fn batch_assigns_gapless_sequences_and_survives_failures() {
        let catalog = MemoryCatalog::new(vec![
            ("c_one", Some(doc("one", false))),
            ("two", Some(doc("two", false))),
            ("c_two", Some(doc("two again", false))),
            ("three", None),
            ("https://host/app/c_four?hl=en", Some(doc("four", false))),
        ]);
        let sink = MemorySink::default();
        let mut orch = orchestrator(catalog, sink.clone());
        let summary = orch.run(&NoProgress).await.unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.revelation_errors, 0);
        assert!(!summary.cancelled);
        assert_eq!(
            sink.names(),
            vec!["0000_one.json", "0001_two.json", "0002_four.json"]
        );
        assert_eq!(orch.state().machine_state, MachineState::Completed);

        let mut sequences: Vec<usize> = orch.state().identity_to_sequence.values().copied().collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2]);

        let record = sink.record("0001_two.json");
        assert_eq!(record.structured.item_id, "two");
        assert_eq!(record.structured.title, "Conversation 1");
        assert_eq!(record.structured.exchange_count, 2);
        assert_eq!(record.structured.message_count, 6);
        assert_eq!(record.custody.storage.location, "0001_two.json");
        for name in sink.names() {
            let files = sink.files.lock().unwrap();
            let (_, bytes) = files.iter().find(|(n, _)| *n == name).unwrap();
            let report = VerificationReport::for_json(std::str::from_utf8(bytes).unwrap());
            assert!(report.passed(), "{name}: {:?}", report.failures);
        }

        match &summary.outcomes[3] {
            ItemOutcome::Failed { identity, kind, .. } => {
                assert_eq!(identity, "three");
                assert_eq!(kind, "orchestration_fault");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn suffix_related_identities_are_separate_items() {
        let catalog = MemoryCatalog::new(vec![
            ("c_roadtrip", Some(doc("roadtrip", false))),
            ("trip", Some(doc("trip", false))),
            ("a123", Some(doc("a123", false))),
            ("123", Some(doc("123", false))),
        ]);
        let sink = MemorySink::default();
        let mut orch = orchestrator(catalog, sink.clone());
        let summary = orch.run(&NoProgress).await.unwrap();

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(
            sink.names(),
            vec!["0000_roadtrip.json", "0001_trip.json", "0002_a123.json", "0003_123.json"]
        );
        assert_eq!(sink.record("0001_trip.json").structured.item_id, "trip");
        assert_eq!(orch.state().identity_to_sequence.get("123"), Some(&3));
    }

    #[tokio::test]
    async fn partial_revelation_is_still_persisted() {
        let catalog = MemoryCatalog::new(vec![("c_stuck", Some(doc("stuck", true)))]);
        let sink = MemorySink::default();
        let summary = orchestrator(catalog, sink.clone())
            .run(&NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.revelation_errors, 1);
        let record = sink.record("0000_stuck.json");
        let params = &record.custody.collection.extraction_parameters;
        assert_eq!(params.strategy, "button");
        assert_eq!(params.revealed_count, 1);
        assert!(!params.verified);
        // one exchange has thinking, the other only user + response
        assert_eq!(record.structured.message_count, 5);
    }

    #[tokio::test]
    async fn cancellation_stops_after_the_current_item() {
        let catalog = MemoryCatalog::new(vec![
            ("a1", Some(doc("a1", false))),
            ("a2", Some(doc("a2", false))),
            ("a3", Some(doc("a3", false))),
        ]);
        let sink = MemorySink::default();
        let mut orch = orchestrator(catalog, sink.clone());
        let mut sink_with_cancel = sink.clone();
        sink_with_cancel.cancel_after_write = Some(orch.control());
        orch.sink = Box::new(sink_with_cancel);

        let summary = orch.run(&NoProgress).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(sink.names(), vec!["0000_a1.json"]);
        assert_eq!(orch.state().machine_state, MachineState::Completed);
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let catalog = MemoryCatalog::new(vec![("a1", Some(doc("a1", false)))]);
        let sink = MemorySink::default();
        let mut orch = orchestrator(catalog, sink.clone());
        orch.control().cancel();
        let summary = orch.run(&NoProgress).await.unwrap();
        assert!(summary.cancelled);
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn a_batch_runs_only_once() {
        let catalog = MemoryCatalog::new(vec![]);
        let mut orch = orchestrator(catalog, MemorySink::default());
        orch.run(&NoProgress).await.unwrap();
        let err = orch.run(&NoProgress).await.unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_batch_waits_for_resume() {
        let catalog = MemoryCatalog::new(vec![("p1", Some(doc("p1", false)))]);
        let sink = MemorySink::default();
        let mut orch = orchestrator(catalog, sink.clone());
        let control = orch.control();
        control.pause();

        let recorder = Recorder::default();
        let resume = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(sink.names().is_empty());
            control.resume();
        };
        let (summary, _) = tokio::join!(orch.run(&recorder), resume);
        assert_eq!(summary.unwrap().succeeded, 1);

        let events = recorder.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            BatchProgressEvent::State {
                state: MachineState::Paused,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn plan_marks_duplicates() {
        let catalog = MemoryCatalog::new(vec![("c_x1", None), ("x1", None), ("x2", None)]);
        let plan = orchestrator(catalog, MemorySink::default()).plan().await.unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[1].key, "x1");
        assert_eq!(plan[1].duplicate_of, Some(0));
        assert_eq!(plan[2].duplicate_of, None);
    }
}
