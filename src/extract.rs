//! Virtualization-aware extraction of hidden thinking blocks.
//!
//! The source only keeps a bounded window of nodes alive; anything outside it
//! is destroyed and recreated later with fresh handles (and, usually,
//! collapsed again). The sweep therefore:
//!
//! 1. keeps a monotonic cursor over the document's extent;
//! 2. at each step searches the whole materialized set for one thinking block
//!    whose stable content identity has not been processed;
//! 3. brings it into view, reveals it, polls until its content exceeds the
//!    minimum size, and parses stages *before the next suspension point*;
//! 4. records the stages under the identity and advances the cursor a little,
//!    or a lot when nothing new was found.
//!
//! Handles are never carried across a suspension point (scroll or sleep);
//! every wait is followed by re-acquiring the block by identity.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;

use crate::config::{ExtractionConfig, PartialStagePolicy, SelectorConfig};
use crate::error::HarvestError;
use crate::identity::{container_identity, normalize_whitespace, stable_content_identity};
use crate::models::{RevealedContentMap, ThinkingStage};
use crate::strategy::{RevealTally, RevelationStrategy};
use crate::traits::{ContentSource, NodeHandle, TextFragment};

/// Stage name used when a block has no recognizable stage headers.
pub const UNSTRUCTURED_STAGE: &str = "Thinking";

/// Result of parsing a block's fragments into stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStages {
    pub stages: Vec<ThinkingStage>,
    /// Text that appeared before the first header.
    pub orphan: Option<String>,
    /// Headers dropped because nothing followed them.
    pub empty_headers: usize,
}

impl ParsedStages {
    pub fn has_boundaries(&self) -> bool {
        !self.stages.is_empty() || self.empty_headers > 0
    }

    /// Some but not all boundaries are usable.
    pub fn is_partial(&self) -> bool {
        self.has_boundaries() && (self.orphan.is_some() || self.empty_headers > 0)
    }
}

fn is_header(fragment: &TextFragment, text: &str) -> bool {
    fragment
        .emphasis
        .as_deref()
        .map(|e| {
            let e = e.trim();
            !e.is_empty() && e == text
        })
        .unwrap_or(false)
}

fn close_stage(
    current: Option<(String, Vec<String>)>,
    stages: &mut Vec<ThinkingStage>,
    empty_headers: &mut usize,
) {
    if let Some((name, body)) = current {
        let text = body.join("\n\n").trim().to_string();
        if text.is_empty() {
            *empty_headers += 1;
        } else {
            stages.push(ThinkingStage { name, text });
        }
    }
}

/// Split fragments into stages: a fragment that consists entirely of
/// emphasized text opens a new stage; everything else is appended to the
/// current stage separated by a blank line.
pub fn parse_stages(fragments: &[TextFragment]) -> ParsedStages {
    let mut stages = Vec::new();
    let mut orphan: Vec<String> = Vec::new();
    let mut empty_headers = 0;
    let mut current: Option<(String, Vec<String>)> = None;

    for fragment in fragments {
        let text = fragment.text.trim();
        if text.is_empty() {
            continue;
        }
        if is_header(fragment, text) {
            close_stage(current.take(), &mut stages, &mut empty_headers);
            current = Some((text.to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(text.to_string());
        } else {
            orphan.push(text.to_string());
        }
    }
    close_stage(current.take(), &mut stages, &mut empty_headers);

    let orphan = if orphan.is_empty() {
        None
    } else {
        Some(orphan.join("\n\n"))
    };
    ParsedStages {
        stages,
        orphan,
        empty_headers,
    }
}

/// Every non-empty fragment, whitespace-normalized, joined by blank lines.
pub fn full_text(fragments: &[TextFragment]) -> String {
    fragments
        .iter()
        .map(|f| normalize_whitespace(&f.text))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn sentinel_stage(text: String) -> Vec<ThinkingStage> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![ThinkingStage {
            name: UNSTRUCTURED_STAGE.to_string(),
            text,
        }]
    }
}

/// Output of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub revealed: RevealedContentMap,
    /// Identities in the order they were processed (document order).
    pub order: Vec<String>,
    pub tally: RevealTally,
    pub iterations: u32,
    /// Outer markup of each revealed block's container, read while open.
    pub markup: HashMap<String, String>,
}

enum Capture {
    Done(Vec<ThinkingStage>),
    /// Content present but structure incomplete; poll again.
    Incomplete,
}

pub struct SweepExtractor {
    config: ExtractionConfig,
    selectors: SelectorConfig,
}

impl SweepExtractor {
    pub fn new(config: ExtractionConfig, selectors: SelectorConfig) -> Self {
        Self { config, selectors }
    }

    pub fn selectors(&self) -> &SelectorConfig {
        &self.selectors
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;
    }

    async fn move_to(&self, source: &dyn ContentSource, offset: u64) -> Result<()> {
        source.scroll_to(offset).await?;
        self.settle().await;
        Ok(())
    }

    /// Walk the document with window-sized steps until `strategy` reports it
    /// is applicable somewhere. No reveals happen here.
    pub async fn probe(
        &self,
        source: &dyn ContentSource,
        strategy: &dyn RevelationStrategy,
    ) -> Result<bool> {
        self.move_to(source, 0).await?;
        let mut steps = 0;
        loop {
            if strategy.is_applicable(source, &self.selectors).await? {
                return Ok(true);
            }
            let vp = source.viewport().await?;
            let step = vp.window.max(self.config.small_step);
            steps += 1;
            if vp.offset + vp.window >= vp.extent || steps >= self.config.max_iterations {
                return Ok(false);
            }
            self.move_to(source, (vp.offset + step).min(vp.extent))
                .await?;
        }
    }

    async fn block_identity(&self, source: &dyn ContentSource, block: &NodeHandle) -> Result<String> {
        let prefix = self.config.identity_prefix_chars;
        match source.closest(block, &self.selectors.exchange).await? {
            Some(container) => {
                container_identity(source, &container, &self.selectors, prefix).await
            }
            None => Ok(stable_content_identity(&source.text(block).await?, prefix)),
        }
    }

    /// First materialized block whose identity is not in `processed`.
    async fn next_unprocessed(
        &self,
        source: &dyn ContentSource,
        processed: &HashSet<String>,
    ) -> Result<Option<String>> {
        for block in source.query(&self.selectors.thinking_block).await? {
            let identity = self.block_identity(source, &block).await?;
            if !processed.contains(&identity) {
                return Ok(Some(identity));
            }
        }
        Ok(None)
    }

    /// Re-acquire a block by identity after a suspension point.
    async fn acquire(&self, source: &dyn ContentSource, identity: &str) -> Result<Option<NodeHandle>> {
        for block in source.query(&self.selectors.thinking_block).await? {
            if self.block_identity(source, &block).await? == identity {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    async fn content_fragments(
        &self,
        source: &dyn ContentSource,
        block: &NodeHandle,
    ) -> Result<Vec<TextFragment>> {
        let mut fragments = Vec::new();
        for node in source
            .query_within(block, &self.selectors.thinking_content)
            .await?
        {
            fragments.extend(source.fragments(&node).await?);
        }
        Ok(fragments)
    }

    /// Turn fragments into stages according to the partial-stage policy.
    fn capture(&self, identity: &str, fragments: &[TextFragment], retries_left: bool) -> Capture {
        let parsed = parse_stages(fragments);

        if !parsed.has_boundaries() {
            let text = full_text(fragments);
            let note = HarvestError::ParseFallback {
                identity: identity.to_string(),
                chars: text.chars().count(),
            };
            tracing::info!(identity, error = %note, "stage parse fallback");
            return Capture::Done(sentinel_stage(text));
        }

        if !parsed.is_partial() {
            return Capture::Done(parsed.stages);
        }

        match self.config.partial_stage_policy {
            PartialStagePolicy::Retry if retries_left => Capture::Incomplete,
            PartialStagePolicy::Fallback => Capture::Done(sentinel_stage(full_text(fragments))),
            PartialStagePolicy::Accept | PartialStagePolicy::Retry => {
                let mut stages = Vec::new();
                if let Some(orphan) = parsed.orphan {
                    stages.push(ThinkingStage {
                        name: UNSTRUCTURED_STAGE.to_string(),
                        text: orphan,
                    });
                }
                stages.extend(parsed.stages);
                Capture::Done(stages)
            }
        }
    }

    /// Reveal one block and capture its stages. Updates the tally, and
    /// records the container's markup while the block is still open.
    async fn reveal_block(
        &self,
        source: &dyn ContentSource,
        strategy: &dyn RevelationStrategy,
        identity: &str,
        outcome: &mut SweepOutcome,
    ) -> Result<Vec<ThinkingStage>> {
        outcome.tally.discovered += 1;

        if let Some(block) = self.acquire(source, identity).await? {
            source.scroll_into_view(&block).await?;
            self.settle().await;
        }
        let Some(block) = self.acquire(source, identity).await? else {
            tracing::warn!(identity, "block vanished after scrolling into view");
            return Ok(Vec::new());
        };
        if !strategy.reveal(source, &block, &self.selectors).await? {
            tracing::debug!(identity, strategy = strategy.name(), "strategy could not reveal block");
            return Ok(Vec::new());
        }

        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut partial_retries = 0;
        let mut last_fragments = Vec::new();
        for attempt in 0..self.config.poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            let Some(block) = self.acquire(source, identity).await? else {
                continue;
            };
            let fragments = self.content_fragments(source, &block).await?;
            let chars: usize = fragments.iter().map(|f| f.text.trim().chars().count()).sum();
            last_fragments = fragments;
            if chars <= self.config.min_content_chars {
                continue;
            }

            let retries_left = partial_retries < self.config.partial_retry_limit;
            match self.capture(identity, &last_fragments, retries_left) {
                Capture::Done(stages) => {
                    tracing::debug!(identity, attempts = attempt + 1, stages = stages.len(), "block revealed");
                    if !stages.is_empty() {
                        if let Some(container) =
                            source.closest(&block, &self.selectors.exchange).await?
                        {
                            let markup = source.outer_html(&container).await?;
                            outcome.markup.insert(identity.to_string(), markup);
                        }
                        outcome.tally.revealed += 1;
                        if stages.len() == 1 && stages[0].name == UNSTRUCTURED_STAGE {
                            outcome.tally.fallback += 1;
                        }
                    }
                    return Ok(stages);
                }
                Capture::Incomplete => {
                    partial_retries += 1;
                    tracing::debug!(identity, partial_retries, "partial stages; polling again");
                }
            }
        }

        outcome.tally.timed_out += 1;
        let timeout = HarvestError::ExtractionTimeout {
            identity: identity.to_string(),
            attempts: self.config.poll_attempts,
            min_chars: self.config.min_content_chars,
        };
        tracing::warn!(identity, error = %timeout, "reveal timed out");

        // Whatever was readable at the last poll is kept rather than dropped.
        let stages = sentinel_stage(full_text(&last_fragments));
        if !stages.is_empty() {
            outcome.tally.fallback += 1;
        }
        Ok(stages)
    }

    /// Visit every hidden block once using `strategy`.
    pub async fn sweep(
        &self,
        source: &dyn ContentSource,
        strategy: &dyn RevelationStrategy,
    ) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        let mut processed: HashSet<String> = HashSet::new();
        let mut cursor: u64 = 0;
        let mut idle_sweeps = 0;

        self.move_to(source, 0).await?;

        loop {
            if outcome.iterations >= self.config.max_iterations {
                tracing::warn!(
                    iterations = outcome.iterations,
                    processed = processed.len(),
                    "sweep hit iteration cap"
                );
                break;
            }
            outcome.iterations += 1;

            match self.next_unprocessed(source, &processed).await? {
                Some(identity) => {
                    idle_sweeps = 0;
                    let stages = self
                        .reveal_block(source, strategy, &identity, &mut outcome)
                        .await?;
                    processed.insert(identity.clone());
                    outcome.order.push(identity.clone());
                    if !stages.is_empty() {
                        outcome.revealed.insert(identity, stages);
                    }
                    let vp = source.viewport().await?;
                    cursor = cursor.max(vp.offset) + self.config.small_step;
                }
                None => {
                    let vp = source.viewport().await?;
                    if cursor > vp.extent + vp.window {
                        idle_sweeps += 1;
                        if idle_sweeps >= self.config.idle_sweeps {
                            break;
                        }
                    }
                    cursor += self.config.large_step;
                }
            }

            let vp = source.viewport().await?;
            self.move_to(source, cursor.min(vp.extent)).await?;
        }

        tracing::debug!(
            strategy = strategy.name(),
            discovered = outcome.tally.discovered,
            revealed = outcome.tally.revealed,
            iterations = outcome.iterations,
            "sweep finished"
        );
        Ok(outcome)
    }
}
