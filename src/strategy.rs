//! Revelation strategies and the fallback selector.
//!
//! A strategy knows how to make one hidden thinking block readable on a
//! particular source. The [`StrategySelector`] holds strategies in priority
//! order and runs a full extraction sweep with each applicable one until a
//! sweep passes verification:
//!
//! ```text
//! button ──(inapplicable / below threshold)──▶ always_visible ──▶ none (terminal)
//! ```
//!
//! The terminal `none` strategy reveals nothing and always verifies. It only
//! ends the chain successfully when no earlier strategy was applicable, so a
//! source with no hidden content passes while a source whose reveal mechanism
//! failed still surfaces a [`HarvestError::Revelation`].

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::config::{RevelationConfig, SelectorConfig};
use crate::error::{HarvestError, StrategyAttempt};
use crate::extract::{SweepExtractor, SweepOutcome};
use crate::traits::{ContentSource, NodeHandle};

/// Counters for one extraction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevealTally {
    /// Hidden blocks the sweep visited.
    pub discovered: usize,
    /// Blocks whose content was captured after reveal.
    pub revealed: usize,
    /// Blocks that never reached the minimum content size.
    pub timed_out: usize,
    /// Blocks kept as a single sentinel stage.
    pub fallback: usize,
}

impl RevealTally {
    /// Fraction of discovered blocks that were revealed. 1.0 when nothing
    /// was discovered.
    pub fn ratio(&self) -> f64 {
        if self.discovered == 0 {
            1.0
        } else {
            self.revealed as f64 / self.discovered as f64
        }
    }
}

/// A mechanism for making hidden content readable.
#[async_trait]
pub trait RevelationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Terminal strategies end the chain and are never swept.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Whether this mechanism matches the currently materialized nodes.
    async fn is_applicable(
        &self,
        source: &dyn ContentSource,
        selectors: &SelectorConfig,
    ) -> Result<bool>;

    /// Make `block` readable. Returns `false` when nothing could be done.
    async fn reveal(
        &self,
        source: &dyn ContentSource,
        block: &NodeHandle,
        selectors: &SelectorConfig,
    ) -> Result<bool>;

    fn verify(&self, tally: &RevealTally, threshold: f64) -> bool {
        tally.ratio() >= threshold
    }
}

async fn has_content(
    source: &dyn ContentSource,
    block: &NodeHandle,
    selectors: &SelectorConfig,
) -> Result<bool> {
    for node in source
        .query_within(block, &selectors.thinking_content)
        .await?
    {
        if !source.text(&node).await?.trim().is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Clicks the block's toggle button.
pub struct ButtonActuation;

#[async_trait]
impl RevelationStrategy for ButtonActuation {
    fn name(&self) -> &'static str {
        "button"
    }

    async fn is_applicable(
        &self,
        source: &dyn ContentSource,
        selectors: &SelectorConfig,
    ) -> Result<bool> {
        for block in source.query(&selectors.thinking_block).await? {
            if !source
                .query_within(&block, &selectors.reveal_button)
                .await?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reveal(
        &self,
        source: &dyn ContentSource,
        block: &NodeHandle,
        selectors: &SelectorConfig,
    ) -> Result<bool> {
        // The toggle closes an open block, so only click collapsed ones.
        if has_content(source, block, selectors).await? {
            return Ok(true);
        }
        let buttons = source.query_within(block, &selectors.reveal_button).await?;
        match buttons.first() {
            Some(button) => {
                source.click(button).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Thinking content rendered without any toggle.
pub struct AlwaysVisible;

#[async_trait]
impl RevelationStrategy for AlwaysVisible {
    fn name(&self) -> &'static str {
        "always_visible"
    }

    async fn is_applicable(
        &self,
        source: &dyn ContentSource,
        selectors: &SelectorConfig,
    ) -> Result<bool> {
        for block in source.query(&selectors.thinking_block).await? {
            let has_button = !source
                .query_within(&block, &selectors.reveal_button)
                .await?
                .is_empty();
            if !has_button && has_content(source, &block, selectors).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reveal(
        &self,
        source: &dyn ContentSource,
        block: &NodeHandle,
        selectors: &SelectorConfig,
    ) -> Result<bool> {
        has_content(source, block, selectors).await
    }
}

/// Terminal no-op: the source has nothing to reveal.
pub struct NotApplicable;

#[async_trait]
impl RevelationStrategy for NotApplicable {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn is_applicable(
        &self,
        _source: &dyn ContentSource,
        _selectors: &SelectorConfig,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn reveal(
        &self,
        _source: &dyn ContentSource,
        _block: &NodeHandle,
        _selectors: &SelectorConfig,
    ) -> Result<bool> {
        Ok(false)
    }

    fn verify(&self, _tally: &RevealTally, _threshold: f64) -> bool {
        true
    }
}

/// Build a strategy from its configured name.
pub fn strategy_by_name(name: &str) -> Option<Box<dyn RevelationStrategy>> {
    match name {
        "button" => Some(Box::new(ButtonActuation)),
        "always_visible" => Some(Box::new(AlwaysVisible)),
        "none" => Some(Box::new(NotApplicable)),
        _ => None,
    }
}

/// The strategy that ran and what its sweep produced.
#[derive(Debug, Clone)]
pub struct Selection {
    pub strategy: String,
    pub outcome: SweepOutcome,
    pub verified: bool,
    pub attempts: Vec<StrategyAttempt>,
}

impl Selection {
    pub fn revealed_count(&self) -> usize {
        self.outcome.tally.revealed
    }
}

/// Raised when every strategy failed. Carries the best partial sweep so the
/// item can still be persisted with whatever thinking content was captured.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RevelationFailure {
    pub error: HarvestError,
    pub partial: Option<Selection>,
}

pub struct StrategySelector {
    strategies: Vec<Box<dyn RevelationStrategy>>,
    threshold: f64,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Box<dyn RevelationStrategy>>, threshold: f64) -> Self {
        Self {
            strategies,
            threshold,
        }
    }

    pub fn from_config(config: &RevelationConfig) -> Result<Self> {
        let strategies = config
            .strategies
            .iter()
            .map(|name| {
                strategy_by_name(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown revelation strategy: '{}'", name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(strategies, config.threshold))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy in priority order.
    ///
    /// Returns the first verified selection, or an error wrapping
    /// [`RevelationFailure`] when the chain is exhausted.
    pub async fn select(
        &self,
        source: &dyn ContentSource,
        extractor: &SweepExtractor,
    ) -> Result<Selection> {
        let mut attempts = Vec::new();
        let mut best: Option<Selection> = None;
        let mut any_applicable = false;

        for strategy in &self.strategies {
            let name = strategy.name();

            if !extractor.probe(source, strategy.as_ref()).await? {
                tracing::info!(strategy = name, "strategy not applicable");
                attempts.push(StrategyAttempt {
                    strategy: name.to_string(),
                    reason: "not applicable".to_string(),
                });
                continue;
            }

            if strategy.is_terminal() {
                if any_applicable {
                    attempts.push(StrategyAttempt {
                        strategy: name.to_string(),
                        reason: "skipped: an earlier strategy matched hidden content".to_string(),
                    });
                    continue;
                }
                tracing::info!(strategy = name, "no hidden content; nothing to reveal");
                return Ok(Selection {
                    strategy: name.to_string(),
                    outcome: SweepOutcome::default(),
                    verified: true,
                    attempts,
                });
            }

            any_applicable = true;
            let outcome = extractor.sweep(source, strategy.as_ref()).await?;
            let tally = outcome.tally;

            if strategy.verify(&tally, self.threshold) {
                tracing::info!(
                    strategy = name,
                    revealed = tally.revealed,
                    discovered = tally.discovered,
                    "strategy verified"
                );
                return Ok(Selection {
                    strategy: name.to_string(),
                    outcome,
                    verified: true,
                    attempts,
                });
            }

            let reason = format!(
                "revealed {}/{} ({:.2} < {:.2})",
                tally.revealed,
                tally.discovered,
                tally.ratio(),
                self.threshold
            );
            tracing::info!(strategy = name, %reason, "strategy failed verification");
            attempts.push(StrategyAttempt {
                strategy: name.to_string(),
                reason,
            });

            let better = best
                .as_ref()
                .map(|b| tally.revealed > b.outcome.tally.revealed)
                .unwrap_or(true);
            if better {
                best = Some(Selection {
                    strategy: name.to_string(),
                    outcome,
                    verified: false,
                    attempts: Vec::new(),
                });
            }
        }

        tracing::warn!(attempts = attempts.len(), "every revelation strategy failed");
        let partial = best.map(|mut b| {
            b.attempts = attempts.clone();
            b
        });
        Err(RevelationFailure {
            error: HarvestError::Revelation { attempts },
            partial,
        }
        .into())
    }
}
