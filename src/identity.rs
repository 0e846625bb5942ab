//! Identity derivation and normalization.
//!
//! Two kinds of identity live here:
//!
//! - **Stable content identity**: a whitespace-collapsed prefix of rendered
//!   text, plus the container's document position when the source exposes
//!   it. It never depends on node handles or pixel offsets, so the same
//!   exchange yields the same key each time the windowing layer destroys and
//!   recreates it.
//! - **Item identity**: the canonical form of a batch item's id. Every store
//!   into and lookup from the identity→sequence map goes through
//!   [`IdentityNormalizer::normalize`], and both log the exact key used.

use std::collections::HashMap;

use anyhow::Result;

use crate::config::SelectorConfig;
use crate::error::HarvestError;
use crate::traits::{ContentSource, NodeHandle};

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `prefix_chars` characters of the whitespace-normalized text.
pub fn stable_content_identity(text: &str, prefix_chars: usize) -> String {
    normalize_whitespace(text)
        .chars()
        .take(prefix_chars)
        .collect()
}

/// Stable identity of an exchange container.
///
/// Built from the user query text followed by the first non-empty response
/// text, suffixed with `#<position>` when the source reports the container's
/// document position. The suffix keeps repeated turns ("continue" / "ok")
/// apart. The thinking region is excluded so revealing it does not change
/// the key. Containers with no user or response text yield an empty key.
pub async fn container_identity(
    source: &dyn ContentSource,
    container: &NodeHandle,
    selectors: &SelectorConfig,
    prefix_chars: usize,
) -> Result<String> {
    let content = container_content_identity(source, container, selectors, prefix_chars).await?;
    if content.is_empty() {
        return Ok(content);
    }
    Ok(match source.position(container).await? {
        Some(position) => format!("{content}#{position}"),
        None => content,
    })
}

async fn container_content_identity(
    source: &dyn ContentSource,
    container: &NodeHandle,
    selectors: &SelectorConfig,
    prefix_chars: usize,
) -> Result<String> {
    let mut parts = Vec::new();
    for node in source.query_within(container, &selectors.user_query).await? {
        parts.push(source.text(&node).await?);
    }
    for node in source
        .query_within(container, &selectors.model_response)
        .await?
    {
        let text = source.text(&node).await?;
        if !text.trim().is_empty() {
            parts.push(text);
            break;
        }
    }
    Ok(stable_content_identity(&parts.join(" "), prefix_chars))
}

/// Canonicalizes raw item identities.
#[derive(Debug, Clone)]
pub struct IdentityNormalizer {
    prefixes: Vec<String>,
}

impl IdentityNormalizer {
    pub fn new(prefixes: &[String]) -> Self {
        Self {
            prefixes: prefixes
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Canonical form: trimmed, lowercased, last path segment of a URL-ish
    /// value (query and fragment dropped), with every known prefix stripped.
    ///
    /// Idempotent: `normalize(normalize(x)) == normalize(x)`.
    pub fn normalize(&self, raw: &str) -> String {
        let mut value = raw.trim().to_lowercase();

        if let Some(pos) = value.find(['?', '#']) {
            value.truncate(pos);
        }
        let trimmed = value.trim_end_matches('/');
        let segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let mut key = segment.trim().to_string();

        loop {
            let before = key.len();
            for prefix in &self.prefixes {
                if let Some(rest) = key.strip_prefix(prefix.as_str()) {
                    key = rest.trim_start().to_string();
                }
            }
            if key.len() == before {
                break;
            }
        }
        key.trim().to_string()
    }

    /// Record `raw → sequence`. Rejects a key already bound to a different
    /// sequence, and a sequence already bound to a different key.
    pub fn store(
        &self,
        map: &mut HashMap<String, usize>,
        raw: &str,
        sequence: usize,
    ) -> Result<String> {
        let key = self.normalize(raw);
        tracing::debug!(raw, key = %key, sequence, "identity store");

        if let Some(&existing) = map.get(&key) {
            if existing != sequence {
                return Err(HarvestError::OrchestrationFault(format!(
                    "identity {key:?} already holds sequence {existing}, refusing {sequence}"
                ))
                .into());
            }
            return Ok(key);
        }
        if let Some((other, _)) = map.iter().find(|(_, &s)| s == sequence) {
            return Err(HarvestError::OrchestrationFault(format!(
                "sequence {sequence} already assigned to {other:?}, refusing {key:?}"
            ))
            .into());
        }
        map.insert(key.clone(), sequence);
        Ok(key)
    }

    /// Look up `raw`. A miss where a stored key and the lookup key differ only
    /// by a leading or trailing fragment is logged as
    /// [`HarvestError::IdentityMismatch`] with both keys and then treated as
    /// a plain miss. It is never corrected: `roadtrip` and `trip` may well be
    /// two different items.
    pub fn lookup(&self, map: &HashMap<String, usize>, raw: &str) -> Result<Option<usize>> {
        let key = self.normalize(raw);
        let found = map.get(&key).copied();
        tracing::debug!(raw, key = %key, found = ?found, "identity lookup");
        if found.is_some() || key.is_empty() {
            return Ok(found);
        }

        if let Some(stored) = self.near_miss(map, &key) {
            let mismatch = HarvestError::IdentityMismatch {
                stored: stored.to_string(),
                lookup: key.clone(),
            };
            tracing::warn!(stored = %stored, lookup = %key, error = %mismatch, "identity near miss");
        }
        Ok(None)
    }

    /// A stored key that ends with `key`, or that `key` ends with.
    pub fn near_miss<'a>(&self, map: &'a HashMap<String, usize>, key: &str) -> Option<&'a str> {
        let mut candidates: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|stored| *stored != key && (stored.ends_with(key) || key.ends_with(stored)))
            .collect();
        candidates.sort_unstable();
        candidates.first().copied()
    }
}
