//! Replay content source: a windowed, recycling document loaded from a JSON
//! fixture, and a catalog that serves a directory of fixtures as a batch.
//!
//! The replay source behaves like a virtualized list:
//!
//! - only turns intersecting `[offset - overscan, offset + window + overscan)`
//!   are materialized;
//! - every scroll bumps the handle generation, so handles from before the
//!   scroll fail with [`HarvestError::StaleHandle`];
//! - a turn that leaves the materialized range forgets its reveal state and
//!   comes back collapsed;
//! - a clicked block opens only after `reveal_latency` further `query` calls,
//!   which stands in for render latency without depending on wall time;
//! - containers report their turn index as their document position.
//!
//! Selector strings are matched against node tags, which come from the
//! [`SelectorConfig`] the source was built with.
//!
//! Fixture format:
//!
//! ```json
//! {
//!   "identity": "c_abc123",
//!   "title": "Trip planning",
//!   "window": 600,
//!   "turns": [
//!     { "user": ["How far is..."],
//!       "thinking": { "fragments": [{"text": "Scoping", "emphasis": "Scoping"},
//!                                   {"text": "The user wants..."}],
//!                     "collapsed": true, "reveal_latency": 2 },
//!       "responses": ["About 40 km."] }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::{SelectorConfig, SourceConfig};
use crate::error::HarvestError;
use crate::models::SourceItem;
use crate::traits::{ContentSource, ItemCatalog, NodeHandle, TextFragment, Viewport};

const TOGGLE_LABEL: &str = "Show thinking";

fn default_window() -> u64 {
    600
}
fn default_overscan() -> u64 {
    300
}
fn default_turn_height() -> u64 {
    100
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayThinking {
    pub fragments: Vec<TextFragment>,
    #[serde(default = "default_true")]
    pub collapsed: bool,
    /// Whether the block renders a toggle button.
    #[serde(default = "default_true")]
    pub toggle: bool,
    /// Never opens, however often it is clicked.
    #[serde(default)]
    pub stubborn: bool,
    #[serde(default)]
    pub reveal_latency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTurn {
    /// Raw user-input variants (duplicates included).
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub thinking: Option<ReplayThinking>,
    #[serde(default)]
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayDocument {
    pub identity: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_window")]
    pub window: u64,
    #[serde(default = "default_overscan")]
    pub overscan: u64,
    #[serde(default = "default_turn_height")]
    pub turn_height: u64,
    pub turns: Vec<ReplayTurn>,
}

impl ReplayDocument {
    pub fn for_turns(turns: Vec<ReplayTurn>) -> Self {
        Self {
            identity: "replay".to_string(),
            title: None,
            url: None,
            window: default_window(),
            overscan: default_overscan(),
            turn_height: default_turn_height(),
            turns,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
        let doc: ReplayDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture: {}", path.display()))?;
        if doc.window == 0 {
            bail!("fixture {}: window must be > 0", path.display());
        }
        Ok(doc)
    }

    fn height_of(&self, turn: usize) -> u64 {
        self.turns[turn].height.unwrap_or(self.turn_height).max(1)
    }

    fn top_of(&self, turn: usize) -> u64 {
        (0..turn).map(|t| self.height_of(t)).sum()
    }

    fn extent(&self) -> u64 {
        (0..self.turns.len()).map(|t| self.height_of(t)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Container,
    User(usize),
    Thinking,
    Button,
    Content,
    Response(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeRef {
    turn: usize,
    part: Part,
}

#[derive(Debug, Clone, Default)]
struct BlockState {
    open: bool,
    pending_since: Option<u64>,
}

struct ReplayState {
    offset: u64,
    generation: u64,
    next_id: u64,
    ticks: u64,
    recycled: u64,
    materialized: Vec<usize>,
    /// Current generation's nodes, in document order.
    nodes: Vec<(u64, NodeRef)>,
    blocks: Vec<BlockState>,
}

/// A virtualized [`ContentSource`] over a [`ReplayDocument`].
pub struct ReplaySource {
    doc: ReplayDocument,
    selectors: SelectorConfig,
    state: Mutex<ReplayState>,
}

fn initial_block(turn: &ReplayTurn) -> BlockState {
    BlockState {
        open: turn.thinking.as_ref().map(|t| !t.collapsed).unwrap_or(false),
        pending_since: None,
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

impl ReplaySource {
    pub fn new(doc: ReplayDocument) -> Self {
        Self::with_selectors(doc, SelectorConfig::default())
    }

    pub fn with_selectors(doc: ReplayDocument, selectors: SelectorConfig) -> Self {
        let blocks = doc.turns.iter().map(initial_block).collect();
        let source = Self {
            doc,
            selectors,
            state: Mutex::new(ReplayState {
                offset: 0,
                generation: 0,
                next_id: 0,
                ticks: 0,
                recycled: 0,
                materialized: Vec::new(),
                nodes: Vec::new(),
                blocks,
            }),
        };
        {
            let mut state = source.lock();
            source.materialize(&mut state, 0);
        }
        source
    }

    /// Number of turns destroyed by the windowing so far.
    pub fn recycle_count(&self) -> u64 {
        self.lock().recycled
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        // A poisoned lock only means a panicking test; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn max_offset(&self) -> u64 {
        self.doc.extent().saturating_sub(self.doc.window)
    }

    /// Rebuild the node set for `offset`. Always starts a new generation.
    fn materialize(&self, state: &mut ReplayState, offset: u64) {
        state.offset = offset.min(self.max_offset());
        state.generation += 1;

        let lo = state.offset.saturating_sub(self.doc.overscan);
        let hi = state.offset + self.doc.window + self.doc.overscan;
        let visible: Vec<usize> = (0..self.doc.turns.len())
            .filter(|&t| {
                let top = self.doc.top_of(t);
                let bottom = top + self.doc.height_of(t);
                top < hi && bottom > lo
            })
            .collect();

        for &turn in &state.materialized {
            if !visible.contains(&turn) {
                state.blocks[turn] = initial_block(&self.doc.turns[turn]);
                state.recycled += 1;
            }
        }

        let mut nodes = Vec::new();
        for &turn in &visible {
            let t = &self.doc.turns[turn];
            let mut parts = vec![Part::Container];
            parts.extend((0..t.user.len()).map(Part::User));
            if let Some(thinking) = &t.thinking {
                parts.push(Part::Thinking);
                if thinking.toggle {
                    parts.push(Part::Button);
                }
                parts.push(Part::Content);
            }
            parts.extend((0..t.responses.len()).map(Part::Response));
            for part in parts {
                state.next_id += 1;
                nodes.push((state.next_id, NodeRef { turn, part }));
            }
        }
        state.nodes = nodes;
        state.materialized = visible;
    }

    fn advance_clock(&self, state: &mut ReplayState) {
        state.ticks += 1;
        let ticks = state.ticks;
        for (turn, block) in state.blocks.iter_mut().enumerate() {
            if let Some(since) = block.pending_since {
                let latency = self.doc.turns[turn]
                    .thinking
                    .as_ref()
                    .map(|t| t.reveal_latency as u64)
                    .unwrap_or(0);
                if ticks - since >= latency {
                    block.open = true;
                    block.pending_since = None;
                }
            }
        }
    }

    fn resolve(&self, state: &ReplayState, handle: &NodeHandle) -> Result<NodeRef> {
        if handle.generation != state.generation {
            return Err(HarvestError::StaleHandle {
                handle: handle.id,
                held: handle.generation,
                current: state.generation,
            }
            .into());
        }
        state
            .nodes
            .iter()
            .find(|(id, _)| *id == handle.id)
            .map(|(_, node)| *node)
            .ok_or_else(|| anyhow::anyhow!("unknown node handle {}", handle.id))
    }

    fn tag(&self, part: Part) -> &str {
        match part {
            Part::Container => &self.selectors.exchange,
            Part::User(_) => &self.selectors.user_query,
            Part::Thinking => &self.selectors.thinking_block,
            Part::Button => &self.selectors.reveal_button,
            Part::Content => &self.selectors.thinking_content,
            Part::Response(_) => &self.selectors.model_response,
        }
    }

    fn is_present(&self, state: &ReplayState, node: &NodeRef) -> bool {
        match node.part {
            Part::Content => state.blocks[node.turn].open,
            _ => true,
        }
    }

    fn parent(part: Part) -> Option<Part> {
        match part {
            Part::Container => None,
            Part::User(_) | Part::Thinking | Part::Response(_) => Some(Part::Container),
            Part::Button | Part::Content => Some(Part::Thinking),
        }
    }

    fn is_within(scope: Part, part: Part) -> bool {
        let mut current = Self::parent(part);
        while let Some(p) = current {
            if p == scope {
                return true;
            }
            current = Self::parent(p);
        }
        false
    }

    fn handle_for(&self, state: &ReplayState, node: NodeRef) -> Option<NodeHandle> {
        state
            .nodes
            .iter()
            .find(|(_, n)| *n == node)
            .map(|(id, _)| NodeHandle {
                id: *id,
                generation: state.generation,
            })
    }

    fn fragments_of(&self, state: &ReplayState, node: &NodeRef) -> Vec<TextFragment> {
        let turn = &self.doc.turns[node.turn];
        match node.part {
            Part::Content => match (&turn.thinking, state.blocks[node.turn].open) {
                (Some(thinking), true) => thinking.fragments.clone(),
                _ => Vec::new(),
            },
            _ => vec![TextFragment::plain(self.text_of(state, node))],
        }
    }

    fn text_of(&self, state: &ReplayState, node: &NodeRef) -> String {
        let turn = &self.doc.turns[node.turn];
        match node.part {
            Part::User(i) => turn.user[i].clone(),
            Part::Response(i) => turn.responses[i].clone(),
            Part::Button => TOGGLE_LABEL.to_string(),
            Part::Content => self
                .fragments_of(state, node)
                .iter()
                .map(|f| f.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            Part::Thinking => {
                let mut parts = Vec::new();
                if turn.thinking.as_ref().map(|t| t.toggle).unwrap_or(false) {
                    parts.push(TOGGLE_LABEL.to_string());
                }
                let content = NodeRef {
                    turn: node.turn,
                    part: Part::Content,
                };
                let body = self.text_of(state, &content);
                if !body.is_empty() {
                    parts.push(body);
                }
                parts.join("\n")
            }
            Part::Container => {
                let mut parts = Vec::new();
                parts.extend(turn.user.iter().cloned());
                if turn.thinking.is_some() {
                    parts.push(self.text_of(
                        state,
                        &NodeRef {
                            turn: node.turn,
                            part: Part::Thinking,
                        },
                    ));
                }
                parts.extend(turn.responses.iter().cloned());
                parts.join("\n")
            }
        }
    }

    fn html_of(&self, state: &ReplayState, node: &NodeRef) -> String {
        let turn = &self.doc.turns[node.turn];
        let class = escape_html(self.tag(node.part));
        match node.part {
            Part::User(i) => format!("<div class=\"{class}\">{}</div>", escape_html(&turn.user[i])),
            Part::Response(i) => {
                format!("<div class=\"{class}\">{}</div>", escape_html(&turn.responses[i]))
            }
            Part::Button => format!("<button class=\"{class}\">{TOGGLE_LABEL}</button>"),
            Part::Content => {
                let mut inner = String::new();
                for fragment in self.fragments_of(state, node) {
                    let text = escape_html(&fragment.text);
                    match fragment.emphasis {
                        Some(e) if e.trim() == fragment.text.trim() => {
                            inner.push_str(&format!("<p><strong>{text}</strong></p>"))
                        }
                        _ => inner.push_str(&format!("<p>{text}</p>")),
                    }
                }
                format!("<div class=\"{class}\">{inner}</div>")
            }
            Part::Thinking => {
                let mut inner = String::new();
                if turn.thinking.as_ref().map(|t| t.toggle).unwrap_or(false) {
                    inner.push_str(&self.html_of(state, &NodeRef { turn: node.turn, part: Part::Button }));
                }
                let content = NodeRef {
                    turn: node.turn,
                    part: Part::Content,
                };
                if self.is_present(state, &content) {
                    inner.push_str(&self.html_of(state, &content));
                }
                format!("<div class=\"{class}\">{inner}</div>")
            }
            Part::Container => {
                let mut inner = String::new();
                for i in 0..turn.user.len() {
                    inner.push_str(&self.html_of(state, &NodeRef { turn: node.turn, part: Part::User(i) }));
                }
                if turn.thinking.is_some() {
                    inner.push_str(&self.html_of(state, &NodeRef { turn: node.turn, part: Part::Thinking }));
                }
                for i in 0..turn.responses.len() {
                    inner.push_str(&self.html_of(
                        state,
                        &NodeRef {
                            turn: node.turn,
                            part: Part::Response(i),
                        },
                    ));
                }
                format!("<div class=\"{class}\">{inner}</div>")
            }
        }
    }
}

#[async_trait]
impl ContentSource for ReplaySource {
    async fn viewport(&self) -> Result<Viewport> {
        let state = self.lock();
        Ok(Viewport {
            offset: state.offset,
            window: self.doc.window,
            extent: self.doc.extent(),
        })
    }

    async fn scroll_to(&self, offset: u64) -> Result<()> {
        let mut state = self.lock();
        self.materialize(&mut state, offset);
        Ok(())
    }

    async fn scroll_into_view(&self, node: &NodeHandle) -> Result<()> {
        let mut state = self.lock();
        let node = self.resolve(&state, node)?;
        let top = self.doc.top_of(node.turn);
        self.materialize(&mut state, top);
        Ok(())
    }

    async fn query(&self, selector: &str) -> Result<Vec<NodeHandle>> {
        let mut state = self.lock();
        self.advance_clock(&mut state);
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| self.tag(n.part) == selector && self.is_present(&state, n))
            .map(|(id, _)| NodeHandle {
                id: *id,
                generation: state.generation,
            })
            .collect())
    }

    async fn query_within(&self, scope: &NodeHandle, selector: &str) -> Result<Vec<NodeHandle>> {
        let state = self.lock();
        let scope = self.resolve(&state, scope)?;
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.turn == scope.turn
                    && Self::is_within(scope.part, n.part)
                    && self.tag(n.part) == selector
                    && self.is_present(&state, n)
            })
            .map(|(id, _)| NodeHandle {
                id: *id,
                generation: state.generation,
            })
            .collect())
    }

    async fn closest(&self, node: &NodeHandle, selector: &str) -> Result<Option<NodeHandle>> {
        let state = self.lock();
        let node = self.resolve(&state, node)?;
        let mut current = Some(node.part);
        while let Some(part) = current {
            if self.tag(part) == selector {
                return Ok(self.handle_for(
                    &state,
                    NodeRef {
                        turn: node.turn,
                        part,
                    },
                ));
            }
            current = Self::parent(part);
        }
        Ok(None)
    }

    async fn text(&self, node: &NodeHandle) -> Result<String> {
        let state = self.lock();
        let node = self.resolve(&state, node)?;
        Ok(self.text_of(&state, &node))
    }

    async fn fragments(&self, node: &NodeHandle) -> Result<Vec<TextFragment>> {
        let state = self.lock();
        let node = self.resolve(&state, node)?;
        Ok(self.fragments_of(&state, &node))
    }

    async fn outer_html(&self, node: &NodeHandle) -> Result<String> {
        let state = self.lock();
        let node = self.resolve(&state, node)?;
        Ok(self.html_of(&state, &node))
    }

    async fn click(&self, node: &NodeHandle) -> Result<()> {
        let mut state = self.lock();
        let node = self.resolve(&state, node)?;
        if node.part != Part::Button {
            return Ok(());
        }
        let Some(thinking) = self.doc.turns[node.turn].thinking.as_ref() else {
            return Ok(());
        };
        let ticks = state.ticks;
        let block = &mut state.blocks[node.turn];
        if block.open {
            block.open = false;
        } else if !thinking.stubborn {
            if thinking.reveal_latency == 0 {
                block.open = true;
            } else {
                block.pending_since = Some(ticks);
            }
        }
        Ok(())
    }

    async fn position(&self, container: &NodeHandle) -> Result<Option<u64>> {
        let state = self.lock();
        let node = self.resolve(&state, container)?;
        Ok((node.part == Part::Container).then_some(node.turn as u64))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════

/// Serves every fixture under a directory as one batch item, in path order.
pub struct ReplayCatalog {
    source: SourceConfig,
    selectors: SelectorConfig,
    paths: RwLock<HashMap<String, PathBuf>>,
}

impl ReplayCatalog {
    pub fn new(source: SourceConfig, selectors: SelectorConfig) -> Self {
        Self {
            source,
            selectors,
            paths: RwLock::new(HashMap::new()),
        }
    }

    fn scan(&self) -> Result<Vec<PathBuf>> {
        let root = &self.source.fixtures;
        if !root.exists() {
            bail!("Fixture directory does not exist: {}", root.display());
        }
        let include_set = build_globset(&self.source.include_globs)?;
        let exclude_set = build_globset(&self.source.exclude_globs)?;

        let mut paths = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();
            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            paths.push(path.to_path_buf());
        }
        // Sort for deterministic ordering
        paths.sort();
        Ok(paths)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl ItemCatalog for ReplayCatalog {
    async fn items(&self) -> Result<Vec<SourceItem>> {
        let mut items = Vec::new();
        let mut paths = HashMap::new();
        for path in self.scan()? {
            let file_locator = format!("file://{}", path.display());
            let item = match ReplayDocument::load(&path) {
                Ok(doc) => SourceItem {
                    identity: doc.identity,
                    title: doc.title,
                    locator: doc.url.unwrap_or(file_locator),
                },
                // Listed anyway so the failure is reported against this item
                // when it is opened.
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable fixture");
                    SourceItem {
                        identity: path
                            .file_stem()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default(),
                        title: None,
                        locator: file_locator,
                    }
                }
            };
            paths.insert(item.locator.clone(), path);
            items.push(item);
        }
        match self.paths.write() {
            Ok(mut guard) => *guard = paths,
            Err(poisoned) => *poisoned.into_inner() = paths,
        }
        Ok(items)
    }

    async fn open(&self, item: &SourceItem) -> Result<Box<dyn ContentSource>> {
        let path = {
            let guard = self.paths.read().unwrap_or_else(|e| e.into_inner());
            guard.get(&item.locator).cloned()
        };
        let path = path.ok_or_else(|| anyhow::anyhow!("unknown item locator: {}", item.locator))?;
        let doc = ReplayDocument::load(&path)?;
        Ok(Box::new(ReplaySource::with_selectors(
            doc,
            self.selectors.clone(),
        )))
    }
}
