//! Extension traits for the collaborators the pipeline talks to.
//!
//! The pipeline never touches a browser, a filesystem layout or a network
//! directly. It drives these traits:
//!
//! ```text
//! ┌──────────────┐  items/open   ┌──────────────┐  query/click/scroll
//! │ ItemCatalog  │──────────────▶│ContentSource │◀──────────────────── extractor,
//! └──────────────┘               └──────────────┘                      assembler
//!                                                  write(name, blob)
//!                      orchestrator ─────────────▶ EvidenceSink
//! ```
//!
//! # Handle lifetime
//!
//! A [`NodeHandle`] is only valid until the next suspension point (any
//! `scroll_*` call, or any await on a timer). The source may destroy and
//! recreate nodes at those points; operations on an old handle fail with
//! [`HarvestError::StaleHandle`](crate::error::HarvestError::StaleHandle).
//! Callers re-acquire nodes by stable content identity instead of keeping
//! handles around.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::SourceItem;

/// Opaque reference to a materialized node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub id: u64,
    pub generation: u64,
}

/// Current scroll window over the source's total extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Offset of the top of the window.
    pub offset: u64,
    /// Height of the window.
    pub window: u64,
    /// Total height of the document.
    pub extent: u64,
}

/// A rendered text fragment (paragraph) inside a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    /// Bold/strong text inside the fragment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emphasis: Option<String>,
}

impl TextFragment {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            emphasis: None,
        }
    }

    pub fn header(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            emphasis: Some(text.clone()),
            text,
        }
    }
}

/// A lazily materialized, windowed document.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn viewport(&self) -> Result<Viewport>;

    /// Move the window. Invalidates every outstanding handle.
    async fn scroll_to(&self, offset: u64) -> Result<()>;

    /// Bring `node` into the active window. Invalidates every outstanding handle.
    async fn scroll_into_view(&self, node: &NodeHandle) -> Result<()>;

    /// All currently materialized nodes matching `selector`, in document order.
    /// Searches the whole materialized set, not only the visible slice.
    async fn query(&self, selector: &str) -> Result<Vec<NodeHandle>>;

    /// Descendants of `scope` matching `selector`, in document order.
    async fn query_within(&self, scope: &NodeHandle, selector: &str) -> Result<Vec<NodeHandle>>;

    /// Nearest ancestor of `node` (or `node` itself) matching `selector`.
    async fn closest(&self, node: &NodeHandle, selector: &str) -> Result<Option<NodeHandle>>;

    /// Rendered text of `node`.
    async fn text(&self, node: &NodeHandle) -> Result<String>;

    /// Rendered paragraphs of `node`, with emphasis markers.
    async fn fragments(&self, node: &NodeHandle) -> Result<Vec<TextFragment>>;

    /// Serialized markup of `node`, byte-for-byte as the source renders it.
    async fn outer_html(&self, node: &NodeHandle) -> Result<String>;

    /// Actuate `node` (e.g. a reveal toggle).
    async fn click(&self, node: &NodeHandle) -> Result<()>;

    /// Zero-based document position of an exchange container, when the
    /// source renders one (virtualized lists usually carry it as an index
    /// attribute such as `aria-posinset`). Survives recycling.
    async fn position(&self, _container: &NodeHandle) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Enumerates the items of a batch and opens each one as a [`ContentSource`].
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    /// Items in traversal order.
    async fn items(&self) -> Result<Vec<SourceItem>>;

    async fn open(&self, item: &SourceItem) -> Result<Box<dyn ContentSource>>;
}

/// Accepts a named blob and writes it all-or-nothing.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    /// Returns the location the blob was written to.
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<String>;
}

/// Sentinel returned when no title could be resolved.
pub const UNTITLED: &str = "Untitled";

/// Best-effort title lookup.
#[async_trait]
pub trait TitleResolver: Send + Sync {
    async fn resolve(&self, item: &SourceItem) -> String;
}

/// Uses the catalog's title, or [`UNTITLED`].
pub struct CatalogTitle;

#[async_trait]
impl TitleResolver for CatalogTitle {
    async fn resolve(&self, item: &SourceItem) -> String {
        item.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| UNTITLED.to_string())
    }
}
