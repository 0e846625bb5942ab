//! # convo-evidence
//!
//! Extracts conversation records from a long, windowed, recycling document
//! list, reveals the hidden "thinking" content inside it, and packages each
//! conversation as a hash-verifiable evidence file.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────────────┐   ┌───────────┐   ┌───────────┐
//! │ ItemCatalog │──▶│ Strategy selector   │──▶│ Assembler │──▶│ Integrity │
//! │ (fixtures)  │   │ + sweep extractor   │   │           │   │  proof    │
//! └─────────────┘   └────────────────────┘   └───────────┘   └─────┬─────┘
//!        ▲                                                         │
//!        │                 ┌──────────────┐                        ▼
//!        └─────────────────│ Orchestrator │──────────────▶ EvidenceSink
//!                          └──────────────┘                (atomic files)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cev run --config ./config/cev.toml     # export every fixture
//! cev verify evidence/*.json             # recompute both digests
//! cev diagnose evidence/                 # thinking coverage report
//! cev inspect fixtures/trip.json         # structured output, no write
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the evidence file format |
//! | [`error`] | Typed error kinds |
//! | [`traits`] | Content source, catalog, sink and title seams |
//! | [`identity`] | Stable content identity and item identity normalization |
//! | [`strategy`] | Revelation strategies and the fallback selector |
//! | [`extract`] | Virtualization-aware sweep and stage parsing |
//! | [`assemble`] | Exchange/message assembly and schema checks |
//! | [`integrity`] | Digests, canonical JSON, record packaging, verification |
//! | [`orchestrator`] | Batch state machine and pacing |
//! | [`progress`] | Progress reporting on stderr |
//! | [`replay`] | Fixture-backed windowed content source and catalog |
//! | [`sink`] | Atomic directory sink |
//! | [`diagnose`] | Thinking-block diagnostics |

pub mod assemble;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod extract;
pub mod identity;
pub mod integrity;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod replay;
pub mod sink;
pub mod strategy;
pub mod traits;
