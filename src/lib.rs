//! # Window Digest
//!
//! A resumable pipeline that turns a day of feed posts into one digest.
//!
//! Time is cut into windows anchored at a local wall-clock time (13:00
//! Europe/Riga by default). For each window the pipeline ingests items,
//! summarizes and embeds them, removes exact and near duplicates, and
//! publishes exactly one digest. Every stage commits to SQLite, so a run
//! that dies halfway resumes where it stopped, and a run that repeats
//! finished work does nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌───────────┐
//! │ JSONL feeds │──▶│ ingest → summarize →     │──▶│  Outbox   │
//! └─────────────┘   │ embed → dedup → publish  │   └───────────┘
//!                   └────────────┬─────────────┘
//!                                ▼
//!                   ┌──────────────────────────┐
//!                   │ SQLite: windows, status, │
//!                   │ items, clusters, digests │
//!                   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wdigest init                        # create database
//! wdigest run --date 2026-02-07       # process the window closing that day
//! wdigest status                      # see where each window stands
//! wdigest dups --date 2026-02-07      # exact-duplicate report
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`window`] | Timezone-anchored window computation |
//! | [`normalize`] | Text normalization and content hashing |
//! | [`state`] | Window status, locks and publish records |
//! | [`store`] | Item, summary and cluster persistence |
//! | [`exact_dedup`] | Exact-duplicate grouping |
//! | [`cluster`] | Embedding-based near-duplicate clustering |
//! | [`pipeline`] | Stage orchestration |
//! | [`traits`] | Collaborator traits |
//! | [`source`] | JSON Lines content source |
//! | [`summarize`] | Summarization provider |
//! | [`embedding`] | Embedding provider and vector helpers |
//! | [`publish`] | Digest assembly and outbox publisher |
//! | [`retry`] | Backoff policy for collaborator calls |
//! | [`stats`] | Per-window statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cluster;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod exact_dedup;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod source;
pub mod state;
pub mod stats;
pub mod store;
pub mod summarize;
pub mod traits;
pub mod window;
