//! # repodoc
//!
//! Evidence-grounded technical documentation for source repositories.
//!
//! repodoc reads a repository checkout, splits it into line-exact chunks,
//! embeds them into a prose and a code index, and writes each documentation
//! section through a write → judge → revise loop. Every factual claim in the
//! output carries a `[path:start-end]` citation that resolves to a chunk the
//! section actually retrieved.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │ Snapshot │──▶│ Chunker  │──▶│ Index build  │──▶│ Sections  │
//! │  (fs)    │   │ prose +  │   │ text / code  │   │ retrieve  │
//! └──────────┘   │ syntax   │   │ + SQLite     │   │ draft     │
//!                └──────────┘   │   cache      │   │ judge     │
//!                               └──────────────┘   └─────┬─────┘
//!                                                        ▼
//!                                         Markdown + manifest.json
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repodoc init                          # create database
//! repodoc chunk ./my-repo --json        # inspect the chunk set
//! repodoc index ./my-repo               # embed, reusing cached vectors
//! repodoc generate ./my-repo --out docs # write sections and manifest
//! repodoc verdicts --section api        # audit trail
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`snapshot`] | Repository file discovery |
//! | [`chunk`] | Prose chunker and paragraph fallback |
//! | [`syntax`] | tree-sitter definition spans |
//! | [`embedding`] | Embedding capability and providers |
//! | [`llm`] | Writer and judge capabilities |
//! | [`retry`] | Timeouts and bounded backoff |
//! | [`index`] | Vector collections and the index build |
//! | [`retrieve`] | Evidence retrieval and context rendering |
//! | [`citation`] | Citation grammar and resolution |
//! | [`draft`] | Drafter |
//! | [`judge`] | Judge |
//! | [`plan`] | Section dependency graph |
//! | [`orchestrator`] | Section state machine and scheduling |
//! | [`context`] | Per-run context |
//! | [`pipeline`] | End-to-end run |
//! | [`export`] | Section files and manifest |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Embedding cache and audit log |

pub mod chunk;
pub mod citation;
pub mod config;
pub mod context;
pub mod db;
pub mod draft;
pub mod embedding;
pub mod error;
pub mod export;
pub mod index;
pub mod judge;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod retrieve;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod syntax;
