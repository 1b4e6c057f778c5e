//! # Answer Harness
//!
//! Grounded question answering over your own documents.
//!
//! Documents are split into positioned chunks, embedded and stored in a
//! vector index. A question is embedded, the nearest chunks are retrieved
//! and reranked, and the surviving passages are numbered and handed to a
//! generator that must cite them inline as `[n]`. Every marker in the
//! returned answer refers to a passage that was actually supplied.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Chunker  │──▶│ Embedding │──▶│  Vector  │──▶│ Retriever│
//! │          │   │ provider  │   │  index   │   │          │
//! └──────────┘   └───────────┘   └──────────┘   └────┬─────┘
//!                                                    ▼
//!                ┌──────────┐   ┌───────────┐   ┌──────────┐
//!                │ Citation │◀──│ Generator │◀──│ Reranker │
//!                │  mapper  │   │ + prompt  │   │          │
//!                └──────────┘   └───────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ans init                          # write config, create index
//! ans ingest ./docs                 # ingest .txt/.md/.markdown/.csv files
//! ans query "What is the return window?"
//! ans serve                         # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error and warning taxonomy |
//! | [`chunk`] | Sentence-aware, token-bounded chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index backends (SQLite, in-memory) |
//! | [`retrieve`] | Query embedding and similarity search |
//! | [`rerank`] | Cross-encoder style reranking with stable order |
//! | [`prompt`] | Grounded prompt construction |
//! | [`generate`] | Answer generation with bounded retry |
//! | [`citation`] | Citation marker validation and mapping |
//! | [`cost`] | Per-query cost estimate |
//! | [`pipeline`] | Ingest and query orchestration |
//! | [`ingest`] | Filesystem ingestion |
//! | [`eval`] | Gold-set evaluation |
//! | [`server`] | HTTP API |

pub mod chunk;
pub mod citation;
pub mod config;
pub mod cost;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod generate;
mod http;
pub mod index;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod rerank;
pub mod retrieve;
pub mod server;
