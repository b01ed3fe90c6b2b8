//! # Topic Discovery
//!
//! Finds latent topics in a collection of documents. Documents are split
//! into overlapping fragments, embedded, clustered with seeded k-means,
//! named and summarized by a generative text service, scored for
//! per-document relevance and linked into a similarity graph. Each run is
//! a discovery job whose result replaces the collection's previous topics
//! atomically.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌──────────────┐
//! │ Documents │──▶│ Fragments │──▶│ Embedder │──▶│ k-means      │
//! └───────────┘   └───────────┘   └──────────┘   └──────┬───────┘
//!                                                       ▼
//! ┌───────────┐   ┌───────────────┐   ┌───────────┐   ┌──────────────┐
//! │  SQLite   │◀──│ Relationships │◀──│ Relevance │◀──│ Labels and   │
//! │ (commit)  │   │ graph         │   │ scoring   │   │ insights     │
//! └───────────┘   └───────────────┘   └───────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! topics init
//! topics collection create research
//! topics ingest 1 ./papers
//! topics discover 1
//! topics list 1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Core data types |
//! | [`fragment`] | Overlapping-window fragmenter |
//! | [`embedding`] | Embedding providers and the batching embedder |
//! | [`similarity`] | Cosine similarity and vector means |
//! | [`cluster`] | k selection, seeded k-means, representatives |
//! | [`generation`] | Generative text providers |
//! | [`labeling`] | Topic names and insights with fallbacks |
//! | [`relevance`] | Document-topic relevance |
//! | [`relationships`] | Topic similarity graph |
//! | [`job`] | Job status machine and progress stages |
//! | [`store`] | Persistence and atomic topic-generation swap |
//! | [`discovery`] | Job orchestration |
//! | [`citation`] | `D{doc}-C{index}` fragment addressing |
//! | [`ingest`] | Filesystem document loading |

pub mod citation;
pub mod cluster;
pub mod config;
pub mod db;
pub mod discovery;
pub mod embedding;
pub mod fragment;
pub mod generation;
pub mod ingest;
pub mod job;
pub mod labeling;
pub mod migrate;
pub mod models;
pub mod relationships;
pub mod relevance;
pub mod similarity;
pub mod store;
