//! # Pagewise
//!
//! Grounded question answering over a user's own pages, answered by the
//! user's own AI provider key.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌──────────┐
//! │ throttle │──▶│   keys   │──▶│ retriever │──▶│  prompt   │──▶│ provider │
//! │ (admit)  │   │ (select) │   │ (pages)   │   │ (3 block) │   │ generate │
//! └──────────┘   └──────────┘   └─────┬─────┘   └───────────┘   └────┬─────┘
//!                                     │                              │
//!                              ┌──────┴──────┐                ┌──────┴─────┐
//!                              │  embedding  │◀─ embed_worker │ AskRequest │
//!                              │    cache    │                │ (finalize) │
//!                              └─────────────┘                └──────┬─────┘
//!                                                                    │
//!                                                               reconcile
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`settings`] | Hot-reloadable settings source |
//! | [`throttle`] | Per-user sliding-window admission control |
//! | [`providers`] | Provider registry and the `AiProvider` capability trait |
//! | [`keys`] | Key resolution and lazy validation |
//! | [`embedding`] | Corpus embedders |
//! | [`embed_worker`] | Background embedding cache maintenance |
//! | [`retriever`] | Explicit and semantic page selection |
//! | [`ask`] | The ask orchestrator |
//! | [`reconcile`] | Sweep of abandoned pending requests |
//! | [`import`] | Page import |
//! | [`db`] / [`migrate`] / [`sqlite_store`] | SQLite persistence |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod app;
pub mod ask;
pub mod commands;
pub mod config;
pub mod db;
pub mod embed_worker;
pub mod embedding;
pub mod import;
pub mod keys;
pub mod migrate;
pub mod providers;
pub mod reconcile;
pub mod retriever;
pub mod server;
pub mod settings;
pub mod sqlite_store;
pub mod throttle;

pub use pagewise_core::{models, prompt, store};
