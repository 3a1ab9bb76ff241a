//! # Pagewise Core
//!
//! Runtime-free logic for Pagewise: data models and the ask error taxonomy,
//! store traits with an in-memory implementation, vector math with the
//! local fallback embedder, and injection-resistant prompt assembly.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies.

pub mod embedding;
pub mod models;
pub mod prompt;
pub mod store;
