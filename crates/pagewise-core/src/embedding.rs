//! Vector utilities and the local fallback embedder.
//!
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian f32 BLOB encoding for SQLite
//! - [`cosine_similarity`]: similarity between two vectors
//! - [`content_hash`]: SHA-256 of the text an embedding was computed from
//! - [`hash_embed`]: deterministic feature-hashing embedder used when no
//!   remote embedding capability is available
//! - [`rank_by_similarity`]: score cached embeddings against a query vector

use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::models::PageEmbedding;

/// Model name recorded for vectors produced by [`hash_embed`].
pub const HASH_EMBED_MODEL: &str = "local-hash-v1";

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use pagewise_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB back into a float vector. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Deterministic bag-of-words embedding via feature hashing.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets
/// with a hash-derived sign, and the result is L2-normalized. Texts that
/// share vocabulary land close together; it needs no network and no model
/// download.
pub fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    if dims == 0 {
        return vec;
    }

    let lowered = text.to_lowercase();
    for token in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
    {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) % dims as u64;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket as usize] += sign;
    }

    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// A cached embedding scored against a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPage {
    pub page_id: String,
    pub similarity: f32,
}

/// Scores `embeddings` against `query_vec`, keeping only vectors produced by
/// `model` with matching dimensionality and similarity `>= min_similarity`.
///
/// Results are sorted by similarity descending, then page id ascending.
pub fn rank_by_similarity<'a>(
    query_vec: &[f32],
    model: &str,
    embeddings: impl IntoIterator<Item = &'a PageEmbedding>,
    min_similarity: f32,
) -> Vec<ScoredPage> {
    let mut scored: Vec<ScoredPage> = embeddings
        .into_iter()
        .filter(|e| e.model == model && e.vector.len() == query_vec.len())
        .map(|e| ScoredPage {
            page_id: e.page_id.clone(),
            similarity: cosine_similarity(query_vec, &e.vector),
        })
        .filter(|s| s.similarity >= min_similarity)
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.page_id.cmp(&b.page_id))
    });
    scored
}
