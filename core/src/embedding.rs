//! Embedding Engine: lazy-loaded sentence embeddings, cosine similarity,
//! and the length-prefixed byte encoding stored in the conversation store.
//!
//! Grounded in the teacher's `memory::store::VectorStore`
//! (`core/src/memory/store.rs`): same model (`fastembed::TextEmbedding`,
//! `EmbeddingModel::BGESmallENV15`, 384 dims) and the same
//! `task::spawn_blocking` pattern for running the (blocking) embedding
//! call off the async runtime. The teacher stored vectors as Arrow
//! `FixedSizeListArray` columns inside LanceDB; since the store is now
//! relational (§store), vectors are instead serialized to a flat
//! length-prefixed `f32` byte blob for storage as a `BLOB` column.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Dimensionality of the BGE-Small-EN-v1.5 embedding model.
pub const EMBEDDING_DIM: usize = 384;

static MODEL: OnceCell<Arc<Mutex<TextEmbedding>>> = OnceCell::const_new();

async fn model() -> Result<Arc<Mutex<TextEmbedding>>, String> {
    MODEL
        .get_or_try_init(|| async {
            tokio::task::spawn_blocking(|| {
                let cache_dir = dirs::cache_dir()
                    .map(|d| d.join("orchestrator").join("models"))
                    .unwrap_or_else(|| std::path::PathBuf::from(".cache/orchestrator/models"));
                std::fs::create_dir_all(&cache_dir).map_err(|e| e.to_string())?;
                TextEmbedding::try_new(InitOptions::new(EmbeddingModel::BGESmallENV15).with_cache_dir(cache_dir))
                    .map(|m| Arc::new(Mutex::new(m)))
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())?
        })
        .await
        .cloned()
}

/// Produce a fixed-dimension embedding vector for `text`.
///
/// The model loads lazily on first call, behind a [`tokio::sync::OnceCell`]
/// so concurrent first-callers await the same initialization rather than
/// racing to load the model twice (thundering-herd safety, spec §5).
/// Failures are logged and surfaced as `None` so callers can skip
/// semantic scoring for the record rather than failing the whole
/// operation — embeddings are a best-effort enhancement, never a hard
/// dependency for a chain call to complete.
pub async fn embed(text: &str) -> Option<Vec<f32>> {
    let model = match model().await {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "failed to initialize embedding model");
            return None;
        }
    };

    let owned = text.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = model.blocking_lock();
        guard.embed(vec![owned], None)
    })
    .await;

    match result {
        Ok(Ok(mut vectors)) if !vectors.is_empty() => Some(vectors.remove(0)),
        Ok(Ok(_)) => {
            tracing::warn!("embedding model returned no vectors");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "embedding generation failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding task panicked");
            None
        }
    }
}

/// Cosine similarity in `[-1, 1]`. Defined as 0 if either vector has zero
/// norm, to avoid a division by zero silently producing `NaN`.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Serialize a vector to a length-prefixed little-endian `f32` byte blob:
/// a 4-byte element count followed by that many 4-byte floats.
pub fn serialize(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + vector.len() * 4);
    out.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Deserialize a blob produced by [`serialize`]. Returns `None` on a
/// truncated or malformed blob rather than panicking.
pub fn deserialize(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(blob[0..4].try_into().ok()?) as usize;
    let expected_len = 4 + len * 4;
    if blob.len() != expected_len {
        return None;
    }
    let mut vector = Vec::with_capacity(len);
    for chunk in blob[4..].chunks_exact(4) {
        vector.push(f32::from_le_bytes(chunk.try_into().ok()?));
    }
    Some(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trips() {
        let original = vec![0.1_f32, -0.5, 1.0, 0.0];
        let blob = serialize(&original);
        let restored = deserialize(&blob).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn deserialize_rejects_truncated_blob() {
        let blob = serialize(&[1.0, 2.0, 3.0]);
        assert!(deserialize(&blob[..blob.len() - 1]).is_none());
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero_not_nan() {
        let a = vec![0.0_f32, 0.0];
        let b = vec![1.0_f32, 1.0];
        assert_eq!(cosine(&a, &b), 0.0);
    }
}
