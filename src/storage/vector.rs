//! Vector storage and similarity search
//!
//! Node embeddings live on the node row as a packed little-endian f32 BLOB.
//! The persistent search path is a linear scan with cosine similarity;
//! rows whose dimensionality differs from the query are skipped. When the
//! database is an ephemeral instance the store keeps a parallel in-memory
//! index with the same interface and cosine semantics.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::Storage;
use crate::error::Result;
use crate::types::NodeId;

/// Encode an embedding as a packed little-endian f32 blob
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a packed little-endian f32 blob; length determines dimensions
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Vector index over node embeddings
///
/// Borrows the shared storage handle; does not own its lifecycle.
pub struct VectorStore {
    storage: Storage,
    /// Parallel index for the ephemeral mode; entries may go stale after
    /// node deletion and are skipped at query time.
    ephemeral: Option<Arc<RwLock<HashMap<NodeId, Vec<f32>>>>>,
}

impl VectorStore {
    pub fn new(storage: Storage) -> Self {
        let ephemeral = if storage.is_ephemeral() {
            Some(Arc::new(RwLock::new(HashMap::new())))
        } else {
            None
        };
        Self { storage, ephemeral }
    }

    /// Register an embedding after the node row is written
    ///
    /// No-op in persistent mode where the row blob is authoritative.
    pub fn index(&self, node_id: &str, embedding: &[f32]) {
        if let Some(map) = &self.ephemeral {
            map.write().insert(node_id.to_string(), embedding.to_vec());
        }
    }

    /// Drop entries for deleted nodes
    pub fn remove(&self, node_ids: &[NodeId]) {
        if let Some(map) = &self.ephemeral {
            let mut map = map.write();
            for id in node_ids {
                map.remove(id);
            }
        }
    }

    /// Top-k node ids by cosine similarity, descending
    ///
    /// Candidates with a different dimensionality than the query are
    /// skipped. Returned ids are not guaranteed to resolve (stale entries);
    /// callers must skip ids that no longer exist.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        if query.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<(NodeId, f32)> = if let Some(map) = &self.ephemeral {
            map.read()
                .iter()
                .filter(|(_, emb)| emb.len() == query.len())
                .map(|(id, emb)| (id.clone(), cosine_similarity(query, emb)))
                .collect()
        } else {
            self.storage.with_connection(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, embedding FROM nodes WHERE embedding IS NOT NULL",
                )?;
                let rows: Vec<(NodeId, Vec<u8>)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<_>>()?;

                Ok(rows
                    .into_iter()
                    .map(|(id, blob)| (id, blob_to_embedding(&blob)))
                    .filter(|(_, emb)| emb.len() == query.len())
                    .map(|(id, emb)| (id, cosine_similarity(query, &emb)))
                    .collect())
            })?
        };

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}
