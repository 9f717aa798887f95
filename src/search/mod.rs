//! Hybrid retrieval: vector similarity, graph expansion, score composition
//!
//! Scores compose deterministically: a node's combined score is its cosine
//! similarity (when found by vector) plus 1/(1+depth) (when discovered by
//! graph expansion, shortest depth winning). Returned nodes and their
//! attached memories receive batched access reinforcement.

pub mod decay;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NoemaError, Result};
use crate::providers::Embedder;
use crate::storage::vector::VectorStore;
use crate::storage::{graph_queries, memory_queries, provenance, Storage};
use crate::types::{
    CancelToken, MemoryId, NodeId, ResultSource, SearchMode, SearchOptions, SearchResult,
    DEFAULT_GRAPH_DEPTH, DEFAULT_TOP_K,
};

/// Per-node hit accumulator before composition
#[derive(Debug, Default)]
struct Hit {
    vector_score: Option<f64>,
    graph_score: Option<f64>,
    graph_depth: Option<usize>,
}

/// Hybrid search engine over the shared storage handle
pub struct SearchEngine {
    storage: Storage,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl SearchEngine {
    pub fn new(storage: Storage, vectors: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            vectors,
            embedder,
        }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run a search and apply access reinforcement to what it returns
    pub fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        let top_k = options.top_k.unwrap_or(DEFAULT_TOP_K).max(1);
        let graph_depth = options.graph_depth.unwrap_or(DEFAULT_GRAPH_DEPTH).max(1);

        let mut hits: HashMap<NodeId, Hit> = HashMap::new();

        match options.mode {
            SearchMode::Graph => {
                if options.seed_node_ids.is_empty() {
                    return Err(NoemaError::InvalidInput(
                        "graph mode requires seed_node_ids".to_string(),
                    ));
                }
                self.expand_seeds(&options.seed_node_ids, graph_depth, &mut hits)?;
            }
            SearchMode::Vector => {
                self.vector_candidates(query, top_k, cancel, &mut hits)?;
            }
            SearchMode::Hybrid => {
                self.vector_candidates(query, top_k, cancel, &mut hits)?;
                let vector_ids: Vec<NodeId> = hits.keys().cloned().collect();
                self.expand_neighbors(&vector_ids, graph_depth, &mut hits)?;
            }
        }

        // Resolve nodes, skipping stale index entries, and compose scores
        let mut results: Vec<SearchResult> = Vec::new();
        self.storage.with_connection(|conn| {
            for (node_id, hit) in &hits {
                let Some(node) = graph_queries::fetch_node(conn, node_id)? else {
                    continue;
                };

                let vector = hit.vector_score.unwrap_or(0.0);
                let graph = hit.graph_score.unwrap_or(0.0);
                let source = match (hit.vector_score.is_some(), hit.graph_score.is_some()) {
                    (true, true) => ResultSource::Hybrid,
                    (true, false) => ResultSource::Vector,
                    _ => ResultSource::Graph,
                };

                results.push(SearchResult {
                    node_id: node_id.clone(),
                    node,
                    score: vector + graph,
                    source,
                    graph_depth: if hit.vector_score.is_some() {
                        0
                    } else {
                        hit.graph_depth.unwrap_or(0)
                    },
                    memory_ids: vec![],
                });
            }
            Ok(())
        })?;

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        results.truncate(top_k);

        cancel.check("search reinforcement")?;
        self.reinforce_and_enrich(&mut results, options.include_memories)?;

        debug!(query_len = query.len(), results = results.len(), "search complete");
        Ok(results)
    }

    /// Vector candidates by cosine similarity
    ///
    /// Over-fetches to keep the final cut well-populated after stale
    /// entries are skipped.
    fn vector_candidates(
        &self,
        query: &str,
        top_k: usize,
        cancel: &CancelToken,
        hits: &mut HashMap<NodeId, Hit>,
    ) -> Result<()> {
        cancel.check("query embedding")?;
        let query_embedding = self.embedder.embed(query)?;

        let candidate_count = (2 * top_k).max(20);
        for (node_id, score) in self.vectors.search(&query_embedding, candidate_count)? {
            hits.entry(node_id).or_default().vector_score = Some(score as f64);
        }

        Ok(())
    }

    /// BFS expansion from vector hits; discovered nodes score 1/(1+depth)
    /// with the shortest depth kept across multiple paths
    fn expand_neighbors(
        &self,
        from: &[NodeId],
        depth: usize,
        hits: &mut HashMap<NodeId, Hit>,
    ) -> Result<()> {
        self.storage.with_connection(|conn| {
            for node_id in from {
                for (neighbor, found_depth) in graph_queries::neighbors(conn, node_id, depth)? {
                    let entry = hits.entry(neighbor).or_default();
                    let score = 1.0 / (1.0 + found_depth as f64);
                    match entry.graph_depth {
                        Some(existing) if existing <= found_depth => {}
                        _ => {
                            entry.graph_depth = Some(found_depth);
                            entry.graph_score = Some(score);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Graph-only mode: seeds score 1.0, expansion scores 1/(1+depth)
    fn expand_seeds(
        &self,
        seeds: &[NodeId],
        depth: usize,
        hits: &mut HashMap<NodeId, Hit>,
    ) -> Result<()> {
        for seed in seeds {
            let entry = hits.entry(seed.clone()).or_default();
            entry.graph_score = Some(1.0);
            entry.graph_depth = Some(0);
        }
        self.expand_neighbors(seeds, depth, hits)
    }

    /// Batched access reinforcement and provenance enrichment
    ///
    /// One statement refreshes the returned nodes, one the attached
    /// memories; the memory lookup runs once for the whole result set.
    fn reinforce_and_enrich(
        &self,
        results: &mut [SearchResult],
        include_memories: bool,
    ) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let node_ids: Vec<NodeId> = results.iter().map(|r| r.node_id.clone()).collect();

        self.storage.with_transaction(|conn| {
            let memories_by_node = provenance::memories_by_node_batched(conn, &node_ids)?;

            let mut distinct: Vec<MemoryId> = Vec::new();
            for ids in memories_by_node.values() {
                for id in ids {
                    if !distinct.contains(id) {
                        distinct.push(id.clone());
                    }
                }
            }

            graph_queries::update_access_time(conn, &node_ids)?;
            memory_queries::batch_update_memory_access(conn, &distinct)?;

            if include_memories {
                for result in results.iter_mut() {
                    if let Some(ids) = memories_by_node.get(&result.node_id) {
                        result.memory_ids = ids.clone();
                    }
                }
            }

            Ok(())
        })
    }
}

/// Internal helper shared with the decay decorator: resolve the memories
/// attached to a set of nodes without mutating access state.
pub(crate) fn attached_memories(
    storage: &Storage,
    node_ids: &[NodeId],
) -> Result<HashMap<NodeId, Vec<MemoryId>>> {
    storage.with_connection(|conn| provenance::memories_by_node_batched(conn, node_ids))
}
