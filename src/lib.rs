//! Noema - Knowledge-Graph Memory Engine
//!
//! Embeddable memory for AI assistants: structured memory records are
//! persisted, cognified into a shared entity/relation graph with vector
//! embeddings, and retrieved through hybrid semantic+structural search
//! under a lifecycle policy (decay, supersession, retention, pinning,
//! pruning).

pub mod error;
pub mod extract;
pub mod ids;
pub mod pipeline;
pub mod providers;
pub mod prune;
pub mod search;
pub mod storage;
pub mod types;

pub use error::{NoemaError, Result};
pub use storage::Storage;
pub use types::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use extract::Orchestrator;
use pipeline::cognify::BufferedDoc;
use pipeline::MemoryPipeline;
use providers::{create_embedder, create_llm, Embedder, LlmProvider};
use prune::PruneEngine;
use search::decay::DecayingSearch;
use search::SearchEngine;
use storage::vector::VectorStore;
use storage::{graph_queries, memory_queries, provenance};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The engine facade
///
/// Composes the persistence store, extraction orchestrator, memory
/// pipeline, hybrid search with decay, and the prune engine behind a
/// small surface. Clone-cheap subsystems share one storage handle; the
/// facade owns its lifecycle.
pub struct Noema {
    config: NoemaConfig,
    storage: Storage,
    pipeline: Arc<MemoryPipeline>,
    search: DecayingSearch,
    prune: PruneEngine,
    buffer: Mutex<Vec<BufferedDoc>>,
    last_cognified_at: Mutex<Option<DateTime<Utc>>>,
}

impl Noema {
    /// Open the engine with providers resolved from configuration
    pub fn new(config: NoemaConfig) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let llm = create_llm(&config.llm)?;
        Self::with_providers(config, embedder, llm)
    }

    /// Open the engine with explicitly injected providers
    ///
    /// Useful for tests and for callers that bring their own transport.
    pub fn with_providers(
        config: NoemaConfig,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        let storage = Storage::open(&config.db_path)?;
        let vectors = Arc::new(VectorStore::new(storage.clone()));

        let orchestrator = llm.map(|llm| Arc::new(Orchestrator::new(llm, config.retry.clone())));

        let pipeline = Arc::new(MemoryPipeline::new(
            storage.clone(),
            vectors.clone(),
            orchestrator,
            embedder.clone(),
            config.chunking.clone(),
        ));

        let search_engine = SearchEngine::new(storage.clone(), vectors, embedder);
        let search = DecayingSearch::new(search_engine, config.decay.clone());
        let prune = PruneEngine::new(pipeline.clone(), config.decay.clone());

        info!(db_path = %config.db_path, "noema engine opened");

        Ok(Self {
            config,
            storage,
            pipeline,
            search,
            prune,
            buffer: Mutex::new(Vec::new()),
            last_cognified_at: Mutex::new(None),
        })
    }

    /// Buffer a document for the next cognify pass
    pub fn add(&self, text: impl Into<String>, source: Option<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.buffer.lock().push(BufferedDoc { text, source });
    }

    /// Process all buffered documents into the graph
    ///
    /// The buffer is drained on entry and stays empty regardless of
    /// errors. Artifacts created here are legacy: no provenance, exempt
    /// from GC.
    pub fn cognify(&self, options: CognifyOptions, cancel: &CancelToken) -> Result<CognifyResult> {
        let docs = std::mem::take(&mut *self.buffer.lock());
        let result = self.pipeline.cognify(&docs, &options, cancel)?;
        *self.last_cognified_at.lock() = Some(Utc::now());
        Ok(result)
    }

    /// Create a memory and derive its graph artifacts
    pub fn add_memory(&self, input: AddMemoryInput, cancel: &CancelToken) -> Result<MemoryResult> {
        self.pipeline.add_memory(input, cancel)
    }

    /// Fetch a memory by id
    pub fn get_memory(&self, id: &str) -> Result<MemoryRecord> {
        self.storage
            .with_connection(|conn| memory_queries::get_memory(conn, id))
    }

    /// List memories with filters and pagination
    pub fn list_memories(&self, options: ListMemoriesOptions) -> Result<Vec<MemoryRecord>> {
        self.storage
            .with_connection(|conn| memory_queries::list_memories(conn, &options))
    }

    /// Apply a partial update; payload changes re-cognify and GC
    pub fn update_memory(
        &self,
        id: &str,
        input: UpdateMemoryInput,
        cancel: &CancelToken,
    ) -> Result<MemoryResult> {
        self.pipeline.update_memory(id, input, cancel)
    }

    /// Delete a memory, cascading provenance and collecting unreferenced
    /// artifacts
    pub fn delete_memory(&self, id: &str, cancel: &CancelToken) -> Result<()> {
        self.pipeline.delete_memory(id, cancel)
    }

    /// Pin a memory, exempting it from decay and prune
    pub fn pin_memory(&self, id: &str, reason: Option<&str>) -> Result<()> {
        self.storage
            .with_transaction(|conn| memory_queries::set_pinned(conn, id, true, reason))
    }

    /// Unpin a memory
    pub fn unpin_memory(&self, id: &str) -> Result<()> {
        self.storage
            .with_transaction(|conn| memory_queries::set_pinned(conn, id, false, None))
    }

    /// Hybrid search with optional decay scoring and access reinforcement
    pub fn search(
        &self,
        query: &str,
        options: SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        self.search.search(query, &options, cancel)
    }

    /// Evaluate and apply the prune policy
    pub fn prune(&self, options: PruneOptions, cancel: &CancelToken) -> Result<PruneResult> {
        self.prune.prune(&options, cancel)
    }

    /// Engine statistics
    pub fn stats(&self) -> Result<Stats> {
        let (node_count, edge_count, memory_count, by_status, by_retention, pinned_count) =
            self.storage.with_connection(|conn| {
                let nodes = graph_queries::node_count(conn)?;
                let edges = graph_queries::edge_count(conn)?;
                let memories = memory_queries::count_memories(conn)?;
                let (by_status, by_retention, pinned) = memory_queries::memory_stats(conn)?;
                Ok((nodes, edges, memories, by_status, by_retention, pinned))
            })?;

        Ok(Stats {
            node_count,
            edge_count,
            memory_count,
            buffered_docs: self.buffer.lock().len(),
            last_cognified_at: *self.last_cognified_at.lock(),
            memories_by_status: by_status,
            memories_by_retention: by_retention,
            pinned_count,
            db_size_bytes: self.storage.db_size()?,
        })
    }

    /// Total memory count
    pub fn count_memories(&self) -> Result<i64> {
        self.storage.with_connection(memory_queries::count_memories)
    }

    /// Fetch a node by id, updating its last access time
    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.storage
            .with_connection(|conn| graph_queries::get_node(conn, id))
    }

    /// Single-result node lookup by name
    ///
    /// Fails with AmbiguousNode on multiple matches.
    pub fn get_node_by_name(&self, name: &str) -> Result<Node> {
        self.storage
            .with_connection(|conn| graph_queries::get_node_by_name(conn, name))
    }

    /// Direction-agnostic BFS neighborhood of a node
    pub fn neighbors(&self, node_id: &str, depth: usize) -> Result<Vec<(NodeId, usize)>> {
        self.storage
            .with_connection(|conn| graph_queries::neighbors(conn, node_id, depth))
    }

    /// All edges touching a node
    pub fn incident_edges(&self, node_id: &str) -> Result<Vec<Edge>> {
        self.storage
            .with_connection(|conn| graph_queries::incident_edges(conn, node_id))
    }

    /// Provenance claims of a memory
    pub fn provenance_by_memory(&self, memory_id: &str) -> Result<(Vec<NodeId>, Vec<EdgeId>)> {
        self.storage
            .with_connection(|conn| provenance::provenance_by_memory(conn, memory_id))
    }

    /// Number of memories referencing a node
    pub fn count_memory_references(&self, node_id: &str) -> Result<i64> {
        self.storage
            .with_connection(|conn| provenance::count_node_references(conn, node_id))
    }

    /// Full superseded lineage below a memory
    pub fn supersession_chain(&self, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
        self.storage
            .with_connection(|conn| provenance::supersession_chain(conn, memory_id))
    }

    /// Direct links where this memory supersedes others
    pub fn superseding_of(&self, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
        self.storage
            .with_connection(|conn| provenance::superseding_of(conn, memory_id))
    }

    /// Direct links where this memory has been superseded
    pub fn superseded_by(&self, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
        self.storage
            .with_connection(|conn| provenance::superseded_by(conn, memory_id))
    }

    /// Drop the processed-document cache, forcing full re-ingest
    pub fn clear_processed_documents(&self) -> Result<usize> {
        self.storage
            .with_transaction(provenance::clear_processed_documents)
    }

    /// Engine configuration
    pub fn config(&self) -> &NoemaConfig {
        &self.config
    }

    /// Flush and checkpoint the underlying store
    pub fn close(&self) -> Result<()> {
        self.buffer.lock().clear();
        self.storage.checkpoint()?;
        info!("noema engine closed");
        Ok(())
    }
}
