//! Memory pipeline: the two-phase persistence protocol
//!
//! Memories and their derived graph artifacts are written without holding
//! a database transaction across slow provider calls. Phase 1 inserts the
//! memory as pending in a short transaction; extraction and embedding run
//! outside any transaction; Phase 2 upserts nodes and edges, links
//! provenance and flips the status to complete in a second short
//! transaction. Observers see the memory first as pending, then as
//! complete with linked provenance, never in between.

pub mod cognify;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{NoemaError, Result};
use crate::extract::Orchestrator;
use crate::ids;
use crate::providers::Embedder;
use crate::storage::vector::VectorStore;
use crate::storage::{graph_queries, memory_queries, provenance, Storage};
use crate::types::{
    AddMemoryInput, CancelToken, ChunkConfig, Edge, EdgeId, EntityType, MemoryRecord, MemoryResult,
    MemoryStatus, Node, NodeId, UpdateMemoryInput,
};

/// Nodes and edges derived from one chunk of text
pub(crate) struct GraphFragment {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub edges_skipped: usize,
    pub warnings: Vec<String>,
}

impl GraphFragment {
    fn empty() -> Self {
        Self {
            nodes: vec![],
            edges: vec![],
            edges_skipped: 0,
            warnings: vec![],
        }
    }
}

/// Memory pipeline over the shared storage handle
pub struct MemoryPipeline {
    storage: Storage,
    vectors: Arc<VectorStore>,
    orchestrator: Option<Arc<Orchestrator>>,
    embedder: Arc<dyn Embedder>,
    pub(crate) chunking: ChunkConfig,
}

impl MemoryPipeline {
    pub fn new(
        storage: Storage,
        vectors: Arc<VectorStore>,
        orchestrator: Option<Arc<Orchestrator>>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkConfig,
    ) -> Self {
        Self {
            storage,
            vectors,
            orchestrator,
            embedder,
            chunking,
        }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    /// Create a memory and cognify it into the graph
    ///
    /// Phase 1 inserts the record as pending; if a memory with the same
    /// doc_hash already exists its id is returned with no graph work.
    /// On extraction failure the memory stays pending and the error is
    /// surfaced in the result; re-running the operation recovers.
    pub fn add_memory(&self, input: AddMemoryInput, cancel: &CancelToken) -> Result<MemoryResult> {
        validate_add_input(&input)?;
        cancel.check("add_memory")?;

        let doc_hash = ids::doc_hash(
            &input.topic,
            &input.context,
            &input.decisions,
            &input.rationale,
        );

        let now = Utc::now();
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            topic: input.topic.clone(),
            context: input.context.clone(),
            decisions: input.decisions.clone(),
            rationale: input.rationale.clone(),
            metadata: input.metadata.clone(),
            source: input.source.clone(),
            status: MemoryStatus::Pending,
            doc_hash: doc_hash.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            access_count: 0,
            access_velocity: 0.0,
            retention_policy: input.retention_policy,
            pinned: false,
            pinned_at: None,
            pinned_reason: None,
        };

        // Phase 1: dedup check and pending insert in one short transaction
        let existing = self.storage.with_transaction(|conn| {
            if let Some(existing) = memory_queries::find_by_doc_hash(conn, &doc_hash)? {
                return Ok(Some(existing));
            }
            memory_queries::insert_memory(conn, &record)?;
            Ok(None)
        })?;

        if let Some(existing) = existing {
            debug!(id = %existing.id, "duplicate payload, returning existing memory");
            return Ok(MemoryResult {
                id: existing.id,
                status: existing.status,
                memories_superseded: 0,
                nodes_created: 0,
                edges_created: 0,
                edges_skipped: 0,
                errors: vec![],
            });
        }

        // Phase 2: extraction and embedding, outside any transaction
        let payload_text = memory_payload_text(&input);
        let fragment = match self.build_fragment(&payload_text, cancel) {
            Ok(fragment) => fragment,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(id = %record.id, error = %err, "extraction failed, memory left pending");
                return Ok(MemoryResult {
                    id: record.id,
                    status: MemoryStatus::Pending,
                    memories_superseded: 0,
                    nodes_created: 0,
                    edges_created: 0,
                    edges_skipped: 0,
                    errors: vec![err.to_string()],
                });
            }
        };

        cancel.check("add_memory commit")?;

        // Phase 3: graph write, provenance, completion, supersession
        let mut errors = fragment.warnings.clone();
        let mut superseded = 0usize;
        let supersedes = input.supersedes.clone();
        let reason = input.supersede_reason.clone();

        self.storage.with_transaction(|conn| {
            for node in &fragment.nodes {
                graph_queries::upsert_node(conn, node)?;
            }
            for edge in &fragment.edges {
                graph_queries::upsert_edge(conn, edge)?;
            }

            let node_ids: Vec<NodeId> = fragment.nodes.iter().map(|n| n.id.clone()).collect();
            let edge_ids: Vec<EdgeId> = fragment.edges.iter().map(|e| e.id.clone()).collect();
            provenance::link_provenance(conn, &record.id, &node_ids, &edge_ids)?;
            memory_queries::set_memory_status(conn, &record.id, MemoryStatus::Complete)?;

            for superseded_id in &supersedes {
                match provenance::record_supersession(conn, &record.id, superseded_id, reason.as_deref())
                {
                    Ok(()) => superseded += 1,
                    Err(err) => errors.push(err.to_string()),
                }
            }

            Ok(())
        })?;

        for node in &fragment.nodes {
            if let Some(embedding) = &node.embedding {
                self.vectors.index(&node.id, embedding);
            }
        }

        info!(
            id = %record.id,
            nodes = fragment.nodes.len(),
            edges = fragment.edges.len(),
            "memory added"
        );

        Ok(MemoryResult {
            id: record.id,
            status: MemoryStatus::Complete,
            memories_superseded: superseded,
            nodes_created: fragment.nodes.len(),
            edges_created: fragment.edges.len(),
            edges_skipped: fragment.edges_skipped,
            errors,
        })
    }

    /// Apply a partial update; payload changes trigger re-cognify and GC
    pub fn update_memory(
        &self,
        id: &str,
        input: UpdateMemoryInput,
        cancel: &CancelToken,
    ) -> Result<MemoryResult> {
        cancel.check("update_memory")?;
        let recognify = input.changes_payload();

        // Capture current provenance and apply the field update in one
        // short transaction.
        let (record, old_nodes, old_edges) = self.storage.with_transaction(|conn| {
            let mut record = memory_queries::get_memory(conn, id)?;

            if let Some(expected) = input.expected_version {
                if record.version != expected {
                    return Err(NoemaError::VersionConflict {
                        id: id.to_string(),
                        expected,
                        found: record.version,
                    });
                }
            }

            if let Some(topic) = &input.topic {
                if topic.trim().is_empty() {
                    return Err(NoemaError::InvalidInput("topic must not be empty".to_string()));
                }
                record.topic = topic.clone();
            }
            if let Some(context) = &input.context {
                if context.trim().is_empty() {
                    return Err(NoemaError::InvalidInput(
                        "context must not be empty".to_string(),
                    ));
                }
                record.context = context.clone();
            }
            if let Some(decisions) = &input.decisions {
                record.decisions = decisions.clone();
            }
            if let Some(rationale) = &input.rationale {
                record.rationale = rationale.clone();
            }
            if let Some(metadata) = &input.metadata {
                record.metadata = metadata.clone();
            }
            if let Some(policy) = input.retention_policy {
                record.retention_policy = policy;
            }

            record.version += 1;
            record.updated_at = Utc::now();

            let (old_nodes, old_edges) = if recognify {
                record.doc_hash = ids::doc_hash(
                    &record.topic,
                    &record.context,
                    &record.decisions,
                    &record.rationale,
                );
                record.status = MemoryStatus::Pending;
                provenance::unlink_provenance(conn, id)?
            } else {
                (vec![], vec![])
            };

            memory_queries::update_memory_row(conn, &record)?;
            Ok((record, old_nodes, old_edges))
        })?;

        if !recognify {
            return Ok(MemoryResult {
                id: record.id,
                status: record.status,
                memories_superseded: 0,
                nodes_created: 0,
                edges_created: 0,
                edges_skipped: 0,
                errors: vec![],
            });
        }

        // Re-extraction outside any transaction
        let payload_text = record_payload_text(&record);
        let fragment = match self.build_fragment(&payload_text, cancel) {
            Ok(fragment) => fragment,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                // Old claims are already released; collect what they held
                self.gc(&old_nodes, &old_edges)?;
                warn!(id = %record.id, error = %err, "re-extraction failed, memory left pending");
                return Ok(MemoryResult {
                    id: record.id,
                    status: MemoryStatus::Pending,
                    memories_superseded: 0,
                    nodes_created: 0,
                    edges_created: 0,
                    edges_skipped: 0,
                    errors: vec![err.to_string()],
                });
            }
        };

        cancel.check("update_memory commit")?;

        self.storage.with_transaction(|conn| {
            for node in &fragment.nodes {
                graph_queries::upsert_node(conn, node)?;
            }
            for edge in &fragment.edges {
                graph_queries::upsert_edge(conn, edge)?;
            }

            let node_ids: Vec<NodeId> = fragment.nodes.iter().map(|n| n.id.clone()).collect();
            let edge_ids: Vec<EdgeId> = fragment.edges.iter().map(|e| e.id.clone()).collect();
            provenance::link_provenance(conn, &record.id, &node_ids, &edge_ids)?;
            memory_queries::set_memory_status(conn, &record.id, MemoryStatus::Complete)?;
            Ok(())
        })?;

        for node in &fragment.nodes {
            if let Some(embedding) = &node.embedding {
                self.vectors.index(&node.id, embedding);
            }
        }

        // GC the artifacts the old payload held and the new one no longer claims
        let new_node_ids: Vec<NodeId> = fragment.nodes.iter().map(|n| n.id.clone()).collect();
        let new_edge_ids: Vec<EdgeId> = fragment.edges.iter().map(|e| e.id.clone()).collect();
        let gc_nodes: Vec<NodeId> = old_nodes
            .into_iter()
            .filter(|n| !new_node_ids.contains(n))
            .collect();
        let gc_edges: Vec<EdgeId> = old_edges
            .into_iter()
            .filter(|e| !new_edge_ids.contains(e))
            .collect();
        self.gc(&gc_nodes, &gc_edges)?;

        Ok(MemoryResult {
            id: record.id,
            status: MemoryStatus::Complete,
            memories_superseded: 0,
            nodes_created: fragment.nodes.len(),
            edges_created: fragment.edges.len(),
            edges_skipped: fragment.edges_skipped,
            errors: fragment.warnings,
        })
    }

    /// Delete a memory, releasing its provenance claims and collecting
    /// unreferenced artifacts
    pub fn delete_memory(&self, id: &str, cancel: &CancelToken) -> Result<()> {
        cancel.check("delete_memory")?;

        let (node_ids, edge_ids) = self.storage.with_transaction(|conn| {
            let captured = provenance::unlink_provenance(conn, id)?;
            memory_queries::delete_memory(conn, id)?;
            Ok(captured)
        })?;

        self.gc(&node_ids, &edge_ids)?;
        info!(%id, "memory deleted");
        Ok(())
    }

    /// Reference-counted garbage collection over candidate artifacts
    ///
    /// Deletes candidates whose provenance reference count is zero, but
    /// only if they were provenance-tracked at some point. Legacy
    /// artifacts never carry the flag and are never touched. Deleting a
    /// node cascades its incident edges. Returns the deleted node ids and
    /// the number of edges removed directly.
    pub fn gc(
        &self,
        node_candidates: &[NodeId],
        edge_candidates: &[EdgeId],
    ) -> Result<(Vec<NodeId>, usize)> {
        if node_candidates.is_empty() && edge_candidates.is_empty() {
            return Ok((vec![], 0));
        }

        let mut deleted_nodes: Vec<NodeId> = Vec::new();
        let mut deleted_edges = 0usize;

        self.storage.with_transaction(|conn| {
            for edge_id in edge_candidates {
                if provenance::edge_tracked(conn, edge_id)?
                    && provenance::count_edge_references(conn, edge_id)? == 0
                {
                    graph_queries::delete_edge(conn, edge_id)?;
                    deleted_edges += 1;
                }
            }

            for node_id in node_candidates {
                if provenance::node_tracked(conn, node_id)?
                    && provenance::count_node_references(conn, node_id)? == 0
                {
                    graph_queries::delete_node(conn, node_id)?;
                    deleted_nodes.push(node_id.clone());
                }
            }

            Ok(())
        })?;

        if !deleted_nodes.is_empty() {
            self.vectors.remove(&deleted_nodes);
            debug!(
                nodes = deleted_nodes.len(),
                edges = deleted_edges,
                "gc collected unreferenced artifacts"
            );
        }

        Ok((deleted_nodes, deleted_edges))
    }

    /// Extract entities and triplets from text and assemble the node and
    /// edge set with deterministic ids
    pub(crate) fn build_fragment(&self, text: &str, cancel: &CancelToken) -> Result<GraphFragment> {
        let Some(orchestrator) = &self.orchestrator else {
            // No LLM configured; nothing to derive
            return Ok(GraphFragment::empty());
        };

        cancel.check("extraction")?;
        let (entities, mut warnings) = orchestrator.extract_entities(text, cancel)?;
        if entities.is_empty() {
            return Ok(GraphFragment {
                nodes: vec![],
                edges: vec![],
                edges_skipped: 0,
                warnings,
            });
        }

        let triplets = orchestrator.extract_triplets(text, &entities, cancel)?;

        cancel.check("embedding")?;
        let now = Utc::now();

        // Same normalized (name, type) may repeat within a chunk; the last
        // occurrence wins, matching upsert semantics.
        let mut nodes: HashMap<NodeId, Node> = HashMap::new();
        for entity in &entities {
            let id = ids::node_id(&entity.name, entity.entity_type);
            nodes.insert(
                id.clone(),
                Node {
                    id,
                    name: entity.name.clone(),
                    entity_type: entity.entity_type,
                    description: entity.description.clone(),
                    embedding: None,
                    created_at: now,
                    last_accessed_at: None,
                    access_count: 0,
                    metadata: None,
                },
            );
        }

        let mut nodes: Vec<Node> = nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let texts: Vec<String> = nodes
            .iter()
            .map(|n| {
                if n.description.is_empty() {
                    n.name.clone()
                } else {
                    format!("{}: {}", n.name, n.description)
                }
            })
            .collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let embeddings = self.embedder.embed_batch(&text_refs)?;
        for (node, embedding) in nodes.iter_mut().zip(embeddings) {
            node.embedding = Some(embedding);
        }

        // Entity-name index for edge linking: name -> distinct types
        let mut types_by_name: HashMap<String, Vec<EntityType>> = HashMap::new();
        for entity in &entities {
            let key = entity.name.trim().to_lowercase();
            let types = types_by_name.entry(key).or_default();
            if !types.contains(&entity.entity_type) {
                types.push(entity.entity_type);
            }
        }

        let mut edges: Vec<Edge> = Vec::new();
        let mut edges_skipped = 0usize;
        let mut seen_edges: HashSet<EdgeId> = HashSet::new();

        for triplet in &triplets {
            let source = match resolve_entity(&types_by_name, &triplet.subject) {
                Ok(entity_type) => ids::node_id(&triplet.subject, entity_type),
                Err(reason) => {
                    warnings.push(format!(
                        "edge skipped ({} -[{}]-> {}): {}",
                        triplet.subject, triplet.relation, triplet.object, reason
                    ));
                    edges_skipped += 1;
                    continue;
                }
            };
            let target = match resolve_entity(&types_by_name, &triplet.object) {
                Ok(entity_type) => ids::node_id(&triplet.object, entity_type),
                Err(reason) => {
                    warnings.push(format!(
                        "edge skipped ({} -[{}]-> {}): {}",
                        triplet.subject, triplet.relation, triplet.object, reason
                    ));
                    edges_skipped += 1;
                    continue;
                }
            };

            let id = ids::edge_id(&source, &triplet.relation, &target);
            if !seen_edges.insert(id.clone()) {
                continue;
            }

            edges.push(Edge {
                id,
                source_id: source,
                relation: triplet.relation.clone(),
                target_id: target,
                weight: 1.0,
                created_at: now,
            });
        }

        Ok(GraphFragment {
            nodes,
            edges,
            edges_skipped,
            warnings,
        })
    }
}

/// Resolve an entity name to its type for edge construction
///
/// Ambiguous names (same name extracted with multiple types) and unknown
/// names cannot be linked deterministically.
fn resolve_entity(
    types_by_name: &HashMap<String, Vec<EntityType>>,
    name: &str,
) -> std::result::Result<EntityType, String> {
    match types_by_name.get(&name.trim().to_lowercase()) {
        None => Err("unknown entity name".to_string()),
        Some(types) if types.len() == 1 => Ok(types[0]),
        Some(types) => Err(format!("ambiguous entity name ({} types)", types.len())),
    }
}

fn validate_add_input(input: &AddMemoryInput) -> Result<()> {
    if input.topic.trim().is_empty() {
        return Err(NoemaError::InvalidInput("topic must not be empty".to_string()));
    }
    if input.context.trim().is_empty() {
        return Err(NoemaError::InvalidInput(
            "context must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// The text extraction runs over: context, decisions and rationale
fn memory_payload_text(input: &AddMemoryInput) -> String {
    let mut parts = vec![input.context.clone()];
    parts.extend(input.decisions.iter().cloned());
    parts.extend(input.rationale.iter().cloned());
    parts.join("\n")
}

fn record_payload_text(record: &MemoryRecord) -> String {
    let mut parts = vec![record.context.clone()];
    parts.extend(record.decisions.iter().cloned());
    parts.extend(record.rationale.iter().cloned());
    parts.join("\n")
}
