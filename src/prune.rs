//! Prune engine: retention-driven deletion of memories and nodes
//!
//! Two phases. Phase A walks memories, applying supersession grace,
//! retention half-lives and the age cutoff, deleting candidates and
//! collecting their released artifacts. Phase B walks nodes, marking aged
//! or fully-decayed ones and removing those whose reference count is zero
//! (legacy artifacts are never touched). `dry_run` evaluates both phases
//! without persisting any deletion.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::pipeline::MemoryPipeline;
use crate::search::decay::{age_days, decay_multiplier, effective_half_life};
use crate::storage::memory_queries::MemoryDecayRow;
use crate::storage::{graph_queries, memory_queries, provenance};
use crate::types::{
    CancelToken, DecayConfig, ListMemoriesOptions, MemoryRecord, NodeId, PruneOptions,
    PruneResult, RetentionPolicy, MAX_LIST_LIMIT,
};

/// Prune engine over the shared pipeline and storage
pub struct PruneEngine {
    pipeline: Arc<MemoryPipeline>,
    decay: DecayConfig,
}

impl PruneEngine {
    pub fn new(pipeline: Arc<MemoryPipeline>, decay: DecayConfig) -> Self {
        Self { pipeline, decay }
    }

    /// Evaluate and apply the prune policy
    pub fn prune(&self, options: &PruneOptions, cancel: &CancelToken) -> Result<PruneResult> {
        let mut result = PruneResult::default();

        self.phase_a_memories(options, cancel, &mut result)?;
        cancel.check("prune phase B")?;
        self.phase_b_nodes(options, cancel, &mut result)?;

        info!(
            evaluated = result.evaluated,
            pruned = result.pruned,
            memories = result.memory_ids.len(),
            dry_run = options.dry_run,
            "prune pass complete"
        );

        Ok(result)
    }

    /// Phase A: memory-level evaluation and cascaded deletion
    fn phase_a_memories(
        &self,
        options: &PruneOptions,
        cancel: &CancelToken,
        result: &mut PruneResult,
    ) -> Result<()> {
        let memories = self.all_memories()?;
        let now = Utc::now();

        let mut candidates: Vec<MemoryRecord> = Vec::new();

        for memory in memories {
            cancel.check("prune phase A")?;
            result.evaluated += 1;

            if memory.pinned || memory.retention_policy == RetentionPolicy::Permanent {
                continue;
            }

            // Explicit retention_until override protects the memory outright
            if let Some(until) = memory
                .metadata
                .get("retention_until")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            {
                if now < until.with_timezone(&Utc) {
                    continue;
                }
            }

            let mut marked = false;

            if options.prune_superseded {
                let superseded_at = self
                    .pipeline
                    .storage()
                    .with_connection(|conn| provenance::superseded_at(conn, &memory.id))?;
                if let Some(at) = superseded_at {
                    let grace_elapsed = (now - at).num_seconds() as f64 / 86_400.0;
                    if grace_elapsed >= options.supersession_grace_days {
                        marked = true;
                    }
                }
            }

            if !marked {
                if let Some(threshold) = options.min_decay_score {
                    let half_life = memory
                        .retention_policy
                        .half_life_days()
                        .unwrap_or(self.decay.half_life_days);
                    let age = age_days(
                        self.decay.basis,
                        memory.created_at,
                        memory.last_accessed_at,
                        now,
                    );
                    if decay_multiplier(age, half_life) < threshold {
                        marked = true;
                    }
                }
            }

            if !marked {
                if let Some(max_age) = options.max_age_days {
                    // Decision memories hold out for their 365-day half-life;
                    // the blanket age cutoff applies to the shorter policies.
                    if memory.retention_policy != RetentionPolicy::Decision {
                        let age = (now - memory.created_at).num_seconds() as f64 / 86_400.0;
                        if age > max_age {
                            marked = true;
                        }
                    }
                }
            }

            if marked {
                debug!(id = %memory.id, policy = %memory.retention_policy.as_str(), "memory marked for prune");
                candidates.push(memory);
            }
        }

        if options.dry_run {
            self.simulate_memory_prune(&candidates, result)?;
            return Ok(());
        }

        for memory in candidates {
            let (node_ids, edge_ids) = self.pipeline.storage().with_transaction(|conn| {
                let captured = provenance::unlink_provenance(conn, &memory.id)?;
                memory_queries::delete_memory(conn, &memory.id)?;
                Ok(captured)
            })?;

            let (deleted_nodes, _) = self.pipeline.gc(&node_ids, &edge_ids)?;
            result.pruned += deleted_nodes.len();
            result.node_ids.extend(deleted_nodes);
            result.memory_ids.push(memory.id);
        }

        Ok(())
    }

    /// Dry-run simulation: a released node would be deleted iff every
    /// memory referencing it is itself in the prune set
    fn simulate_memory_prune(
        &self,
        candidates: &[MemoryRecord],
        result: &mut PruneResult,
    ) -> Result<()> {
        let pruned_set: HashSet<&str> = candidates.iter().map(|m| m.id.as_str()).collect();

        let mut released: Vec<NodeId> = Vec::new();
        for memory in candidates {
            let (node_ids, _) = self
                .pipeline
                .storage()
                .with_connection(|conn| provenance::provenance_by_memory(conn, &memory.id))?;
            released.extend(node_ids);
            result.memory_ids.push(memory.id.clone());
        }
        released.sort();
        released.dedup();

        let doomed = self.pipeline.storage().with_connection(|conn| {
            let refs = provenance::memories_by_node_batched(conn, &released)?;
            let mut doomed = Vec::new();
            for node_id in &released {
                let holders = refs.get(node_id).map(Vec::as_slice).unwrap_or(&[]);
                if holders.iter().all(|m| pruned_set.contains(m.as_str())) {
                    doomed.push(node_id.clone());
                }
            }
            Ok(doomed)
        })?;

        result.pruned += doomed.len();
        result.node_ids.extend(doomed);
        Ok(())
    }

    /// Phase B: node-level evaluation
    fn phase_b_nodes(
        &self,
        options: &PruneOptions,
        cancel: &CancelToken,
        result: &mut PruneResult,
    ) -> Result<()> {
        if options.max_age_days.is_none() && options.min_decay_score.is_none() {
            return Ok(());
        }

        let node_ids = self
            .pipeline
            .storage()
            .with_connection(graph_queries::all_node_ids)?;
        let already_deleted: HashSet<NodeId> = result.node_ids.iter().cloned().collect();
        let now = Utc::now();

        for node_id in node_ids {
            cancel.check("prune phase B")?;
            if already_deleted.contains(&node_id) {
                continue;
            }
            result.evaluated += 1;

            let protected = self
                .pipeline
                .storage()
                .with_connection(|conn| provenance::node_protected(conn, &node_id))?;
            if protected {
                continue;
            }

            let Some(node) = self
                .pipeline
                .storage()
                .with_connection(|conn| graph_queries::fetch_node(conn, &node_id))?
            else {
                continue;
            };

            let age = age_days(self.decay.basis, node.created_at, node.last_accessed_at, now);
            let mut marked = false;

            if let Some(max_age) = options.max_age_days {
                if age > max_age {
                    marked = true;
                }
            }

            if !marked {
                if let Some(threshold) = options.min_decay_score {
                    let rows = self.decay_rows_for_node(&node_id)?;
                    let refs: Vec<&MemoryDecayRow> = rows.iter().collect();
                    if let Some(half_life) = effective_half_life(&refs, self.decay.half_life_days)
                    {
                        if decay_multiplier(age, half_life) < threshold {
                            marked = true;
                        }
                    }
                }
            }

            if !marked {
                continue;
            }

            // Ref-count gate: only unreferenced, provenance-tracked nodes go
            let deletable = self.pipeline.storage().with_connection(|conn| {
                Ok(provenance::node_tracked(conn, &node_id)?
                    && provenance::count_node_references(conn, &node_id)? == 0)
            })?;

            if !deletable {
                continue;
            }

            if !options.dry_run {
                self.pipeline.storage().with_transaction(|conn| {
                    graph_queries::delete_node(conn, &node_id)
                })?;
                self.pipeline.vectors().remove(std::slice::from_ref(&node_id));
            }

            result.pruned += 1;
            result.node_ids.push(node_id);
        }

        Ok(())
    }

    /// Decay-relevant rows for the memories attached to one node
    fn decay_rows_for_node(&self, node_id: &NodeId) -> Result<Vec<MemoryDecayRow>> {
        self.pipeline.storage().with_connection(|conn| {
            let refs =
                provenance::memories_by_node_batched(conn, std::slice::from_ref(node_id))?;
            let memory_ids = refs.get(node_id).cloned().unwrap_or_default();
            let rows = memory_queries::memory_decay_rows(conn, &memory_ids)?;
            Ok(rows.into_values().collect())
        })
    }

    /// Every memory row, paged through the list API
    fn all_memories(&self) -> Result<Vec<MemoryRecord>> {
        let mut memories = Vec::new();
        let mut offset = 0i64;

        loop {
            let page = self.pipeline.storage().with_connection(|conn| {
                memory_queries::list_memories(
                    conn,
                    &ListMemoriesOptions {
                        limit: Some(MAX_LIST_LIMIT),
                        offset: Some(offset),
                        ..Default::default()
                    },
                )
            })?;

            let count = page.len() as i64;
            memories.extend(page);
            if count < MAX_LIST_LIMIT {
                break;
            }
            offset += MAX_LIST_LIMIT;
        }

        Ok(memories)
    }
}
