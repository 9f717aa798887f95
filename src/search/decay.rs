//! Decay decorator over the search engine
//!
//! Rescales each result by a time-decay multiplier and an optional
//! frequency heat multiplier, then re-filters and re-sorts. Retention
//! policies compose by taking the most protective (largest) half-life
//! across the node's attached memories; pinned and permanent memories
//! exempt the node entirely.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{attached_memories, SearchEngine};
use crate::error::Result;
use crate::storage::memory_queries::{self, MemoryDecayRow};
use crate::types::{
    CancelToken, DecayBasis, DecayConfig, MemoryId, NodeId, SearchOptions, SearchResult,
};

/// Time-decay multiplier for an age measured in days
pub fn decay_multiplier(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    // Negative ages (clock skew) clamp to 0
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}

/// Frequency heat in [0, 1] relative to a reference access count
pub fn heat(max_access_count: i64, reference_access_count: i64) -> f64 {
    let reference = reference_access_count.max(1) as f64;
    (((max_access_count.max(0) as f64) + 1.0).ln() / (reference + 1.0).ln()).min(1.0)
}

/// Effective half-life for a node given its attached memories
///
/// None means the node is exempt from decay (pinned or permanent).
/// Otherwise the largest policy-specific half-life wins; with none
/// present the configured default applies.
pub fn effective_half_life(memories: &[&MemoryDecayRow], default_half_life: f64) -> Option<f64> {
    if memories.iter().any(|m| m.pinned) {
        return None;
    }
    if memories
        .iter()
        .any(|m| m.retention_policy == crate::types::RetentionPolicy::Permanent)
    {
        return None;
    }

    let policy_max = memories
        .iter()
        .filter_map(|m| m.retention_policy.half_life_days())
        .fold(None::<f64>, |acc, hl| {
            Some(acc.map_or(hl, |current| current.max(hl)))
        });

    Some(policy_max.unwrap_or(default_half_life))
}

/// Age in days under the configured basis
pub fn age_days(
    basis: DecayBasis,
    created_at: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let anchor = match basis {
        DecayBasis::Access => last_accessed_at.unwrap_or(created_at),
        DecayBasis::Creation => created_at,
    };
    let seconds = (now - anchor).num_seconds() as f64;
    (seconds / 86_400.0).max(0.0)
}

/// Search engine wrapper that applies decay scoring
pub struct DecayingSearch {
    engine: SearchEngine,
    config: DecayConfig,
}

impl DecayingSearch {
    pub fn new(engine: SearchEngine, config: DecayConfig) -> Self {
        Self { engine, config }
    }

    pub fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        let mut results = self.engine.search(query, options, cancel)?;
        if !self.config.enabled || results.is_empty() {
            return Ok(results);
        }

        // The decorator resolves attached memories itself so scoring works
        // even when the caller disabled provenance enrichment.
        let node_ids: Vec<NodeId> = results.iter().map(|r| r.node_id.clone()).collect();
        let memories_by_node = attached_memories(self.engine.storage(), &node_ids)?;

        let mut all_memory_ids: Vec<MemoryId> = Vec::new();
        for ids in memories_by_node.values() {
            for id in ids {
                if !all_memory_ids.contains(id) {
                    all_memory_ids.push(id.clone());
                }
            }
        }
        let decay_rows = self
            .engine
            .storage()
            .with_connection(|conn| memory_queries::memory_decay_rows(conn, &all_memory_ids))?;

        let now = Utc::now();
        for result in &mut results {
            let attached: Vec<&MemoryDecayRow> = memories_by_node
                .get(&result.node_id)
                .map(|ids| ids.iter().filter_map(|id| decay_rows.get(id)).collect())
                .unwrap_or_default();

            let Some(half_life) = effective_half_life(&attached, self.config.half_life_days)
            else {
                continue; // exempt
            };

            let age = age_days(
                self.config.basis,
                result.node.created_at,
                result.node.last_accessed_at,
                now,
            );
            let time = decay_multiplier(age, half_life);

            result.score *= time;
            if self.config.frequency_enabled && !attached.is_empty() {
                let max_access = attached.iter().map(|m| m.access_count).max().unwrap_or(0);
                let h = heat(max_access, self.config.reference_access_count);
                result.score *= 0.5 + 0.5 * h;
            }
        }

        let before = results.len();
        results.retain(|r| r.score >= self.config.min_score);
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        if results.len() < before {
            debug!(dropped = before - results.len(), "decay filtered results");
        }

        Ok(results)
    }
}
