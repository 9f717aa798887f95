//! Shared fixtures: deterministic providers for engine tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use noema::providers::{Embedder, LlmProvider};
use noema::Result;

/// Keyword-driven mock LLM
///
/// Entities are emitted when their keyword appears in the prompt;
/// triplets are emitted verbatim and rely on the orchestrator's strict
/// linking filter to drop unlinked ones.
pub struct KeywordLlm {
    entities: Vec<(&'static str, &'static str, &'static str)>,
    triplets: Vec<(&'static str, &'static str, &'static str)>,
}

impl KeywordLlm {
    pub fn new(
        entities: Vec<(&'static str, &'static str, &'static str)>,
        triplets: Vec<(&'static str, &'static str, &'static str)>,
    ) -> Arc<Self> {
        Arc::new(Self { entities, triplets })
    }
}

impl LlmProvider for KeywordLlm {
    fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let lower = prompt.to_lowercase();

        if system.contains("relations") {
            let items: Vec<serde_json::Value> = self
                .triplets
                .iter()
                .map(|(s, r, o)| {
                    serde_json::json!({"subject": s, "relation": r, "object": o})
                })
                .collect();
            return Ok(serde_json::Value::Array(items).to_string());
        }

        let items: Vec<serde_json::Value> = self
            .entities
            .iter()
            .filter(|(name, _, _)| lower.contains(&name.to_lowercase()))
            .map(|(name, entity_type, description)| {
                serde_json::json!({"name": name, "type": entity_type, "description": description})
            })
            .collect();
        Ok(serde_json::Value::Array(items).to_string())
    }

    fn model_name(&self) -> &str {
        "keyword-mock"
    }
}

/// Embedder with a fixed vector per known phrase, hashing fallback otherwise
pub struct TableEmbedder {
    dimensions: usize,
    table: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new(dimensions: usize, entries: Vec<(&str, Vec<f32>)>) -> Arc<Self> {
        Arc::new(Self {
            dimensions,
            table: entries
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        })
    }
}

impl Embedder for TableEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = text.to_lowercase();
        for (phrase, vector) in &self.table {
            if key.contains(phrase) {
                return Ok(vector.clone());
            }
        }
        Ok(vec![0.0; self.dimensions])
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "table-mock"
    }
}
