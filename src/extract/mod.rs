//! Extraction orchestration: entities and triplets from text
//!
//! Wraps the LLM provider, normalizes its JSON output (fenced code blocks,
//! string-vs-list fields), validates entity types against the closed set,
//! and applies a bounded retry policy around provider calls. No persistence
//! happens here, so retries are idempotent.

pub mod chunker;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{NoemaError, Result};
use crate::providers::LlmProvider;
use crate::types::{CancelToken, EntityType, RetryConfig};

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid regex"));

const ENTITY_SYSTEM_PROMPT: &str = "You extract entities from text. Respond with a JSON array of \
objects, each with fields \"name\", \"type\" and \"description\". Allowed types: Person, Concept, \
System, Decision, Event, Technology, Pattern, Problem, Goal, Location, Organization, Document, \
Process, Requirement, Feature, Task. Respond with JSON only.";

const TRIPLET_SYSTEM_PROMPT: &str = "You extract relations between known entities. Respond with a \
JSON array of objects, each with fields \"subject\", \"relation\" and \"object\". Subject and \
object must be names from the provided entity list. Respond with JSON only.";

/// An entity extracted from a chunk of text
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
}

/// A subject-relation-object triple between extracted entities
#[derive(Debug, Clone, PartialEq)]
pub struct Triplet {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

/// Extraction orchestrator over an LLM provider
pub struct Orchestrator {
    llm: Arc<dyn LlmProvider>,
    retry: RetryConfig,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmProvider>, retry: RetryConfig) -> Self {
        Self { llm, retry }
    }

    /// Extract entities from text
    ///
    /// Unknown types are normalized to Concept; the accompanying warnings
    /// are returned alongside the entities.
    pub fn extract_entities(
        &self,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<(Vec<ExtractedEntity>, Vec<String>)> {
        let raw = self.complete_with_retry(ENTITY_SYSTEM_PROMPT, text, cancel)?;
        let values = parse_json_array(&raw)?;

        let mut entities = Vec::new();
        let mut warnings = Vec::new();

        for value in values {
            let Some(name) = string_field(&value, "name") else {
                continue;
            };
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }

            let type_str = string_field(&value, "type").unwrap_or_default();
            let entity_type = match type_str.parse::<EntityType>() {
                Ok(t) => t,
                Err(_) => {
                    let message = format!(
                        "unknown entity type '{}' for '{}', normalized to Concept",
                        type_str.trim(),
                        name
                    );
                    warn!("{}", message);
                    warnings.push(message);
                    EntityType::Concept
                }
            };

            let description = string_field(&value, "description")
                .unwrap_or_default()
                .trim()
                .to_string();

            entities.push(ExtractedEntity {
                name,
                entity_type,
                description,
            });
        }

        debug!(entity_count = entities.len(), "entity extraction complete");
        Ok((entities, warnings))
    }

    /// Extract triplets between the given entities
    ///
    /// A triplet is dropped unless both sides match a known entity name
    /// case- and whitespace-insensitively. Duplicates (lowercase
    /// subject/relation/object) keep the first occurrence.
    pub fn extract_triplets(
        &self,
        text: &str,
        entities: &[ExtractedEntity],
        cancel: &CancelToken,
    ) -> Result<Vec<Triplet>> {
        if entities.is_empty() {
            return Ok(vec![]);
        }

        let entity_names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let prompt = format!("Entities: {}\n\nText:\n{}", entity_names.join(", "), text);
        let raw = self.complete_with_retry(TRIPLET_SYSTEM_PROMPT, &prompt, cancel)?;
        let values = parse_json_array(&raw)?;

        let known: HashSet<String> = entities
            .iter()
            .map(|e| e.name.trim().to_lowercase())
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut triplets = Vec::new();

        for value in values {
            let (Some(subject), Some(relation), Some(object)) = (
                string_field(&value, "subject"),
                string_field(&value, "relation"),
                string_field(&value, "object"),
            ) else {
                continue;
            };

            let subject = subject.trim().to_string();
            let relation = relation.trim().to_string();
            let object = object.trim().to_string();
            if subject.is_empty() || relation.is_empty() || object.is_empty() {
                continue;
            }

            // Strict linking: both sides must name a known entity
            if !known.contains(&subject.to_lowercase()) || !known.contains(&object.to_lowercase())
            {
                debug!(%subject, %object, "triplet dropped: unlinked endpoint");
                continue;
            }

            let key = format!(
                "{}|{}|{}",
                subject.to_lowercase(),
                relation.to_lowercase(),
                object.to_lowercase()
            );
            if !seen.insert(key) {
                continue;
            }

            triplets.push(Triplet {
                subject,
                relation,
                object,
            });
        }

        debug!(triplet_count = triplets.len(), "triplet extraction complete");
        Ok(triplets)
    }

    /// Provider call with exponential backoff and jitter
    fn complete_with_retry(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            cancel.check("extraction")?;

            match self.llm.complete(system, prompt) {
                Ok(output) => return Ok(output),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "extraction provider call failed");
                    last_error = Some(err);

                    if attempt < self.retry.max_retries {
                        let base = self
                            .retry
                            .base_backoff_ms
                            .saturating_mul(1u64 << attempt.min(16));
                        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
                        std::thread::sleep(Duration::from_millis(base.saturating_add(jitter)));
                    }
                }
            }
        }

        Err(NoemaError::Extraction(format!(
            "provider failed after {} retries: {}",
            self.retry.max_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Parse a JSON array out of model output, tolerating fenced code blocks
fn parse_json_array(raw: &str) -> Result<Vec<serde_json::Value>> {
    let body = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    // Some models prepend prose; fall back to the outermost bracket pair
    let candidate = if body.starts_with('[') {
        body.to_string()
    } else {
        match (body.find('['), body.rfind(']')) {
            (Some(start), Some(end)) if start < end => body[start..=end].to_string(),
            _ => body.to_string(),
        }
    };

    let value: serde_json::Value = serde_json::from_str(&candidate)
        .map_err(|e| NoemaError::Extraction(format!("unparseable model output: {}", e)))?;

    match value {
        serde_json::Value::Array(items) => Ok(items),
        other => Err(NoemaError::Extraction(format!(
            "expected JSON array, got {}",
            match other {
                serde_json::Value::Object(_) => "object",
                serde_json::Value::String(_) => "string",
                _ => "scalar",
            }
        ))),
    }
}

/// Read a string field, joining list-of-strings values with ", "
fn string_field(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted LLM returning canned responses in order
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    impl LlmProvider for ScriptedLlm {
        fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(NoemaError::Extraction("script exhausted".to_string()));
            }
            responses.remove(0)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_backoff_ms: 1,
        }
    }

    #[test]
    fn test_parse_json_array_plain() {
        let items = parse_json_array(r#"[{"name": "a"}]"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_parse_json_array_fenced() {
        let raw = "```json\n[{\"name\": \"a\"}]\n```";
        let items = parse_json_array(raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_parse_json_array_with_prose() {
        let raw = "Here are the entities:\n[{\"name\": \"a\"}]\nDone.";
        let items = parse_json_array(raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_parse_json_array_rejects_object() {
        assert!(parse_json_array(r#"{"name": "a"}"#).is_err());
    }

    #[test]
    fn test_string_field_joins_lists() {
        let value = serde_json::json!({"description": ["fast", "reliable"]});
        assert_eq!(
            string_field(&value, "description").as_deref(),
            Some("fast, reliable")
        );
    }

    #[test]
    fn test_extract_entities_normalizes_unknown_type() {
        let llm = ScriptedLlm::new(vec![Ok(r#"[
            {"name": "PostgreSQL", "type": "Technology", "description": "database"},
            {"name": "Widget", "type": "Gadget", "description": "thing"}
        ]"#
        .to_string())]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let (entities, warnings) = orchestrator
            .extract_entities("text", &CancelToken::new())
            .unwrap();

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, EntityType::Technology);
        assert_eq!(entities[1].entity_type, EntityType::Concept);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Gadget"));
    }

    #[test]
    fn test_extract_entities_skips_empty_names() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"[{"name": "  ", "type": "Concept", "description": "x"}]"#.to_string(),
        )]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let (entities, _) = orchestrator
            .extract_entities("text", &CancelToken::new())
            .unwrap();
        assert!(entities.is_empty());
    }

    #[test]
    fn test_extract_triplets_strict_linking() {
        let llm = ScriptedLlm::new(vec![Ok(r#"[
            {"subject": "postgresql", "relation": "backs", "object": "API"},
            {"subject": "PostgreSQL", "relation": "backs", "object": "api"},
            {"subject": "Ghost", "relation": "haunts", "object": "API"}
        ]"#
        .to_string())]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let entities = vec![
            ExtractedEntity {
                name: "PostgreSQL".to_string(),
                entity_type: EntityType::Technology,
                description: String::new(),
            },
            ExtractedEntity {
                name: "API".to_string(),
                entity_type: EntityType::System,
                description: String::new(),
            },
        ];

        let triplets = orchestrator
            .extract_triplets("text", &entities, &CancelToken::new())
            .unwrap();

        // First occurrence wins the dedup; the unlinked "Ghost" is dropped
        assert_eq!(triplets.len(), 1);
        assert_eq!(triplets[0].subject, "postgresql");
    }

    #[test]
    fn test_retry_then_success() {
        let llm = ScriptedLlm::new(vec![
            Err(NoemaError::Extraction("transient".to_string())),
            Ok(r#"[{"name": "a", "type": "Concept", "description": "d"}]"#.to_string()),
        ]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let (entities, _) = orchestrator
            .extract_entities("text", &CancelToken::new())
            .unwrap();
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn test_retries_exhausted() {
        let llm = ScriptedLlm::new(vec![
            Err(NoemaError::Extraction("1".to_string())),
            Err(NoemaError::Extraction("2".to_string())),
            Err(NoemaError::Extraction("3".to_string())),
        ]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let err = orchestrator
            .extract_entities("text", &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, NoemaError::Extraction(_)));
    }

    #[test]
    fn test_cancellation_short_circuits() {
        let llm = ScriptedLlm::new(vec![Ok("[]".to_string())]);
        let orchestrator = Orchestrator::new(llm, fast_retry());

        let token = CancelToken::new();
        token.cancel();
        let err = orchestrator.extract_entities("text", &token).unwrap_err();
        assert!(err.is_cancelled());
    }
}
