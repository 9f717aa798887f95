//! Deterministic identifiers and content hashes
//!
//! Nodes and edges carry ids derived purely from content so that
//! re-ingesting the same entity yields the same row, enabling idempotent
//! upserts and implicit cross-document merging.

use sha2::{Digest, Sha256};

use crate::types::EntityType;

/// Hex digits kept from the SHA-256 digest for node/edge ids
const ID_HEX_LEN: usize = 16;

/// Deterministic node id: sha256(lower(trim(name)) || "|" || type), low 16 hex
pub fn node_id(name: &str, entity_type: EntityType) -> String {
    let normalized = name.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(entity_type.as_str().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[digest.len() - ID_HEX_LEN..].to_string()
}

/// Deterministic edge id over (source_id, relation, target_id)
pub fn edge_id(source_id: &str, relation: &str, target_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"|");
    hasher.update(relation.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(target_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[digest.len() - ID_HEX_LEN..].to_string()
}

/// Memory payload hash: SHA-256 over canonical JSON of
/// (topic, context, decisions, rationale) with keys sorted and every
/// string trimmed.
pub fn doc_hash(topic: &str, context: &str, decisions: &[String], rationale: &[String]) -> String {
    // serde_json maps are BTree-backed, so key order is sorted by construction
    let canonical = serde_json::json!({
        "context": context.trim(),
        "decisions": decisions.iter().map(|d| d.trim()).collect::<Vec<_>>(),
        "rationale": rationale.iter().map(|r| r.trim()).collect::<Vec<_>>(),
        "topic": topic.trim(),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Legacy document hash: SHA-256 over the exact document text bytes
pub fn document_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_normalization() {
        let a = node_id("PostgreSQL", EntityType::Technology);
        let b = node_id("  postgresql  ", EntityType::Technology);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_node_id_type_sensitive() {
        let a = node_id("alpha", EntityType::Concept);
        let b = node_id("alpha", EntityType::System);
        assert_ne!(a, b);
    }

    #[test]
    fn test_edge_id_deterministic() {
        let s = node_id("a", EntityType::Concept);
        let t = node_id("b", EntityType::Concept);
        assert_eq!(edge_id(&s, "uses", &t), edge_id(&s, "uses", &t));
        assert_ne!(edge_id(&s, "uses", &t), edge_id(&t, "uses", &s));
    }

    #[test]
    fn test_doc_hash_trims_whitespace() {
        let a = doc_hash("Adopt X", "We adopted X.", &["Adopt X".into()], &[]);
        let b = doc_hash("  Adopt X ", " We adopted X.  ", &[" Adopt X ".into()], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_doc_hash_field_sensitivity() {
        let a = doc_hash("t", "c", &[], &["why".into()]);
        let b = doc_hash("t", "c", &["why".into()], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_document_hash_exact_bytes() {
        assert_ne!(document_hash("abc"), document_hash("abc "));
        assert_eq!(document_hash("abc").len(), 64);
    }
}
