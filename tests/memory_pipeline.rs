//! End-to-end tests for the memory pipeline: two-phase writes, provenance,
//! dedup, update re-cognify and reference-counted GC.

mod common;

use std::sync::Arc;

use common::KeywordLlm;
use noema::ids;
use noema::providers::HashEmbedder;
use noema::{
    AddMemoryInput, CancelToken, EntityType, MemoryStatus, Noema, NoemaConfig, NoemaError,
    UpdateMemoryInput,
};

fn engine_with_entities() -> Noema {
    let llm = KeywordLlm::new(
        vec![
            ("PostgreSQL", "Technology", "relational database"),
            ("Redis", "Technology", "in-memory cache"),
            ("Billing", "System", "billing service"),
        ],
        vec![
            ("PostgreSQL", "backs", "Billing"),
            ("Redis", "caches_for", "Billing"),
        ],
    );
    Noema::with_providers(NoemaConfig::in_memory(), Arc::new(HashEmbedder::new(64)), Some(llm))
        .unwrap()
}

fn cancel() -> CancelToken {
    CancelToken::new()
}

fn memory_about(context: &str) -> AddMemoryInput {
    AddMemoryInput {
        topic: format!("Note: {}", &context[..context.len().min(20)]),
        context: context.to_string(),
        ..Default::default()
    }
}

#[test]
fn add_memory_completes_with_provenance() {
    let engine = engine_with_entities();

    let result = engine
        .add_memory(memory_about("We use PostgreSQL for the Billing system."), &cancel())
        .unwrap();

    assert_eq!(result.status, MemoryStatus::Complete);
    assert_eq!(result.nodes_created, 2);
    assert_eq!(result.edges_created, 1);
    assert!(result.errors.is_empty());

    // Every artifact in the provenance exists in the store
    let (node_ids, edge_ids) = engine.provenance_by_memory(&result.id).unwrap();
    assert_eq!(node_ids.len(), 2);
    assert_eq!(edge_ids.len(), 1);
    for node_id in &node_ids {
        engine.get_node(node_id).unwrap();
    }

    let memory = engine.get_memory(&result.id).unwrap();
    assert_eq!(memory.status, MemoryStatus::Complete);
    assert_eq!(memory.version, 1);
}

#[test]
fn deterministic_node_ids_merge_across_memories() {
    let engine = engine_with_entities();

    engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();
    engine
        .add_memory(memory_about("PostgreSQL backs our service."), &cancel())
        .unwrap();

    let expected = ids::node_id("postgresql", EntityType::Technology);
    let node = engine.get_node(&expected).unwrap();
    assert_eq!(node.name, "PostgreSQL");
    assert_eq!(engine.count_memory_references(&expected).unwrap(), 2);
    assert_eq!(engine.stats().unwrap().node_count, 1);
}

#[test]
fn shared_node_survives_deletion() {
    // Two memories share the PostgreSQL node; deleting one keeps it
    let engine = engine_with_entities();

    let a = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();
    let b = engine
        .add_memory(memory_about("PostgreSQL backs our service."), &cancel())
        .unwrap();

    engine.delete_memory(&a.id, &cancel()).unwrap();

    let node_id = ids::node_id("postgresql", EntityType::Technology);
    engine.get_node(&node_id).unwrap();
    assert_eq!(engine.count_memory_references(&node_id).unwrap(), 1);
    assert_eq!(
        engine.get_memory(&b.id).unwrap().status,
        MemoryStatus::Complete
    );
}

#[test]
fn add_memory_idempotent_on_payload() {
    // Identical payloads return the same id and do no graph work
    let engine = engine_with_entities();
    let before = engine.count_memories().unwrap();

    let input = AddMemoryInput {
        topic: "Adopt X".to_string(),
        context: "We adopted PostgreSQL.".to_string(),
        decisions: vec!["Adopt PostgreSQL".to_string()],
        rationale: vec![],
        ..Default::default()
    };

    let first = engine.add_memory(input.clone(), &cancel()).unwrap();
    let second = engine.add_memory(input, &cancel()).unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.nodes_created, 0);
    assert_eq!(second.edges_created, 0);
    assert_eq!(engine.count_memories().unwrap(), before + 1);
}

#[test]
fn doc_hash_ignores_whitespace() {
    let engine = engine_with_entities();

    let first = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();
    let second = engine
        .add_memory(
            AddMemoryInput {
                topic: "  Note: We use PostgreSQL. ".to_string(),
                context: "  We use PostgreSQL.  ".to_string(),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert_eq!(first.id, second.id);
}

#[test]
fn update_recognifies_and_collects_garbage() {
    // Narrowing the payload releases artifacts no longer claimed
    let engine = engine_with_entities();

    let result = engine
        .add_memory(
            memory_about("PostgreSQL and Redis both support the Billing system."),
            &cancel(),
        )
        .unwrap();
    assert_eq!(result.nodes_created, 3);

    let updated = engine
        .update_memory(
            &result.id,
            UpdateMemoryInput {
                context: Some("Now we only rely on PostgreSQL.".to_string()),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(updated.status, MemoryStatus::Complete);

    let (node_ids, _) = engine.provenance_by_memory(&result.id).unwrap();
    let postgres = ids::node_id("postgresql", EntityType::Technology);
    assert_eq!(node_ids, vec![postgres.clone()]);

    // Redis and Billing had no other claimant and are gone
    let redis = ids::node_id("redis", EntityType::Technology);
    let billing = ids::node_id("billing", EntityType::System);
    assert!(matches!(
        engine.get_node(&redis).unwrap_err(),
        NoemaError::NodeNotFound(_)
    ));
    assert!(matches!(
        engine.get_node(&billing).unwrap_err(),
        NoemaError::NodeNotFound(_)
    ));

    let memory = engine.get_memory(&result.id).unwrap();
    assert_eq!(memory.version, 2);
}

#[test]
fn update_preserves_shared_artifacts() {
    let engine = engine_with_entities();

    let keeper = engine
        .add_memory(memory_about("Redis is our cache."), &cancel())
        .unwrap();
    let churner = engine
        .add_memory(memory_about("Redis and PostgreSQL work together."), &cancel())
        .unwrap();

    engine
        .update_memory(
            &churner.id,
            UpdateMemoryInput {
                context: Some("PostgreSQL only now.".to_string()),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    // Redis is still claimed by the keeper
    let redis = ids::node_id("redis", EntityType::Technology);
    engine.get_node(&redis).unwrap();
    assert_eq!(engine.count_memory_references(&redis).unwrap(), 1);
    let (keeper_nodes, _) = engine.provenance_by_memory(&keeper.id).unwrap();
    assert!(keeper_nodes.contains(&redis));
}

#[test]
fn update_version_conflict() {
    let engine = engine_with_entities();
    let result = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();

    let err = engine
        .update_memory(
            &result.id,
            UpdateMemoryInput {
                context: Some("changed".to_string()),
                expected_version: Some(99),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap_err();

    assert!(matches!(err, NoemaError::VersionConflict { found: 1, .. }));
}

#[test]
fn metadata_update_skips_recognify() {
    let engine = engine_with_entities();
    let result = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();
    let (nodes_before, _) = engine.provenance_by_memory(&result.id).unwrap();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("reviewed".to_string(), serde_json::json!(true));
    let updated = engine
        .update_memory(
            &result.id,
            UpdateMemoryInput {
                metadata: Some(metadata),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert_eq!(updated.status, MemoryStatus::Complete);
    assert_eq!(updated.nodes_created, 0);

    let (nodes_after, _) = engine.provenance_by_memory(&result.id).unwrap();
    assert_eq!(nodes_before, nodes_after);
    assert_eq!(engine.get_memory(&result.id).unwrap().version, 2);
}

#[test]
fn delete_memory_removes_record_and_artifacts() {
    // After deletion the record is gone and unshared artifacts with it
    let engine = engine_with_entities();
    let result = engine
        .add_memory(memory_about("Redis caches for the Billing system."), &cancel())
        .unwrap();
    let (node_ids, _) = engine.provenance_by_memory(&result.id).unwrap();
    assert!(!node_ids.is_empty());

    engine.delete_memory(&result.id, &cancel()).unwrap();

    assert!(matches!(
        engine.get_memory(&result.id).unwrap_err(),
        NoemaError::MemoryNotFound(_)
    ));
    for node_id in &node_ids {
        assert!(engine.get_node(node_id).is_err());
    }
    assert_eq!(engine.stats().unwrap().node_count, 0);
    assert_eq!(engine.stats().unwrap().edge_count, 0);
}

#[test]
fn supersession_chains_and_partial_failures() {
    let engine = engine_with_entities();

    let old = engine
        .add_memory(memory_about("We use Redis."), &cancel())
        .unwrap();

    let newer = engine
        .add_memory(
            AddMemoryInput {
                topic: "Switch to PostgreSQL".to_string(),
                context: "We moved from Redis to PostgreSQL.".to_string(),
                supersedes: vec![old.id.clone()],
                supersede_reason: Some("migration".to_string()),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(newer.memories_superseded, 1);

    let chain = engine.supersession_chain(&newer.id).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].superseded_id, old.id);
    assert_eq!(engine.superseded_by(&old.id).unwrap().len(), 1);

    // Chains extend transitively
    let third = engine
        .add_memory(
            AddMemoryInput {
                topic: "Third revision".to_string(),
                context: "Another pass over the Redis decision.".to_string(),
                supersedes: vec![newer.id.clone()],
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(third.memories_superseded, 1);
    assert_eq!(engine.supersession_chain(&third.id).unwrap().len(), 2);

    // A reference to a missing memory fails that link only
    let partial = engine
        .add_memory(
            AddMemoryInput {
                topic: "Partial".to_string(),
                context: "Superseding one real and one missing memory.".to_string(),
                supersedes: vec![old.id.clone(), "missing-memory".to_string()],
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(partial.memories_superseded, 1);
    assert_eq!(partial.errors.len(), 1);
}

#[test]
fn validation_rejects_empty_fields() {
    let engine = engine_with_entities();

    let err = engine
        .add_memory(
            AddMemoryInput {
                topic: "  ".to_string(),
                context: "ctx".to_string(),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap_err();
    assert!(matches!(err, NoemaError::InvalidInput(_)));

    let err = engine
        .add_memory(
            AddMemoryInput {
                topic: "t".to_string(),
                context: "".to_string(),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap_err();
    assert!(matches!(err, NoemaError::InvalidInput(_)));
}

#[test]
fn cancelled_add_leaves_no_memory() {
    let engine = engine_with_entities();
    let token = CancelToken::new();
    token.cancel();

    let err = engine
        .add_memory(memory_about("We use PostgreSQL."), &token)
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(engine.count_memories().unwrap(), 0);
}

#[test]
fn pin_and_unpin_memory() {
    let engine = engine_with_entities();
    let result = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();

    engine.pin_memory(&result.id, Some("keystone decision")).unwrap();
    let memory = engine.get_memory(&result.id).unwrap();
    assert!(memory.pinned);
    assert_eq!(memory.pinned_reason.as_deref(), Some("keystone decision"));

    engine.unpin_memory(&result.id).unwrap();
    assert!(!engine.get_memory(&result.id).unwrap().pinned);
}

#[test]
fn legacy_cognify_roundtrip() {
    // Incremental ingest skips processed documents and force redoes them
    let engine = engine_with_entities();

    engine.add("PostgreSQL backs the Billing system.", Some("doc1".to_string()));
    assert_eq!(engine.stats().unwrap().buffered_docs, 1);

    let first = engine
        .cognify(Default::default(), &cancel())
        .unwrap();
    assert_eq!(first.documents_processed, 1);
    assert!(first.nodes_created >= 2);
    assert_eq!(engine.stats().unwrap().buffered_docs, 0);

    // Same text again: skipped by the processed cache
    engine.add("PostgreSQL backs the Billing system.", Some("doc1".to_string()));
    let second = engine.cognify(Default::default(), &cancel()).unwrap();
    assert_eq!(second.documents_processed, 0);
    assert_eq!(second.documents_skipped, 1);
    assert_eq!(second.nodes_created, 0);

    // Force re-produces the same node set
    let node_count = engine.stats().unwrap().node_count;
    engine.add("PostgreSQL backs the Billing system.", Some("doc1".to_string()));
    let forced = engine
        .cognify(
            noema::CognifyOptions {
                force: true,
                skip_processed: true,
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(forced.documents_processed, 1);
    assert_eq!(engine.stats().unwrap().node_count, node_count);
}

#[test]
fn legacy_artifacts_survive_gc() {
    // Artifacts from the legacy path carry no provenance and GC never
    // touches them, even when a memory later claims the same node id.
    let engine = engine_with_entities();

    engine.add("We use PostgreSQL.", None);
    engine.cognify(Default::default(), &cancel()).unwrap();
    let node_id = ids::node_id("postgresql", EntityType::Technology);
    engine.get_node(&node_id).unwrap();

    // A memory claims the same node, then releases it
    let result = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();
    engine.delete_memory(&result.id, &cancel()).unwrap();

    // Once provenance-tracked, the node became GC-eligible and left with
    // its last reference
    assert!(engine.get_node(&node_id).is_err());

    // A purely legacy node is never collected
    let engine2 = engine_with_entities();
    engine2.add("We use Redis.", None);
    engine2.cognify(Default::default(), &cancel()).unwrap();
    let redis = ids::node_id("redis", EntityType::Technology);

    let other = engine2
        .add_memory(memory_about("Something about the Billing system."), &cancel())
        .unwrap();
    engine2.delete_memory(&other.id, &cancel()).unwrap();
    engine2.get_node(&redis).unwrap();
}

#[test]
fn extraction_failure_leaves_memory_pending() {
    struct FailingLlm;
    impl noema::providers::LlmProvider for FailingLlm {
        fn complete(&self, _system: &str, _prompt: &str) -> noema::Result<String> {
            Err(NoemaError::Extraction("provider down".to_string()))
        }
        fn model_name(&self) -> &str {
            "failing"
        }
    }

    let mut config = NoemaConfig::in_memory();
    config.retry.max_retries = 1;
    config.retry.base_backoff_ms = 1;
    let engine = Noema::with_providers(
        config,
        Arc::new(HashEmbedder::new(64)),
        Some(Arc::new(FailingLlm)),
    )
    .unwrap();

    let result = engine
        .add_memory(memory_about("We use PostgreSQL."), &cancel())
        .unwrap();

    assert_eq!(result.status, MemoryStatus::Pending);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.nodes_created, 0);

    // The row is persisted and recoverable; no partial provenance exists
    let memory = engine.get_memory(&result.id).unwrap();
    assert_eq!(memory.status, MemoryStatus::Pending);
    let (nodes, edges) = engine.provenance_by_memory(&result.id).unwrap();
    assert!(nodes.is_empty());
    assert!(edges.is_empty());
}
