//! Prune engine behavior: retention policies, pinning, supersession grace
//! and dry-run evaluation.

mod common;

use std::sync::Arc;

use common::KeywordLlm;
use noema::extract::Orchestrator;
use noema::pipeline::MemoryPipeline;
use noema::providers::HashEmbedder;
use noema::prune::PruneEngine;
use noema::storage::vector::VectorStore;
use noema::storage::Storage;
use noema::{
    AddMemoryInput, CancelToken, ChunkConfig, DecayConfig, MemoryResult, PruneOptions,
    RetentionPolicy, RetryConfig,
};

struct Fixture {
    storage: Storage,
    pipeline: Arc<MemoryPipeline>,
    prune: PruneEngine,
}

fn fixture() -> Fixture {
    let storage = Storage::open_in_memory().unwrap();
    let vectors = Arc::new(VectorStore::new(storage.clone()));
    let llm = KeywordLlm::new(
        vec![
            ("PostgreSQL", "Technology", "relational database"),
            ("Redis", "Technology", "cache"),
            ("Kafka", "Technology", "event bus"),
        ],
        vec![],
    );
    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        RetryConfig {
            max_retries: 0,
            base_backoff_ms: 1,
        },
    ));
    let pipeline = Arc::new(MemoryPipeline::new(
        storage.clone(),
        vectors,
        Some(orchestrator),
        Arc::new(HashEmbedder::new(32)),
        ChunkConfig::default(),
    ));
    let prune = PruneEngine::new(pipeline.clone(), DecayConfig::default());
    Fixture {
        storage,
        pipeline,
        prune,
    }
}

fn cancel() -> CancelToken {
    CancelToken::new()
}

fn add(fixture: &Fixture, topic: &str, context: &str, policy: RetentionPolicy) -> MemoryResult {
    fixture
        .pipeline
        .add_memory(
            AddMemoryInput {
                topic: topic.to_string(),
                context: context.to_string(),
                retention_policy: policy,
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap()
}

fn backdate_memory(fixture: &Fixture, id: &str, days: i64) {
    let then = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    fixture
        .storage
        .with_connection(|conn| {
            conn.execute(
                "UPDATE memories SET created_at = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![then, id],
            )?;
            Ok(())
        })
        .unwrap();
}

fn pin(fixture: &Fixture, id: &str) {
    fixture
        .storage
        .with_transaction(|conn| {
            noema::storage::memory_queries::set_pinned(conn, id, true, Some("keep"))
        })
        .unwrap();
}

fn memory_exists(fixture: &Fixture, id: &str) -> bool {
    fixture
        .storage
        .with_connection(|conn| {
            Ok(noema::storage::memory_queries::get_memory(conn, id).is_ok())
        })
        .unwrap()
}

#[test]
fn pinned_memories_survive_age_prune() {
    // Both memories are past max_age_days; only the unpinned one goes
    let fixture = fixture();

    let pinned = add(&fixture, "Keep", "PostgreSQL is load-bearing.", RetentionPolicy::Standard);
    let doomed = add(&fixture, "Drop", "Redis was an experiment.", RetentionPolicy::Standard);
    backdate_memory(&fixture, &pinned.id, 10);
    backdate_memory(&fixture, &doomed.id, 10);
    pin(&fixture, &pinned.id);

    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert!(memory_exists(&fixture, &pinned.id));
    assert!(!memory_exists(&fixture, &doomed.id));
    assert_eq!(result.memory_ids, vec![doomed.id.clone()]);

    // Only the unpinned memory's node was collected
    let (pinned_nodes, _) = fixture
        .storage
        .with_connection(|conn| {
            noema::storage::provenance::provenance_by_memory(conn, &pinned.id)
        })
        .unwrap();
    assert_eq!(pinned_nodes.len(), 1);
    assert_eq!(result.pruned, 1);
    assert!(!result.node_ids.contains(&pinned_nodes[0]));
}

#[test]
fn permanent_retention_is_untouchable() {
    let fixture = fixture();

    let permanent = add(
        &fixture,
        "Charter",
        "Kafka carries every event.",
        RetentionPolicy::Permanent,
    );
    backdate_memory(&fixture, &permanent.id, 3650);

    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                min_decay_score: Some(0.99),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert!(memory_exists(&fixture, &permanent.id));
    assert!(result.memory_ids.is_empty());
    assert_eq!(result.pruned, 0);
}

#[test]
fn superseded_memories_prune_after_grace() {
    let fixture = fixture();

    let old = add(&fixture, "V1", "Redis holds sessions.", RetentionPolicy::Standard);
    let new = add(
        &fixture,
        "V2",
        "PostgreSQL holds sessions now.",
        RetentionPolicy::Standard,
    );
    fixture
        .storage
        .with_transaction(|conn| {
            noema::storage::provenance::record_supersession(conn, &new.id, &old.id, Some("migrated"))
        })
        .unwrap();

    // Grace period still running: nothing happens
    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                prune_superseded: true,
                supersession_grace_days: 30.0,
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert!(memory_exists(&fixture, &old.id));
    assert_eq!(result.memory_ids.len(), 0);

    // Grace elapsed: the superseded memory goes, the superseder stays
    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                prune_superseded: true,
                supersession_grace_days: 0.0,
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert!(!memory_exists(&fixture, &old.id));
    assert!(memory_exists(&fixture, &new.id));
    assert_eq!(result.memory_ids, vec![old.id.clone()]);
}

#[test]
fn ephemeral_half_life_shortens_retention() {
    let fixture = fixture();

    let ephemeral = add(
        &fixture,
        "Scratch",
        "Redis scratch notes.",
        RetentionPolicy::Ephemeral,
    );
    let standard = add(
        &fixture,
        "Durable",
        "PostgreSQL design notes.",
        RetentionPolicy::Standard,
    );
    backdate_memory(&fixture, &ephemeral.id, 8);
    backdate_memory(&fixture, &standard.id, 8);

    // 8 days: ephemeral (7-day half-life) decays to ~0.45, standard
    // (30-day default) only to ~0.83
    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                min_decay_score: Some(0.5),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert!(!memory_exists(&fixture, &ephemeral.id));
    assert!(memory_exists(&fixture, &standard.id));
    assert_eq!(result.memory_ids, vec![ephemeral.id.clone()]);
}

#[test]
fn decision_policy_resists_age_cutoff() {
    let fixture = fixture();

    let decision = add(
        &fixture,
        "ADR-7",
        "We commit to PostgreSQL.",
        RetentionPolicy::Decision,
    );
    backdate_memory(&fixture, &decision.id, 90);

    // A 90-day-old decision outlives a blanket 30-day cutoff
    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(30.0),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert!(memory_exists(&fixture, &decision.id));
    assert_eq!(result.memory_ids.len(), 0);

    // But the 365-day half-life still applies through the decay threshold
    backdate_memory(&fixture, &decision.id, 1200);
    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                min_decay_score: Some(0.2),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert!(!memory_exists(&fixture, &decision.id));
    assert_eq!(result.memory_ids.len(), 1);
}

#[test]
fn retention_until_override_protects() {
    let fixture = fixture();

    let mut input = AddMemoryInput {
        topic: "Hold".to_string(),
        context: "Redis stays until review.".to_string(),
        retention_policy: RetentionPolicy::Ephemeral,
        ..Default::default()
    };
    let until = (chrono::Utc::now() + chrono::Duration::days(365)).to_rfc3339();
    input
        .metadata
        .insert("retention_until".to_string(), serde_json::json!(until));

    let held = fixture.pipeline.add_memory(input, &cancel()).unwrap();
    backdate_memory(&fixture, &held.id, 60);

    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                min_decay_score: Some(0.99),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert!(memory_exists(&fixture, &held.id));
    assert_eq!(result.memory_ids.len(), 0);
}

#[test]
fn dry_run_reports_without_deleting() {
    let fixture = fixture();

    let doomed = add(&fixture, "Old", "Redis was an experiment.", RetentionPolicy::Standard);
    backdate_memory(&fixture, &doomed.id, 10);

    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                dry_run: true,
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert_eq!(result.memory_ids, vec![doomed.id.clone()]);
    assert_eq!(result.pruned, 1);
    assert!(memory_exists(&fixture, &doomed.id));

    // A second, real pass deletes exactly what the dry run reported
    let real = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();
    assert_eq!(real.memory_ids, result.memory_ids);
    assert_eq!(real.node_ids, result.node_ids);
    assert!(!memory_exists(&fixture, &doomed.id));
}

#[test]
fn shared_nodes_survive_partial_prune() {
    let fixture = fixture();

    let doomed = add(&fixture, "Old", "PostgreSQL note.", RetentionPolicy::Standard);
    let keeper = add(&fixture, "New", "PostgreSQL still in use.", RetentionPolicy::Standard);
    backdate_memory(&fixture, &doomed.id, 10);

    let (shared_nodes, _) = fixture
        .storage
        .with_connection(|conn| {
            noema::storage::provenance::provenance_by_memory(conn, &keeper.id)
        })
        .unwrap();

    let result = fixture
        .prune
        .prune(
            &PruneOptions {
                max_age_days: Some(1.0),
                ..Default::default()
            },
            &cancel(),
        )
        .unwrap();

    assert_eq!(result.memory_ids, vec![doomed.id.clone()]);
    // The PostgreSQL node is still claimed by the keeper
    assert_eq!(result.pruned, 0);
    let node_exists = fixture
        .storage
        .with_connection(|conn| {
            Ok(noema::storage::graph_queries::fetch_node(conn, &shared_nodes[0])?.is_some())
        })
        .unwrap();
    assert!(node_exists);
}
