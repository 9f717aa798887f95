//! Core types for Noema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Unique identifier for a memory record (opaque, stable)
pub type MemoryId = String;

/// Deterministic identifier for a graph node (low 16 hex digits of SHA-256)
pub type NodeId = String;

/// Deterministic identifier for a graph edge
pub type EdgeId = String;

/// An entity in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Deterministic identifier derived from normalized (name, type)
    pub id: NodeId,
    /// Entity name as extracted
    pub name: String,
    /// Entity type from the closed set
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Free-text description accumulated from extraction
    pub description: String,
    /// Optional embedding vector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: i64,
    /// Arbitrary metadata as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// A directed labeled relation between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Deterministic identifier derived from (source_id, relation, target_id)
    pub id: EdgeId,
    pub source_id: NodeId,
    pub relation: String,
    pub target_id: NodeId,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

/// Entity type classification (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EntityType {
    Person,
    #[default]
    Concept,
    System,
    Decision,
    Event,
    Technology,
    Pattern,
    Problem,
    Goal,
    Location,
    Organization,
    Document,
    Process,
    Requirement,
    Feature,
    Task,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "Person",
            EntityType::Concept => "Concept",
            EntityType::System => "System",
            EntityType::Decision => "Decision",
            EntityType::Event => "Event",
            EntityType::Technology => "Technology",
            EntityType::Pattern => "Pattern",
            EntityType::Problem => "Problem",
            EntityType::Goal => "Goal",
            EntityType::Location => "Location",
            EntityType::Organization => "Organization",
            EntityType::Document => "Document",
            EntityType::Process => "Process",
            EntityType::Requirement => "Requirement",
            EntityType::Feature => "Feature",
            EntityType::Task => "Task",
        }
    }

    pub fn all() -> &'static [EntityType] {
        &[
            EntityType::Person,
            EntityType::Concept,
            EntityType::System,
            EntityType::Decision,
            EntityType::Event,
            EntityType::Technology,
            EntityType::Pattern,
            EntityType::Problem,
            EntityType::Goal,
            EntityType::Location,
            EntityType::Organization,
            EntityType::Document,
            EntityType::Process,
            EntityType::Requirement,
            EntityType::Feature,
            EntityType::Task,
        ]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "person" => Ok(EntityType::Person),
            "concept" => Ok(EntityType::Concept),
            "system" => Ok(EntityType::System),
            "decision" => Ok(EntityType::Decision),
            "event" => Ok(EntityType::Event),
            "technology" => Ok(EntityType::Technology),
            "pattern" => Ok(EntityType::Pattern),
            "problem" => Ok(EntityType::Problem),
            "goal" => Ok(EntityType::Goal),
            "location" => Ok(EntityType::Location),
            "organization" => Ok(EntityType::Organization),
            "document" => Ok(EntityType::Document),
            "process" => Ok(EntityType::Process),
            "requirement" => Ok(EntityType::Requirement),
            "feature" => Ok(EntityType::Feature),
            "task" => Ok(EntityType::Task),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// Memory record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    /// Persisted but graph artifacts not yet linked
    #[default]
    Pending,
    /// Graph write phase committed and provenance fully linked
    Complete,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Pending => "pending",
            MemoryStatus::Complete => "complete",
        }
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MemoryStatus::Pending),
            "complete" => Ok(MemoryStatus::Complete),
            _ => Err(format!("Unknown memory status: {}", s)),
        }
    }
}

/// Retention policy controlling decay and prune behavior
///
/// Policies resolve to an effective half-life:
/// - `Permanent`: exempt from decay and prune
/// - `Decision`: 365-day half-life
/// - `Standard`: engine-configured default half-life
/// - `Ephemeral`: 7-day half-life
/// - `Session`: 1-day half-life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    Permanent,
    Decision,
    #[default]
    Standard,
    Ephemeral,
    Session,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Permanent => "permanent",
            RetentionPolicy::Decision => "decision",
            RetentionPolicy::Standard => "standard",
            RetentionPolicy::Ephemeral => "ephemeral",
            RetentionPolicy::Session => "session",
        }
    }

    /// Policy-specific half-life in days; None means the configured default
    /// applies (`Standard`) or decay is exempt entirely (`Permanent`).
    pub fn half_life_days(&self) -> Option<f64> {
        match self {
            RetentionPolicy::Permanent => None,
            RetentionPolicy::Decision => Some(365.0),
            RetentionPolicy::Standard => None,
            RetentionPolicy::Ephemeral => Some(7.0),
            RetentionPolicy::Session => Some(1.0),
        }
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permanent" => Ok(RetentionPolicy::Permanent),
            "decision" => Ok(RetentionPolicy::Decision),
            "standard" => Ok(RetentionPolicy::Standard),
            "ephemeral" => Ok(RetentionPolicy::Ephemeral),
            "session" => Ok(RetentionPolicy::Session),
            _ => Err(format!("Unknown retention policy: {}", s)),
        }
    }
}

/// A user-facing first-class memory record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub topic: String,
    pub context: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub rationale: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Where the memory came from (agent, import, etc.)
    pub source: Option<String>,
    #[serde(default)]
    pub status: MemoryStatus,
    /// SHA-256 over canonical JSON of (topic, context, decisions, rationale)
    pub doc_hash: String,
    /// Monotonic version, incremented on every update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: i64,
    /// Accesses per day since creation, recomputed on reinforcement
    #[serde(default)]
    pub access_velocity: f64,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub pinned_reason: Option<String>,
}

/// Directed supersession link between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersessionRecord {
    pub superseding_id: MemoryId,
    pub superseded_id: MemoryId,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cache entry for incremental ingest deduplication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub hash: String,
    pub source: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub chunk_count: i64,
}

/// Input for creating a new memory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddMemoryInput {
    pub topic: String,
    pub context: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub rationale: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub source: Option<String>,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    /// Memory ids this memory supersedes
    #[serde(default)]
    pub supersedes: Vec<MemoryId>,
    pub supersede_reason: Option<String>,
}

/// Partial update for a memory; None fields are left unchanged
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateMemoryInput {
    pub topic: Option<String>,
    pub context: Option<String>,
    pub decisions: Option<Vec<String>>,
    pub rationale: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub retention_policy: Option<RetentionPolicy>,
    /// Optimistic concurrency token; mismatch fails with VersionConflict
    pub expected_version: Option<i64>,
}

impl UpdateMemoryInput {
    /// True if any field participating in doc_hash changes
    pub fn changes_payload(&self) -> bool {
        self.topic.is_some()
            || self.context.is_some()
            || self.decisions.is_some()
            || self.rationale.is_some()
    }
}

/// Result of add_memory / update_memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryResult {
    pub id: MemoryId,
    pub status: MemoryStatus,
    pub memories_superseded: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub edges_skipped: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Options for the legacy cognify ingest path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognifyOptions {
    /// Re-process documents even if their hash is already cached
    #[serde(default)]
    pub force: bool,
    /// Skip documents whose hash is in the processed cache
    #[serde(default = "default_true")]
    pub skip_processed: bool,
}

impl Default for CognifyOptions {
    fn default() -> Self {
        Self {
            force: false,
            skip_processed: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Result of a cognify pass over the buffered documents
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CognifyResult {
    pub documents_processed: usize,
    pub documents_skipped: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub edges_skipped: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Search mode selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Graph,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Graph => "graph",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

/// Which retrieval path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Vector,
    Graph,
    Hybrid,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Vector => "vector",
            ResultSource::Graph => "graph",
            ResultSource::Hybrid => "hybrid",
        }
    }
}

/// Options for search operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub graph_depth: Option<usize>,
    #[serde(default)]
    pub mode: SearchMode,
    /// Seed node ids for graph-only mode
    #[serde(default)]
    pub seed_node_ids: Vec<NodeId>,
    /// Attach contributing memory ids to each result
    #[serde(default = "default_true")]
    pub include_memories: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            graph_depth: None,
            mode: SearchMode::Hybrid,
            seed_node_ids: vec![],
            include_memories: true,
        }
    }
}

/// Default result count when top_k is unset
pub const DEFAULT_TOP_K: usize = 10;

/// Default BFS expansion depth when graph_depth is unset
pub const DEFAULT_GRAPH_DEPTH: usize = 1;

/// A single search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub node_id: NodeId,
    pub node: Node,
    pub score: f64,
    pub source: ResultSource,
    /// 0 for direct vector hits, BFS depth otherwise
    pub graph_depth: usize,
    /// Memory ids that reference this node, most recently updated first
    #[serde(default)]
    pub memory_ids: Vec<MemoryId>,
}

/// Fields to sort memory listings by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemorySortField {
    #[default]
    UpdatedAt,
    CreatedAt,
    AccessCount,
}

impl MemorySortField {
    pub fn as_column(&self) -> &'static str {
        match self {
            MemorySortField::UpdatedAt => "updated_at",
            MemorySortField::CreatedAt => "created_at",
            MemorySortField::AccessCount => "access_count",
        }
    }
}

/// Sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Options for listing memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMemoriesOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<MemoryStatus>,
    pub retention_policy: Option<RetentionPolicy>,
    pub pinned: Option<bool>,
    pub sort_by: Option<MemorySortField>,
    pub sort_order: Option<SortOrder>,
}

/// Default page size for list_memories
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Maximum page size for list_memories
pub const MAX_LIST_LIMIT: i64 = 100;

/// Options for prune evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneOptions {
    /// Prune artifacts older than this many days
    pub max_age_days: Option<f64>,
    /// Prune artifacts whose decay multiplier falls below this value
    pub min_decay_score: Option<f64>,
    /// Prune memories that have been superseded past the grace period
    #[serde(default)]
    pub prune_superseded: bool,
    /// Days a superseded memory is retained before becoming prunable
    #[serde(default = "default_grace_days")]
    pub supersession_grace_days: f64,
    /// Evaluate without deleting anything
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            max_age_days: None,
            min_decay_score: None,
            prune_superseded: false,
            supersession_grace_days: default_grace_days(),
            dry_run: false,
        }
    }
}

fn default_grace_days() -> f64 {
    30.0
}

/// Result of a prune pass
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PruneResult {
    /// Memories and nodes examined
    pub evaluated: usize,
    /// Nodes deleted (or that would be deleted under dry_run)
    pub pruned: usize,
    pub node_ids: Vec<NodeId>,
    /// Memories deleted (or that would be deleted under dry_run)
    pub memory_ids: Vec<MemoryId>,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stats {
    pub node_count: i64,
    pub edge_count: i64,
    pub memory_count: i64,
    pub buffered_docs: usize,
    pub last_cognified_at: Option<DateTime<Utc>>,
    pub memories_by_status: HashMap<String, i64>,
    pub memories_by_retention: HashMap<String, i64>,
    pub pinned_count: i64,
    pub db_size_bytes: i64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoemaConfig {
    /// Path to the SQLite database; ":memory:" selects the ephemeral mode
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chunking: ChunkConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for NoemaConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            chunking: ChunkConfig::default(),
            decay: DecayConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl NoemaConfig {
    /// Configuration backed by an in-memory database (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            embedding: EmbeddingConfig {
                provider: "hash".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn default_db_path() -> String {
    dirs::data_dir()
        .map(|d| d.join("noema").join("noema.db"))
        .and_then(|p| p.to_str().map(String::from))
        .unwrap_or_else(|| "noema.db".to_string())
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider to use: "openai" or "hash"
    pub provider: String,
    pub api_key: Option<String>,
    /// OpenAI-compatible API base URL (for Azure, OpenRouter, etc.)
    pub base_url: Option<String>,
    /// Model name override (e.g., "text-embedding-3-small")
    pub model: Option<String>,
    /// Embedding dimensions (must match model output)
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            api_key: None,
            base_url: None,
            model: None,
            dimensions: 384,
        }
    }
}

/// LLM provider configuration for entity and relation extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider to use: "openai" or "none"
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}

fn default_overlap() -> usize {
    200
}

/// Which timestamp anchors decay age computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecayBasis {
    /// last_accessed_at when present, created_at otherwise
    #[default]
    Access,
    /// created_at only
    Creation,
}

/// Decay decorator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
    #[serde(default)]
    pub basis: DecayBasis,
    #[serde(default)]
    pub frequency_enabled: bool,
    #[serde(default = "default_reference_access_count")]
    pub reference_access_count: i64,
    /// Results with a final score below this are dropped
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            half_life_days: default_half_life(),
            basis: DecayBasis::Access,
            frequency_enabled: false,
            reference_access_count: default_reference_access_count(),
            min_score: default_min_score(),
        }
    }
}

fn default_half_life() -> f64 {
    30.0
}

fn default_reference_access_count() -> i64 {
    10
}

fn default_min_score() -> f64 {
    0.001
}

/// Retry policy for provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in milliseconds; doubles per attempt with jitter
    #[serde(default = "default_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token with an optional deadline
///
/// Checked before each provider call and between transaction boundaries.
/// Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires after the given duration
    pub fn with_deadline(timeout: std::time::Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Request cancellation; observed by all clones
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Error out if cancelled or past the deadline
    pub fn check(&self, what: &str) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::NoemaError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip() {
        for ty in EntityType::all() {
            let parsed: EntityType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, *ty);
        }
    }

    #[test]
    fn test_entity_type_case_insensitive() {
        let ty: EntityType = "  TECHNOLOGY ".parse().unwrap();
        assert_eq!(ty, EntityType::Technology);
        assert!("Widget".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_retention_half_lives() {
        assert_eq!(RetentionPolicy::Decision.half_life_days(), Some(365.0));
        assert_eq!(RetentionPolicy::Ephemeral.half_life_days(), Some(7.0));
        assert_eq!(RetentionPolicy::Session.half_life_days(), Some(1.0));
        assert_eq!(RetentionPolicy::Standard.half_life_days(), None);
        assert_eq!(RetentionPolicy::Permanent.half_life_days(), None);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("op").is_ok());

        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check("op").is_err());
    }

    #[test]
    fn test_cancel_token_deadline() {
        let token = CancelToken::with_deadline(std::time::Duration::ZERO);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_update_changes_payload() {
        let update = UpdateMemoryInput {
            metadata: Some(HashMap::new()),
            ..Default::default()
        };
        assert!(!update.changes_payload());

        let update = UpdateMemoryInput {
            context: Some("new".to_string()),
            ..Default::default()
        };
        assert!(update.changes_payload());
    }
}
