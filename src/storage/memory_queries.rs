//! Database queries for memory records

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::graph_queries::{parse_timestamp, parse_timestamp_opt};
use crate::error::{NoemaError, Result};
use crate::types::{
    ListMemoriesOptions, MemoryId, MemoryRecord, MemorySortField, MemoryStatus, RetentionPolicy,
    SortOrder, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};

const MEMORY_COLUMNS: &str = "id, topic, context, decisions_json, rationale_json, metadata_json,
     created_at, updated_at, version, doc_hash, source, status,
     last_accessed_at, access_count, access_velocity,
     retention_policy, pinned, pinned_at, pinned_reason";

/// Parse a memory record from a database row
pub fn memory_from_row(row: &Row) -> rusqlite::Result<MemoryRecord> {
    let decisions_json: String = row.get("decisions_json")?;
    let rationale_json: String = row.get("rationale_json")?;
    let metadata_json: String = row.get("metadata_json")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_accessed_at: Option<String> = row.get("last_accessed_at")?;
    let status_str: String = row.get("status")?;
    let retention_str: String = row.get("retention_policy")?;
    let pinned: i64 = row.get("pinned")?;
    let pinned_at: Option<String> = row.get("pinned_at")?;

    Ok(MemoryRecord {
        id: row.get("id")?,
        topic: row.get("topic")?,
        context: row.get("context")?,
        decisions: serde_json::from_str(&decisions_json).unwrap_or_default(),
        rationale: serde_json::from_str(&rationale_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        source: row.get("source")?,
        status: status_str.parse().unwrap_or(MemoryStatus::Pending),
        doc_hash: row.get("doc_hash")?,
        version: row.get("version")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        last_accessed_at: last_accessed_at.as_deref().and_then(parse_timestamp_opt),
        access_count: row.get("access_count")?,
        access_velocity: row.get("access_velocity")?,
        retention_policy: retention_str.parse().unwrap_or_default(),
        pinned: pinned != 0,
        pinned_at: pinned_at.as_deref().and_then(parse_timestamp_opt),
        pinned_reason: row.get("pinned_reason")?,
    })
}

/// Insert a new memory row
pub fn insert_memory(conn: &Connection, record: &MemoryRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO memories
            (id, topic, context, decisions_json, rationale_json, metadata_json,
             created_at, updated_at, version, doc_hash, source, status,
             access_count, access_velocity, retention_policy, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0, ?13, ?14)",
        params![
            record.id,
            record.topic,
            record.context,
            serde_json::to_string(&record.decisions)?,
            serde_json::to_string(&record.rationale)?,
            serde_json::to_string(&record.metadata)?,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.version,
            record.doc_hash,
            record.source,
            record.status.as_str(),
            record.retention_policy.as_str(),
            record.pinned as i64,
        ],
    )?;

    Ok(())
}

/// Get a memory by id
pub fn get_memory(conn: &Connection, id: &str) -> Result<MemoryRecord> {
    let sql = format!("SELECT {} FROM memories WHERE id = ?", MEMORY_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;

    stmt.query_row([id], memory_from_row)
        .optional()?
        .ok_or_else(|| NoemaError::MemoryNotFound(id.to_string()))
}

/// Find a memory by payload hash
pub fn find_by_doc_hash(conn: &Connection, doc_hash: &str) -> Result<Option<MemoryRecord>> {
    let sql = format!(
        "SELECT {} FROM memories WHERE doc_hash = ? LIMIT 1",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    Ok(stmt.query_row([doc_hash], memory_from_row).optional()?)
}

/// Set a memory's status
pub fn set_memory_status(conn: &Connection, id: &str, status: MemoryStatus) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET status = ? WHERE id = ?",
        params![status.as_str(), id],
    )?;
    if changed == 0 {
        return Err(NoemaError::MemoryNotFound(id.to_string()));
    }
    Ok(())
}

/// Write back the mutable fields of a memory record
pub fn update_memory_row(conn: &Connection, record: &MemoryRecord) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET
            topic = ?2, context = ?3, decisions_json = ?4, rationale_json = ?5,
            metadata_json = ?6, updated_at = ?7, version = ?8, doc_hash = ?9,
            status = ?10, retention_policy = ?11
         WHERE id = ?1",
        params![
            record.id,
            record.topic,
            record.context,
            serde_json::to_string(&record.decisions)?,
            serde_json::to_string(&record.rationale)?,
            serde_json::to_string(&record.metadata)?,
            record.updated_at.to_rfc3339(),
            record.version,
            record.doc_hash,
            record.status.as_str(),
            record.retention_policy.as_str(),
        ],
    )?;
    if changed == 0 {
        return Err(NoemaError::MemoryNotFound(record.id.clone()));
    }
    Ok(())
}

/// Delete a memory row; provenance rows cascade at the engine layer
pub fn delete_memory(conn: &Connection, id: &str) -> Result<()> {
    let changed = conn.execute("DELETE FROM memories WHERE id = ?", [id])?;
    if changed == 0 {
        return Err(NoemaError::MemoryNotFound(id.to_string()));
    }
    Ok(())
}

/// List memories with filters, ordering and pagination
pub fn list_memories(conn: &Connection, options: &ListMemoriesOptions) -> Result<Vec<MemoryRecord>> {
    let limit = options
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let offset = options.offset.unwrap_or(0).max(0);

    let mut sql = format!("SELECT {} FROM memories WHERE 1=1", MEMORY_COLUMNS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = options.status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(status.as_str().to_string()));
    }

    if let Some(policy) = options.retention_policy {
        sql.push_str(" AND retention_policy = ?");
        params.push(Box::new(policy.as_str().to_string()));
    }

    if let Some(pinned) = options.pinned {
        sql.push_str(" AND pinned = ?");
        params.push(Box::new(pinned as i64));
    }

    let sort_field = options.sort_by.unwrap_or(MemorySortField::UpdatedAt);
    let sort_order = match options.sort_order.unwrap_or_default() {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    sql.push_str(&format!(
        " ORDER BY {} {} LIMIT ? OFFSET ?",
        sort_field.as_column(),
        sort_order
    ));
    params.push(Box::new(limit));
    params.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

    let memories: Vec<MemoryRecord> = stmt
        .query_map(param_refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<_>>()?;

    Ok(memories)
}

/// Total memory count
pub fn count_memories(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?)
}

/// Batched access reinforcement for the memories attached to returned nodes
///
/// Increments access_count, stamps last_accessed_at and recomputes
/// access_velocity (accesses per day since creation) in one statement.
pub fn batch_update_memory_access(conn: &Connection, memory_ids: &[MemoryId]) -> Result<()> {
    if memory_ids.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<&str> = memory_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "UPDATE memories SET
            access_count = access_count + 1,
            last_accessed_at = ?1,
            access_velocity = CAST(access_count + 1 AS REAL)
                / MAX(1.0, julianday(?1) - julianday(created_at))
         WHERE id IN ({})",
        placeholders.join(", ")
    );

    let now = Utc::now().to_rfc3339();
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
    for id in memory_ids {
        params.push(id);
    }

    conn.execute(&sql, params.as_slice())?;
    Ok(())
}

/// Pin or unpin a memory
pub fn set_pinned(conn: &Connection, id: &str, pinned: bool, reason: Option<&str>) -> Result<()> {
    let changed = if pinned {
        conn.execute(
            "UPDATE memories SET pinned = 1, pinned_at = ?, pinned_reason = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), reason, id],
        )?
    } else {
        conn.execute(
            "UPDATE memories SET pinned = 0, pinned_at = NULL, pinned_reason = NULL WHERE id = ?",
            [id],
        )?
    };
    if changed == 0 {
        return Err(NoemaError::MemoryNotFound(id.to_string()));
    }
    Ok(())
}

/// Lightweight per-memory fields the decay decorator needs
#[derive(Debug, Clone)]
pub struct MemoryDecayRow {
    pub id: MemoryId,
    pub access_count: i64,
    pub retention_policy: RetentionPolicy,
    pub pinned: bool,
}

/// Fetch decay-relevant fields for a batch of memories in one query
pub fn memory_decay_rows(
    conn: &Connection,
    memory_ids: &[MemoryId],
) -> Result<HashMap<MemoryId, MemoryDecayRow>> {
    if memory_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<&str> = memory_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT id, access_count, retention_policy, pinned FROM memories WHERE id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        memory_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

    let rows: Vec<MemoryDecayRow> = stmt
        .query_map(param_refs.as_slice(), |row| {
            let retention_str: String = row.get(2)?;
            let pinned: i64 = row.get(3)?;
            Ok(MemoryDecayRow {
                id: row.get(0)?,
                access_count: row.get(1)?,
                retention_policy: retention_str.parse().unwrap_or_default(),
                pinned: pinned != 0,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;

    Ok(rows.into_iter().map(|r| (r.id.clone(), r)).collect())
}

/// Counts by status, by retention policy, and pinned total
pub fn memory_stats(
    conn: &Connection,
) -> Result<(HashMap<String, i64>, HashMap<String, i64>, i64)> {
    let mut by_status = HashMap::new();
    let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM memories GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        by_status.insert(status, count);
    }

    let mut by_retention = HashMap::new();
    let mut stmt = conn
        .prepare_cached("SELECT retention_policy, COUNT(*) FROM memories GROUP BY retention_policy")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (policy, count) = row?;
        by_retention.insert(policy, count);
    }

    let pinned_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM memories WHERE pinned = 1", [], |r| {
            r.get(0)
        })?;

    Ok((by_status, by_retention, pinned_count))
}

/// Minimal record for storage-layer tests
#[cfg(test)]
pub(crate) fn make_record(topic: &str) -> MemoryRecord {
    let now = Utc::now();
    let context = format!("{} context", topic);
    MemoryRecord {
        id: uuid::Uuid::new_v4().to_string(),
        topic: topic.to_string(),
        context: context.clone(),
        decisions: vec![],
        rationale: vec![],
        metadata: HashMap::new(),
        source: None,
        status: MemoryStatus::Pending,
        doc_hash: crate::ids::doc_hash(topic, &context, &[], &[]),
        version: 1,
        created_at: now,
        updated_at: now,
        last_accessed_at: None,
        access_count: 0,
        access_velocity: 0.0,
        retention_policy: RetentionPolicy::Standard,
        pinned: false,
        pinned_at: None,
        pinned_reason: None,
    }
}
