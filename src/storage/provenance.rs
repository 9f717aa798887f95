//! Provenance links, supersession records and the ingest cache
//!
//! Provenance rows associate a memory with the nodes and edges derived
//! from it; they are the substrate of reference counting. Artifacts that
//! have ever carried a provenance row are flagged `tracked`; legacy
//! artifacts (created by the pre-provenance ingest path) never set the
//! flag and are permanently exempt from GC.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet, VecDeque};

use super::graph_queries::parse_timestamp;
use crate::error::{NoemaError, Result};
use crate::types::{EdgeId, MemoryId, NodeId, SupersessionRecord};

/// Link a memory to its derived nodes and edges, flagging them as tracked
pub fn link_provenance(
    conn: &Connection,
    memory_id: &str,
    node_ids: &[NodeId],
    edge_ids: &[EdgeId],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    let mut node_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO memory_nodes (memory_id, node_id, created_at) VALUES (?, ?, ?)",
    )?;
    let mut track_node = conn.prepare_cached("UPDATE nodes SET tracked = 1 WHERE id = ?")?;
    for node_id in node_ids {
        node_stmt.execute(params![memory_id, node_id, now])?;
        track_node.execute([node_id])?;
    }

    let mut edge_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO memory_edges (memory_id, edge_id, created_at) VALUES (?, ?, ?)",
    )?;
    let mut track_edge = conn.prepare_cached("UPDATE edges SET tracked = 1 WHERE id = ?")?;
    for edge_id in edge_ids {
        edge_stmt.execute(params![memory_id, edge_id, now])?;
        track_edge.execute([edge_id])?;
    }

    Ok(())
}

/// Remove a memory's provenance claims, returning the artifact ids it held
pub fn unlink_provenance(conn: &Connection, memory_id: &str) -> Result<(Vec<NodeId>, Vec<EdgeId>)> {
    let (node_ids, edge_ids) = provenance_by_memory(conn, memory_id)?;

    conn.execute("DELETE FROM memory_nodes WHERE memory_id = ?", [memory_id])?;
    conn.execute("DELETE FROM memory_edges WHERE memory_id = ?", [memory_id])?;

    Ok((node_ids, edge_ids))
}

/// The node and edge ids a memory currently claims
pub fn provenance_by_memory(
    conn: &Connection,
    memory_id: &str,
) -> Result<(Vec<NodeId>, Vec<EdgeId>)> {
    let mut stmt = conn
        .prepare_cached("SELECT node_id FROM memory_nodes WHERE memory_id = ? ORDER BY node_id")?;
    let node_ids: Vec<NodeId> = stmt
        .query_map([memory_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn
        .prepare_cached("SELECT edge_id FROM memory_edges WHERE memory_id = ? ORDER BY edge_id")?;
    let edge_ids: Vec<EdgeId> = stmt
        .query_map([memory_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    Ok((node_ids, edge_ids))
}

/// For each node id, the memory ids referencing it, most recently updated
/// first. One query for the whole batch; used to avoid N+1 during search
/// enrichment.
pub fn memories_by_node_batched(
    conn: &Connection,
    node_ids: &[NodeId],
) -> Result<HashMap<NodeId, Vec<MemoryId>>> {
    if node_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<&str> = node_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT mn.node_id, mn.memory_id
         FROM memory_nodes mn
         JOIN memories m ON m.id = mn.memory_id
         WHERE mn.node_id IN ({})
         ORDER BY m.updated_at DESC",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        node_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

    let rows: Vec<(NodeId, MemoryId)> = stmt
        .query_map(param_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut result: HashMap<NodeId, Vec<MemoryId>> = HashMap::new();
    for (node_id, memory_id) in rows {
        result.entry(node_id).or_default().push(memory_id);
    }

    Ok(result)
}

/// Number of memories referencing a node
pub fn count_node_references(conn: &Connection, node_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM memory_nodes WHERE node_id = ?",
        [node_id],
        |row| row.get(0),
    )?)
}

/// Number of memories referencing an edge
pub fn count_edge_references(conn: &Connection, edge_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM memory_edges WHERE edge_id = ?",
        [edge_id],
        |row| row.get(0),
    )?)
}

/// Whether a node has ever carried a provenance row
///
/// Missing nodes report false.
pub fn node_tracked(conn: &Connection, node_id: &str) -> Result<bool> {
    use rusqlite::OptionalExtension;
    let tracked: Option<i64> = conn
        .query_row("SELECT tracked FROM nodes WHERE id = ?", [node_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(tracked.map(|t| t != 0).unwrap_or(false))
}

/// Whether an edge has ever carried a provenance row
///
/// Missing edges report false.
pub fn edge_tracked(conn: &Connection, edge_id: &str) -> Result<bool> {
    use rusqlite::OptionalExtension;
    let tracked: Option<i64> = conn
        .query_row("SELECT tracked FROM edges WHERE id = ?", [edge_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(tracked.map(|t| t != 0).unwrap_or(false))
}

/// Whether a node is referenced by any pinned or permanent memory
pub fn node_protected(conn: &Connection, node_id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0
         FROM memory_nodes mn
         JOIN memories m ON m.id = mn.memory_id
         WHERE mn.node_id = ? AND (m.pinned = 1 OR m.retention_policy = 'permanent')",
        [node_id],
        |row| row.get(0),
    )?)
}

// ============================================================================
// Supersession
// ============================================================================

fn supersession_from_row(row: &rusqlite::Row) -> rusqlite::Result<SupersessionRecord> {
    let created_at: String = row.get("created_at")?;
    Ok(SupersessionRecord {
        superseding_id: row.get("superseding_id")?,
        superseded_id: row.get("superseded_id")?,
        reason: row.get("reason")?,
        created_at: parse_timestamp(&created_at),
    })
}

/// Record that one memory supersedes another
///
/// Self-supersession and cycles are rejected; the supersession relation
/// must remain a DAG.
pub fn record_supersession(
    conn: &Connection,
    superseding_id: &str,
    superseded_id: &str,
    reason: Option<&str>,
) -> Result<()> {
    if superseding_id == superseded_id {
        return Err(NoemaError::Supersession(format!(
            "memory {} cannot supersede itself",
            superseding_id
        )));
    }

    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?",
        [superseded_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(NoemaError::Supersession(format!(
            "superseded memory {} does not exist",
            superseded_id
        )));
    }

    // Cycle check: reject if the superseded memory already (transitively)
    // supersedes the superseding one.
    let mut visited: HashSet<MemoryId> = HashSet::new();
    let mut queue: VecDeque<MemoryId> = VecDeque::new();
    queue.push_back(superseded_id.to_string());

    let mut stmt = conn
        .prepare_cached("SELECT superseded_id FROM memory_supersession WHERE superseding_id = ?")?;

    while let Some(current) = queue.pop_front() {
        if current == superseding_id {
            return Err(NoemaError::Supersession(format!(
                "supersession {} -> {} would create a cycle",
                superseding_id, superseded_id
            )));
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let next: Vec<MemoryId> = stmt
            .query_map([&current], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        queue.extend(next);
    }

    conn.execute(
        "INSERT OR IGNORE INTO memory_supersession
            (superseding_id, superseded_id, reason, created_at)
         VALUES (?, ?, ?, ?)",
        params![superseding_id, superseded_id, reason, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

/// Direct links where this memory is the superseding side
pub fn superseding_of(conn: &Connection, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT superseding_id, superseded_id, reason, created_at
         FROM memory_supersession WHERE superseding_id = ?
         ORDER BY created_at",
    )?;
    let records: Vec<SupersessionRecord> = stmt
        .query_map([memory_id], supersession_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(records)
}

/// Direct links where this memory has been superseded
pub fn superseded_by(conn: &Connection, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT superseding_id, superseded_id, reason, created_at
         FROM memory_supersession WHERE superseded_id = ?
         ORDER BY created_at",
    )?;
    let records: Vec<SupersessionRecord> = stmt
        .query_map([memory_id], supersession_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(records)
}

/// Walk the full superseded lineage below a memory, breadth-first
pub fn supersession_chain(conn: &Connection, memory_id: &str) -> Result<Vec<SupersessionRecord>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<MemoryId> = HashSet::new();
    let mut queue: VecDeque<MemoryId> = VecDeque::new();
    queue.push_back(memory_id.to_string());

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for record in superseding_of(conn, &current)? {
            queue.push_back(record.superseded_id.clone());
            chain.push(record);
        }
    }

    Ok(chain)
}

/// Timestamp of the most recent supersession event against this memory
pub fn superseded_at(conn: &Connection, memory_id: &str) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM memory_supersession WHERE superseded_id = ?",
            [memory_id],
            |row| row.get(0),
        )
        .unwrap_or(None);
    Ok(latest.as_deref().map(parse_timestamp))
}

// ============================================================================
// Processed-document cache
// ============================================================================

/// Record a document hash as processed
pub fn mark_document_processed(
    conn: &Connection,
    hash: &str,
    source: Option<&str>,
    chunk_count: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO processed_documents (hash, source, processed_at, chunk_count)
         VALUES (?, ?, ?, ?)",
        params![hash, source, Utc::now().to_rfc3339(), chunk_count],
    )?;
    Ok(())
}

/// Whether a document hash is in the processed cache
pub fn is_document_processed(conn: &Connection, hash: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM processed_documents WHERE hash = ?",
        [hash],
        |row| row.get(0),
    )?)
}

/// Drop the whole processed cache, forcing full re-ingest
pub fn clear_processed_documents(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM processed_documents", [])?)
}
