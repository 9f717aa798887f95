//! Database queries for graph nodes and edges

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet, VecDeque};

use super::vector::{blob_to_embedding, embedding_to_blob};
use crate::error::{NoemaError, Result};
use crate::types::{Edge, EntityType, Node, NodeId};

/// Parse a node from a database row
pub fn node_from_row(row: &Row) -> rusqlite::Result<Node> {
    let id: String = row.get("id")?;
    let name: String = row.get("name")?;
    let type_str: String = row.get("type")?;
    let description: String = row.get("description")?;
    let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
    let created_at: String = row.get("created_at")?;
    let metadata_str: Option<String> = row.get("metadata")?;
    let last_accessed_at: Option<String> = row.get("last_accessed_at").unwrap_or(None);
    let access_count: i64 = row.get("access_count").unwrap_or(0);

    Ok(Node {
        id,
        name,
        entity_type: type_str.parse().unwrap_or(EntityType::Concept),
        description,
        embedding: embedding_blob.as_deref().map(blob_to_embedding),
        created_at: parse_timestamp(&created_at),
        last_accessed_at: last_accessed_at.as_deref().and_then(parse_timestamp_opt),
        access_count,
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Parse an edge from a database row
pub fn edge_from_row(row: &Row) -> rusqlite::Result<Edge> {
    let created_at: String = row.get("created_at")?;
    Ok(Edge {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        relation: row.get("relation")?,
        target_id: row.get("target_id")?,
        weight: row.get("weight")?,
        created_at: parse_timestamp(&created_at),
    })
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_timestamp_opt(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Insert or replace a node by id
///
/// Content attributes (name, type, description, embedding, metadata) are
/// last-writer-wins; created_at, access counters and tracking survive the
/// upsert.
pub fn upsert_node(conn: &Connection, node: &Node) -> Result<()> {
    let metadata_json = node
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO nodes (id, name, type, description, embedding, created_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             type = excluded.type,
             description = excluded.description,
             embedding = excluded.embedding,
             metadata = excluded.metadata",
        params![
            node.id,
            node.name,
            node.entity_type.as_str(),
            node.description,
            node.embedding.as_deref().map(embedding_to_blob),
            node.created_at.to_rfc3339(),
            metadata_json,
        ],
    )?;

    Ok(())
}

/// Fetch a node without touching access tracking
pub fn fetch_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, type, description, embedding, created_at, metadata,
                last_accessed_at, access_count
         FROM nodes WHERE id = ?",
    )?;

    Ok(stmt.query_row([id], node_from_row).optional()?)
}

/// Get a node by id, updating last_accessed_at on hit
pub fn get_node(conn: &Connection, id: &str) -> Result<Node> {
    let node = fetch_node(conn, id)?.ok_or_else(|| NoemaError::NodeNotFound(id.to_string()))?;

    conn.execute(
        "UPDATE nodes SET last_accessed_at = ? WHERE id = ?",
        params![Utc::now().to_rfc3339(), id],
    )?;

    Ok(node)
}

/// Find nodes whose normalized name matches, case- and whitespace-insensitively
///
/// Results are ordered by id for deterministic output.
pub fn find_nodes_by_name(conn: &Connection, name: &str) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, type, description, embedding, created_at, metadata,
                last_accessed_at, access_count
         FROM nodes
         WHERE lower(trim(name)) = lower(trim(?))
         ORDER BY id",
    )?;

    let nodes: Vec<Node> = stmt
        .query_map([name], node_from_row)?
        .collect::<rusqlite::Result<_>>()?;

    Ok(nodes)
}

/// Single-result name lookup
///
/// Fails with AmbiguousNode when more than one node matches and
/// NodeNotFound when none do.
pub fn get_node_by_name(conn: &Connection, name: &str) -> Result<Node> {
    let mut nodes = find_nodes_by_name(conn, name)?;
    match nodes.len() {
        0 => Err(NoemaError::NodeNotFound(name.to_string())),
        1 => Ok(nodes.remove(0)),
        count => Err(NoemaError::AmbiguousNode {
            name: name.to_string(),
            count,
        }),
    }
}

/// Insert or replace an edge by deterministic id
///
/// Fails with EdgeEndpointMissing unless both endpoints exist in the same
/// transaction.
pub fn upsert_edge(conn: &Connection, edge: &Edge) -> Result<()> {
    for endpoint in [&edge.source_id, &edge.target_id] {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM nodes WHERE id = ?",
            [endpoint],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(NoemaError::EdgeEndpointMissing(format!(
                "edge {} ({} -[{}]-> {}): node {} does not exist",
                edge.id, edge.source_id, edge.relation, edge.target_id, endpoint
            )));
        }
    }

    conn.execute(
        "INSERT INTO edges (id, source_id, relation, target_id, weight, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET weight = excluded.weight",
        params![
            edge.id,
            edge.source_id,
            edge.relation,
            edge.target_id,
            edge.weight,
            edge.created_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// All edges touching a node, in either direction
pub fn incident_edges(conn: &Connection, node_id: &str) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_id, relation, target_id, weight, created_at
         FROM edges
         WHERE source_id = ?1 OR target_id = ?1
         ORDER BY id",
    )?;

    let edges: Vec<Edge> = stmt
        .query_map([node_id], edge_from_row)?
        .collect::<rusqlite::Result<_>>()?;

    Ok(edges)
}

/// Direction-agnostic BFS from a node, deduplicated to the shortest depth
///
/// The start node itself is not returned. Depth 1 yields the immediate
/// neighborhood.
pub fn neighbors(conn: &Connection, node_id: &str, depth: usize) -> Result<Vec<(NodeId, usize)>> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut discovered: HashMap<NodeId, usize> = HashMap::new();
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();

    visited.insert(node_id.to_string());
    queue.push_back((node_id.to_string(), 0));

    let mut stmt = conn.prepare_cached(
        "SELECT source_id, target_id FROM edges WHERE source_id = ?1 OR target_id = ?1",
    )?;

    while let Some((current, dist)) = queue.pop_front() {
        if dist >= depth {
            continue;
        }

        let pairs: Vec<(String, String)> = stmt
            .query_map([&current], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        for (source, target) in pairs {
            let next = if source == current { target } else { source };
            if visited.insert(next.clone()) {
                discovered.insert(next.clone(), dist + 1);
                queue.push_back((next, dist + 1));
            }
        }
    }

    let mut result: Vec<(NodeId, usize)> = discovered.into_iter().collect();
    result.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(result)
}

/// Delete an edge and its provenance rows
pub fn delete_edge(conn: &Connection, edge_id: &str) -> Result<()> {
    conn.execute("DELETE FROM memory_edges WHERE edge_id = ?", [edge_id])?;
    conn.execute("DELETE FROM edges WHERE id = ?", [edge_id])?;
    Ok(())
}

/// Delete a node, cascading its incident edges and provenance rows
pub fn delete_node(conn: &Connection, node_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM memory_edges WHERE edge_id IN
            (SELECT id FROM edges WHERE source_id = ?1 OR target_id = ?1)",
        [node_id],
    )?;
    conn.execute(
        "DELETE FROM edges WHERE source_id = ?1 OR target_id = ?1",
        [node_id],
    )?;
    conn.execute("DELETE FROM memory_nodes WHERE node_id = ?", [node_id])?;
    conn.execute("DELETE FROM nodes WHERE id = ?", [node_id])?;
    Ok(())
}

/// Batched access-time refresh for the nodes a search returned
pub fn update_access_time(conn: &Connection, node_ids: &[NodeId]) -> Result<()> {
    if node_ids.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<&str> = node_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "UPDATE nodes SET last_accessed_at = ?, access_count = access_count + 1
         WHERE id IN ({})",
        placeholders.join(", ")
    );

    let now = Utc::now().to_rfc3339();
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
    for id in node_ids {
        params.push(id);
    }

    conn.execute(&sql, params.as_slice())?;
    Ok(())
}

/// Total node count
pub fn node_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?)
}

/// Total edge count
pub fn edge_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?)
}

/// All node ids, for prune scans
pub fn all_node_ids(conn: &Connection) -> Result<Vec<NodeId>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM nodes ORDER BY id")?;
    let ids: Vec<NodeId> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ids)
}
