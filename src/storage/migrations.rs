//! Database migrations for Noema

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Check whether a column exists on a table
fn has_column(conn: &Connection, table: &str, column: &str) -> bool {
    conn.query_row(
        &format!(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('{}') WHERE name = ?",
            table
        ),
        [column],
        |row| row.get(0),
    )
    .unwrap_or(false)
}

/// Initial schema (v1): graph, memories, provenance, supersession, ingest cache
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Knowledge graph nodes; id is deterministic over (name, type)
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            embedding BLOB,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            metadata TEXT,
            tracked INTEGER NOT NULL DEFAULT 0
        );

        -- Directed labeled relations; id is deterministic over the triple
        CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            target_id TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tracked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (source_id) REFERENCES nodes(id),
            FOREIGN KEY (target_id) REFERENCES nodes(id)
        );

        -- First-class memory records
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            context TEXT NOT NULL,
            decisions_json TEXT NOT NULL DEFAULT '[]',
            rationale_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            version INTEGER NOT NULL DEFAULT 1,
            doc_hash TEXT NOT NULL,
            source TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
        );

        -- Provenance: which memories claim which nodes
        CREATE TABLE IF NOT EXISTS memory_nodes (
            memory_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (memory_id, node_id),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
            FOREIGN KEY (node_id) REFERENCES nodes(id)
        );

        -- Provenance: which memories claim which edges
        CREATE TABLE IF NOT EXISTS memory_edges (
            memory_id TEXT NOT NULL,
            edge_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (memory_id, edge_id),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
            FOREIGN KEY (edge_id) REFERENCES edges(id)
        );

        -- Supersession links between memories (DAG)
        CREATE TABLE IF NOT EXISTS memory_supersession (
            superseding_id TEXT NOT NULL,
            superseded_id TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (superseding_id, superseded_id)
        );

        -- Incremental ingest deduplication cache
        CREATE TABLE IF NOT EXISTS processed_documents (
            hash TEXT PRIMARY KEY,
            source TEXT,
            processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            chunk_count INTEGER NOT NULL DEFAULT 0
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_nodes_name ON nodes(name COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
        CREATE INDEX IF NOT EXISTS idx_memories_doc_hash ON memories(doc_hash);
        CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
        CREATE INDEX IF NOT EXISTS idx_memories_updated ON memories(updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memory_nodes_node ON memory_nodes(node_id);
        CREATE INDEX IF NOT EXISTS idx_memory_edges_edge ON memory_edges(edge_id);
        CREATE INDEX IF NOT EXISTS idx_supersession_superseded
            ON memory_supersession(superseded_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    tracing::info!("Migration v1 complete: base schema created");

    Ok(())
}

/// Migration v2: access tracking columns on nodes and memories
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !has_column(conn, "nodes", "last_accessed_at") {
        conn.execute("ALTER TABLE nodes ADD COLUMN last_accessed_at TEXT", [])?;
    }
    if !has_column(conn, "nodes", "access_count") {
        conn.execute(
            "ALTER TABLE nodes ADD COLUMN access_count INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !has_column(conn, "memories", "last_accessed_at") {
        conn.execute("ALTER TABLE memories ADD COLUMN last_accessed_at TEXT", [])?;
    }
    if !has_column(conn, "memories", "access_count") {
        conn.execute(
            "ALTER TABLE memories ADD COLUMN access_count INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;

    tracing::info!("Migration v2 complete: access tracking columns ensured");

    Ok(())
}

/// Migration v3: retention, pinning and access velocity
fn migrate_v3(conn: &Connection) -> Result<()> {
    if !has_column(conn, "memories", "retention_policy") {
        conn.execute(
            "ALTER TABLE memories ADD COLUMN retention_policy TEXT NOT NULL DEFAULT 'standard'",
            [],
        )?;
    }
    if !has_column(conn, "memories", "pinned") {
        conn.execute(
            "ALTER TABLE memories ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !has_column(conn, "memories", "pinned_at") {
        conn.execute("ALTER TABLE memories ADD COLUMN pinned_at TEXT", [])?;
    }
    if !has_column(conn, "memories", "pinned_reason") {
        conn.execute("ALTER TABLE memories ADD COLUMN pinned_reason TEXT", [])?;
    }
    if !has_column(conn, "memories", "access_velocity") {
        conn.execute(
            "ALTER TABLE memories ADD COLUMN access_velocity REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memories_retention ON memories(retention_policy)",
        [],
    )?;
    conn.execute("INSERT INTO schema_version (version) VALUES (3)", [])?;

    tracing::info!("Migration v3 complete: retention and pinning columns ensured");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_all_columns_present() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for col in [
            "retention_policy",
            "pinned",
            "pinned_at",
            "pinned_reason",
            "access_velocity",
            "last_accessed_at",
            "access_count",
        ] {
            assert!(has_column(&conn, "memories", col), "missing column {}", col);
        }
        assert!(has_column(&conn, "nodes", "last_accessed_at"));
        assert!(has_column(&conn, "nodes", "access_count"));
        assert!(has_column(&conn, "nodes", "tracked"));
        assert!(has_column(&conn, "edges", "tracked"));
    }

    #[test]
    fn test_column_adds_survive_partial_schema() {
        // A v1-era database upgraded in place gets the later columns
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )
        .unwrap();
        migrate_v1(&conn).unwrap();

        run_migrations(&conn).unwrap();
        assert!(has_column(&conn, "memories", "retention_policy"));
        assert!(has_column(&conn, "memories", "access_velocity"));
    }
}
