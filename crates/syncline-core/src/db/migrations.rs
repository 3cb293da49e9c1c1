//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, V1)?;
    }
    if version < 2 {
        apply(conn, 2, V2)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run one migration script inside its own transaction and record it.
fn apply(conn: &mut Connection, version: i32, script: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(script)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: entity records, sync checkpoints and the outbox
const V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS entities (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        payload TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (collection, id)
    );
    CREATE INDEX IF NOT EXISTS idx_entities_updated ON entities(collection, updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_entities_deleted ON entities(is_deleted, updated_at);

    -- scope is '' when the collection is not partitioned
    CREATE TABLE IF NOT EXISTS sync_metadata (
        collection TEXT NOT NULL,
        scope TEXT NOT NULL DEFAULT '',
        last_synced_at INTEGER,
        local_version INTEGER NOT NULL DEFAULT 0,
        remote_version INTEGER NOT NULL DEFAULT 0,
        has_conflict INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (collection, scope)
    );

    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        collection TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        payload TEXT,
        updated_at INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        next_attempt_at INTEGER NOT NULL,
        interactive INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, collection, seq);
    CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(collection, entity_id, seq);
";

/// Version 2: LWW conflict logging support
const V2: &str = "
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        local_updated_at INTEGER NOT NULL,
        incoming_updated_at INTEGER NOT NULL,
        resolved_at INTEGER NOT NULL,
        strategy TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(collection, entity_id);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);
";
