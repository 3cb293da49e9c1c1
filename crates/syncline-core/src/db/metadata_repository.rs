//! Sync checkpoint repository implementation

use crate::error::Result;
use crate::models::{Collection, SyncMetadata};
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for sync checkpoint storage operations
pub trait MetadataRepository {
    /// Load the checkpoint for `(collection, scope)`
    fn get(&self, collection: Collection, scope: Option<&str>) -> Result<Option<SyncMetadata>>;

    /// Insert or replace a checkpoint
    fn save(&self, metadata: &SyncMetadata) -> Result<()>;

    /// Advance the checkpoint after a successful pull, counting the pass in
    /// `remote_version`. Other columns are left as stored.
    fn record_pull(
        &self,
        collection: Collection,
        scope: Option<&str>,
        last_synced_at: i64,
        has_conflict: bool,
    ) -> Result<SyncMetadata>;

    /// Increment `local_version` after the remote confirmed a local mutation
    fn bump_local_version(&self, collection: Collection) -> Result<()>;

    /// All checkpoints, ordered by collection and scope
    fn list(&self) -> Result<Vec<SyncMetadata>>;
}

type MetadataRow = (String, String, Option<i64>, i64, i64, bool);

/// `SQLite` implementation of `MetadataRepository`
pub struct SqliteMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get::<_, i32>(5)? != 0,
        ))
    }

    fn into_metadata(
        (collection, scope, last_synced_at, local_version, remote_version, has_conflict): MetadataRow,
    ) -> Result<SyncMetadata> {
        Ok(SyncMetadata {
            collection: collection.parse()?,
            scope: (!scope.is_empty()).then_some(scope),
            last_synced_at,
            local_version,
            remote_version,
            has_conflict,
        })
    }
}

const SELECT_METADATA: &str = "SELECT collection, scope, last_synced_at, local_version, remote_version, has_conflict FROM sync_metadata";

impl MetadataRepository for SqliteMetadataRepository<'_> {
    fn get(&self, collection: Collection, scope: Option<&str>) -> Result<Option<SyncMetadata>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_METADATA} WHERE collection = ? AND scope = ?"),
                params![collection.as_str(), scope.unwrap_or_default()],
                Self::parse_row,
            )
            .optional()?;

        row.map(Self::into_metadata).transpose()
    }

    fn save(&self, metadata: &SyncMetadata) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_metadata (
                collection, scope, last_synced_at, local_version, remote_version, has_conflict
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(collection, scope) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                has_conflict = excluded.has_conflict",
            params![
                metadata.collection.as_str(),
                metadata.scope.as_deref().unwrap_or_default(),
                metadata.last_synced_at,
                metadata.local_version,
                metadata.remote_version,
                i32::from(metadata.has_conflict)
            ],
        )?;
        Ok(())
    }

    fn record_pull(
        &self,
        collection: Collection,
        scope: Option<&str>,
        last_synced_at: i64,
        has_conflict: bool,
    ) -> Result<SyncMetadata> {
        let row = self.conn.query_row(
            "INSERT INTO sync_metadata (
                collection, scope, last_synced_at, remote_version, has_conflict
             ) VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(collection, scope) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                remote_version = remote_version + 1,
                has_conflict = excluded.has_conflict
             RETURNING collection, scope, last_synced_at, local_version, remote_version, has_conflict",
            params![
                collection.as_str(),
                scope.unwrap_or_default(),
                last_synced_at,
                i32::from(has_conflict)
            ],
            Self::parse_row,
        )?;
        Self::into_metadata(row)
    }

    fn bump_local_version(&self, collection: Collection) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_metadata (collection, scope, local_version) VALUES (?, '', 1)
             ON CONFLICT(collection, scope) DO UPDATE SET local_version = local_version + 1",
            params![collection.as_str()],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<SyncMetadata>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_METADATA} ORDER BY collection, scope"))?;
        let rows = stmt
            .query_map([], Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Self::into_metadata).collect()
    }
}
