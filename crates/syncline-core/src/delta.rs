//! Incremental pulls of remote changes.
//!
//! A pull fetches the records of one `(collection, scope)` changed since its
//! checkpoint, merges them last-write-wins and advances the checkpoint, all
//! in one local transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::duration_ms;
use crate::config::{CheckpointStrategy, DeltaConfig};
use crate::db::{
    EntityRepository, MetadataRepository, SqliteEntityRepository, SqliteMetadataRepository,
    WriteOutcome,
};
use crate::error::{Error, Result};
use crate::governor::{Priority, RequestGovernor};
use crate::models::{Collection, Entity};
use crate::remote::{RemoteRecord, RemoteService};
use crate::store::LocalStore;

/// Result of one successful pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub collection: Collection,
    pub scope: Option<String>,
    /// Records returned by the remote
    pub fetched: usize,
    /// Records that changed local state
    pub applied: usize,
    /// Records older than the local copy
    pub superseded: usize,
    /// Applied tombstones
    pub deleted: usize,
    /// New `last_synced_at`
    pub checkpoint: i64,
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    failures: u32,
    retry_at: i64,
}

type TargetKey = (Collection, Option<String>);

#[derive(Clone)]
pub struct DeltaPuller {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    governor: RequestGovernor,
    config: DeltaConfig,
    windows: Arc<Mutex<HashMap<TargetKey, FailureWindow>>>,
}

impl DeltaPuller {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        governor: RequestGovernor,
        config: DeltaConfig,
    ) -> Self {
        Self {
            store,
            remote,
            governor,
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub const fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Whether scheduled pulls of this target are currently backing off.
    pub fn in_backoff(&self, collection: Collection, scope: Option<&str>) -> Result<bool> {
        let now = self.store.clock().now_ms();
        let windows = self
            .windows
            .lock()
            .map_err(|_| Error::lock_poisoned("delta backoff"))?;
        Ok(windows
            .get(&(collection, scope.map(str::to_string)))
            .is_some_and(|window| window.retry_at > now))
    }

    /// Pull and merge the changes of `(collection, scope)`.
    ///
    /// Returns `Ok(None)` when the target is inside its failure backoff and
    /// `force` is not set. A failed fetch leaves the checkpoint untouched.
    pub async fn pull(
        &self,
        collection: Collection,
        scope: Option<&str>,
        force: bool,
    ) -> Result<Option<PullReport>> {
        if !force && self.in_backoff(collection, scope)? {
            tracing::debug!(collection = %collection, scope, "Skipping pull during backoff");
            return Ok(None);
        }

        let last_synced_at = self
            .store
            .metadata(collection, scope)?
            .and_then(|metadata| metadata.last_synced_at);
        let request_start = self.store.clock().now_ms();
        let since = last_synced_at.unwrap_or_else(|| {
            request_start.saturating_sub(duration_ms(self.config.lookback()))
        });

        let key = format!("pull:{collection}:{}", scope.unwrap_or_default());
        let remote = Arc::clone(&self.remote);
        let fetch_scope = scope.map(str::to_string);
        let fetched = self
            .governor
            .execute(&key, Priority::Background, || async move {
                remote
                    .fetch(collection, since, fetch_scope.as_deref())
                    .await
            })
            .await;

        let records = match fetched {
            Ok(records) => records,
            Err(error) => {
                self.record_failure(collection, scope)?;
                tracing::warn!(collection = %collection, scope, "Delta pull failed: {error}");
                return Err(error.into());
            }
        };

        let report = self.merge(collection, scope, records, request_start)?;
        self.clear_failures(collection, scope)?;
        tracing::debug!(
            collection = %collection,
            scope,
            fetched = report.fetched,
            applied = report.applied,
            superseded = report.superseded,
            "Delta pull complete"
        );
        Ok(Some(report))
    }

    fn merge(
        &self,
        collection: Collection,
        scope: Option<&str>,
        records: Vec<RemoteRecord>,
        request_start: i64,
    ) -> Result<PullReport> {
        let now = self.store.clock().now_ms();
        let fetched = records.len();
        let max_record = records.iter().map(|record| record.updated_at).max();
        let checkpoint = match self.config.checkpoint {
            CheckpointStrategy::RequestStart => request_start,
            CheckpointStrategy::MaxRecord => max_record.unwrap_or(request_start),
        };

        let (written, superseded) = self.store.transaction(|tx| {
            let entities = SqliteEntityRepository::new(tx);
            let mut written: Vec<(Entity, WriteOutcome)> = Vec::new();
            let mut superseded = 0;

            for record in records {
                let entity = record.into_entity(collection);
                let outcome = entities.upsert(&entity, now)?;
                tracing::trace!(collection = %collection, id = %entity.id, ?outcome, "Merged pulled record");
                match outcome {
                    WriteOutcome::Superseded { .. } => superseded += 1,
                    outcome if outcome.is_applied() => written.push((entity, outcome)),
                    _ => {}
                }
            }

            // Outbox confirms may have bumped local_version during the fetch
            SqliteMetadataRepository::new(tx).record_pull(
                collection,
                scope,
                checkpoint,
                superseded > 0,
            )?;
            Ok((written, superseded))
        })?;

        let deleted = written
            .iter()
            .filter(|(entity, _)| entity.is_deleted)
            .count();
        let applied = written.len();
        for (entity, outcome) in &written {
            self.store.publish_write(entity, *outcome);
        }

        Ok(PullReport {
            collection,
            scope: scope.map(str::to_string),
            fetched,
            applied,
            superseded,
            deleted,
            checkpoint,
        })
    }

    fn record_failure(&self, collection: Collection, scope: Option<&str>) -> Result<()> {
        let now = self.store.clock().now_ms();
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| Error::lock_poisoned("delta backoff"))?;
        let window = windows
            .entry((collection, scope.map(str::to_string)))
            .or_insert(FailureWindow {
                failures: 0,
                retry_at: now,
            });
        let delay = self.config.backoff().delay_for(window.failures);
        window.failures = window.failures.saturating_add(1);
        window.retry_at = now.saturating_add(duration_ms(delay));
        Ok(())
    }

    fn clear_failures(&self, collection: Collection, scope: Option<&str>) -> Result<()> {
        self.windows
            .lock()
            .map_err(|_| Error::lock_poisoned("delta backoff"))?
            .remove(&(collection, scope.map(str::to_string)));
        Ok(())
    }
}
