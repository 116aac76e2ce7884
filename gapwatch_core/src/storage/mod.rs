//! SQLite storage for collections, gaps, annotations and tolerances.
//!
//! The store is the single source of truth for gap state. Nothing is cached
//! in process; every operation opens a pooled connection and every write
//! runs in its own transaction.
//!
//! Gap rows are never updated in place. [`GapStore::update_gaps`] reads the
//! candidate rows, asks a planner for a [`GapReplacement`], deletes and
//! inserts rows, and bumps the collection revision with a compare-and-set.
//! A stale snapshot surfaces as [`GapError::ConcurrencyConflict`] and is
//! retried by the caller.

mod reasons;
mod schema;

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};
use crate::pool::ConnectionPool;
use crate::ranges::{from_micros, to_micros, RangeSet, TimeRange};
use crate::types::{Collection, CollectionId, GapRecord};

pub use schema::TABLES;

/// Result of a schema bootstrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// At least one table was missing and the schema was applied.
    Created,
    /// Every table already existed; nothing changed.
    AlreadyPresent,
}

/// Rows to delete and ranges to insert for one collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GapReplacement {
    /// Ids of gap rows to delete
    pub delete: Vec<i64>,
    /// Replacement ranges, disjoint and non-touching
    pub insert: Vec<TimeRange>,
}

impl GapReplacement {
    /// Returns true if applying this replacement changes nothing.
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.insert.is_empty()
    }
}

/// Handle to the relational store.
#[derive(Clone, Debug)]
pub struct GapStore {
    pool: ConnectionPool,
}

impl GapStore {
    /// Creates a store over `pool`.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Creates the schema if any table is missing.
    ///
    /// Safe to call repeatedly; a second call returns
    /// [`BootstrapOutcome::AlreadyPresent`] and changes nothing.
    pub async fn bootstrap(&self) -> Result<BootstrapOutcome> {
        if let Some(parent) = self.pool.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let outcome = self
            .pool
            .run(|conn| {
                let present: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('collections', 'gaps', 'reasons', 'tolerances')",
                    [],
                    |row| row.get(0),
                )?;
                if present as usize == TABLES.len() {
                    return Ok(BootstrapOutcome::AlreadyPresent);
                }
                conn.execute_batch(schema::SCHEMA_SQL)?;
                Ok(BootstrapOutcome::Created)
            })
            .await?;

        tracing::info!(outcome = ?outcome, db = %self.pool.db_path.display(), "schema bootstrap");
        Ok(outcome)
    }

    /// Registers a collection and seeds one gap spanning its extent.
    ///
    /// Returns `false` without changes if the collection already exists.
    pub async fn register(&self, collection: &Collection) -> Result<bool> {
        let collection = collection.clone();
        self.pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let key = collection.id.key();
                if collection_row(&tx, &key)?.is_some() {
                    return Ok(false);
                }
                insert_collection(&tx, &collection)?;
                insert_gap(&tx, &key, &collection.extent())?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    /// Replaces a collection's extent and resets it to a single full-span
    /// gap, registering it first if needed.
    pub async fn reseed(&self, collection: &Collection) -> Result<()> {
        let collection = collection.clone();
        self.pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let key = collection.id.key();
                if collection_row(&tx, &key)?.is_some() {
                    tx.execute(
                        "UPDATE collections SET extent_start = ?2, extent_end = ?3,
                         revision = revision + 1 WHERE collection_id = ?1",
                        params![
                            key,
                            to_micros(collection.extent_start),
                            collection.extent_end.map(to_micros)
                        ],
                    )?;
                    tx.execute("DELETE FROM gaps WHERE collection_id = ?1", params![key])?;
                } else {
                    insert_collection(&tx, &collection)?;
                }
                insert_gap(&tx, &key, &collection.extent())?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Looks up a registered collection.
    pub async fn load_collection(&self, id: &CollectionId) -> Result<Option<Collection>> {
        let key = id.key();
        self.pool
            .run(move |conn| match collection_row(conn, &key)? {
                Some(row) => Ok(Some(row.into_collection()?)),
                None => Ok(None),
            })
            .await
    }

    /// Like [`load_collection`](Self::load_collection) but fails with
    /// [`GapError::NotRegistered`] for unknown collections.
    pub async fn require_collection(&self, id: &CollectionId) -> Result<Collection> {
        self.load_collection(id)
            .await?
            .ok_or_else(|| GapError::NotRegistered(id.key()))
    }

    /// Lists every registered collection ordered by key.
    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.pool
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT collection_id, short_name, version, extent_start, extent_end, revision
                     FROM collections ORDER BY collection_id",
                )?;
                let rows = stmt
                    .query_map([], CollectionRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(CollectionRow::into_collection).collect()
            })
            .await
    }

    /// Returns the gap rows overlapping `range`, ordered by start.
    pub async fn gaps_in_range(
        &self,
        id: &CollectionId,
        range: &TimeRange,
    ) -> Result<Vec<GapRecord>> {
        let key = id.key();
        let (start, end) = (to_micros(range.start), to_micros(range.end));
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT gap_id, start_ts, end_ts FROM gaps
                     WHERE collection_id = ?1 AND start_ts < ?3 AND end_ts > ?2
                     ORDER BY start_ts",
                )?;
                let rows = stmt
                    .query_map(params![key, start, end], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(gap_record).collect()
            })
            .await
    }

    /// Returns every gap row of a collection, ordered by start.
    pub async fn all_gaps(&self, id: &CollectionId) -> Result<Vec<GapRecord>> {
        let key = id.key();
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT gap_id, start_ts, end_ts FROM gaps
                     WHERE collection_id = ?1 ORDER BY start_ts",
                )?;
                let rows = stmt
                    .query_map(params![key], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(gap_record).collect()
            })
            .await
    }

    /// Recomputes gaps touching `covering` in one transaction.
    ///
    /// `plan` receives the collection and every stored gap that overlaps or
    /// is adjacent to a member of `covering`. Returning `None` or an empty
    /// replacement leaves the store untouched.
    ///
    /// # Errors
    ///
    /// - [`GapError::NotRegistered`] if the collection does not exist
    /// - [`GapError::ConcurrencyConflict`] if another writer committed first
    pub async fn update_gaps<F>(
        &self,
        id: &CollectionId,
        covering: RangeSet,
        plan: F,
    ) -> Result<Option<GapReplacement>>
    where
        F: FnOnce(&Collection, &[GapRecord]) -> Result<Option<GapReplacement>> + Send + 'static,
    {
        let key = id.key();
        self.pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
                let row = collection_row(&tx, &key)?
                    .ok_or_else(|| GapError::NotRegistered(key.clone()))?;
                let revision = row.revision;
                let collection = row.into_collection()?;
                let candidates = touching_gaps(&tx, &key, &covering)?;

                let replacement = match plan(&collection, &candidates)? {
                    Some(replacement) if !replacement.is_empty() => replacement,
                    _ => return Ok(None),
                };

                {
                    let mut delete = tx.prepare_cached(
                        "DELETE FROM gaps WHERE gap_id = ?1 AND collection_id = ?2",
                    )?;
                    for gap_id in &replacement.delete {
                        if delete.execute(params![gap_id, key])? != 1 {
                            return Err(GapError::ConcurrencyConflict(key.clone()));
                        }
                    }
                    for range in &replacement.insert {
                        insert_gap(&tx, &key, range)?;
                    }
                }

                let bumped = tx.execute(
                    "UPDATE collections SET revision = revision + 1
                     WHERE collection_id = ?1 AND revision = ?2",
                    params![key, revision],
                )?;
                if bumped != 1 {
                    return Err(GapError::ConcurrencyConflict(key.clone()));
                }
                tx.commit()?;
                Ok(Some(replacement))
            })
            .await
    }

    /// Returns the configured tolerance for a collection in seconds.
    pub async fn get_tolerance(&self, id: &CollectionId) -> Result<Option<u64>> {
        let id = id.clone();
        self.pool
            .run(move |conn| {
                let secs: Option<i64> = conn
                    .query_row(
                        "SELECT tolerance_secs FROM tolerances WHERE short_name = ?1 AND version = ?2",
                        params![id.short_name, id.version],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(secs.map(|s| s.max(0) as u64))
            })
            .await
    }

    /// Upserts the tolerance for a collection.
    pub async fn put_tolerance(&self, id: &CollectionId, secs: u64) -> Result<()> {
        let id = id.clone();
        let secs = i64::try_from(secs)
            .map_err(|_| GapError::validation(format!("tolerance too large: {}", secs)))?;
        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO tolerances (short_name, version, tolerance_secs)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (short_name, version)
                     DO UPDATE SET tolerance_secs = excluded.tolerance_secs,
                                   updated_at = strftime('%s', 'now')",
                    params![id.short_name, id.version, secs],
                )?;
                Ok(())
            })
            .await
    }
}

/// Raw `collections` row.
struct CollectionRow {
    short_name: String,
    version: String,
    extent_start: i64,
    extent_end: Option<i64>,
    revision: i64,
}

impl CollectionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            short_name: row.get(1)?,
            version: row.get(2)?,
            extent_start: row.get(3)?,
            extent_end: row.get(4)?,
            revision: row.get(5)?,
        })
    }

    fn into_collection(self) -> Result<Collection> {
        Ok(Collection {
            id: CollectionId::new(self.short_name, self.version)?,
            extent_start: from_micros(self.extent_start)?,
            extent_end: self.extent_end.map(from_micros).transpose()?,
        })
    }
}

fn collection_row(conn: &Connection, key: &str) -> Result<Option<CollectionRow>> {
    Ok(conn
        .query_row(
            "SELECT collection_id, short_name, version, extent_start, extent_end, revision
             FROM collections WHERE collection_id = ?1",
            params![key],
            CollectionRow::from_row,
        )
        .optional()?)
}

fn insert_collection(tx: &Transaction<'_>, collection: &Collection) -> Result<()> {
    tx.execute(
        "INSERT INTO collections (collection_id, short_name, version, extent_start, extent_end)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            collection.id.key(),
            collection.id.short_name,
            collection.id.version,
            to_micros(collection.extent_start),
            collection.extent_end.map(to_micros)
        ],
    )?;
    Ok(())
}

fn insert_gap(tx: &Transaction<'_>, key: &str, range: &TimeRange) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO gaps (collection_id, start_ts, end_ts) VALUES (?1, ?2, ?3)",
    )?;
    stmt.execute(params![key, to_micros(range.start), to_micros(range.end)])?;
    Ok(())
}

/// Gaps overlapping or adjacent to any member of `covering`, deduplicated
/// and ordered by start.
fn touching_gaps(tx: &Transaction<'_>, key: &str, covering: &RangeSet) -> Result<Vec<GapRecord>> {
    let mut stmt = tx.prepare_cached(
        "SELECT gap_id, start_ts, end_ts FROM gaps
         WHERE collection_id = ?1 AND start_ts <= ?3 AND end_ts >= ?2",
    )?;

    let mut found: BTreeMap<i64, (i64, i64, i64)> = BTreeMap::new();
    for range in covering.ranges() {
        let rows = stmt.query_map(
            params![key, to_micros(range.start), to_micros(range.end)],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;
        for row in rows {
            let row = row?;
            found.insert(row.0, row);
        }
    }

    let mut gaps = found
        .into_values()
        .map(gap_record)
        .collect::<Result<Vec<_>>>()?;
    gaps.sort_by_key(|g| g.range.start);
    Ok(gaps)
}

fn gap_record((gap_id, start, end): (i64, i64, i64)) -> Result<GapRecord> {
    Ok(GapRecord {
        gap_id,
        range: TimeRange {
            start: from_micros(start)?,
            end: from_micros(end)?,
        },
    })
}
