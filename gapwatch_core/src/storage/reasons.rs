//! Known-gap reason rows.

use rusqlite::params;

use super::{collection_row, GapStore};
use crate::error::{GapError, Result};
use crate::ranges::{from_micros, to_micros, TimeRange};
use crate::types::{CollectionId, Reason};

type ReasonRow = (i64, String, i64, i64, String);

fn reason_from_row((reason_id, collection_id, start, end, reason): ReasonRow) -> Result<Reason> {
    Ok(Reason {
        reason_id,
        collection_id,
        start_ts: from_micros(start)?,
        end_ts: from_micros(end)?,
        reason,
    })
}

impl GapStore {
    /// Inserts a reason for `range`.
    pub async fn insert_reason(
        &self,
        id: &CollectionId,
        range: &TimeRange,
        reason: &str,
    ) -> Result<Reason> {
        let key = id.key();
        let range = *range;
        let reason = reason.to_string();
        self.pool
            .run(move |conn| {
                if collection_row(conn, &key)?.is_none() {
                    return Err(GapError::NotRegistered(key));
                }
                conn.execute(
                    "INSERT INTO reasons (collection_id, start_ts, end_ts, reason)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, to_micros(range.start), to_micros(range.end), reason],
                )?;
                Ok(Reason {
                    reason_id: conn.last_insert_rowid(),
                    collection_id: key,
                    start_ts: range.start,
                    end_ts: range.end,
                    reason,
                })
            })
            .await
    }

    /// Rewrites every reason lying entirely inside `range`.
    ///
    /// Returns the number of rows changed.
    pub async fn update_reasons_within(
        &self,
        id: &CollectionId,
        range: &TimeRange,
        reason: &str,
    ) -> Result<usize> {
        let key = id.key();
        let (start, end) = (to_micros(range.start), to_micros(range.end));
        let reason = reason.to_string();
        self.pool
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE reasons SET reason = ?4, updated_at = strftime('%s', 'now')
                     WHERE collection_id = ?1 AND start_ts >= ?2 AND end_ts <= ?3",
                    params![key, start, end, reason],
                )?)
            })
            .await
    }

    /// Deletes every reason lying entirely inside `range`.
    ///
    /// Returns the number of rows removed.
    pub async fn delete_reasons_within(&self, id: &CollectionId, range: &TimeRange) -> Result<usize> {
        let key = id.key();
        let (start, end) = (to_micros(range.start), to_micros(range.end));
        self.pool
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM reasons
                     WHERE collection_id = ?1 AND start_ts >= ?2 AND end_ts <= ?3",
                    params![key, start, end],
                )?)
            })
            .await
    }

    /// Returns every reason intersecting `range`, ordered by start.
    pub async fn reasons_intersecting(
        &self,
        id: &CollectionId,
        range: &TimeRange,
    ) -> Result<Vec<Reason>> {
        let key = id.key();
        let (start, end) = (to_micros(range.start), to_micros(range.end));
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT reason_id, collection_id, start_ts, end_ts, reason FROM reasons
                     WHERE collection_id = ?1 AND start_ts < ?3 AND end_ts > ?2
                     ORDER BY start_ts, reason_id",
                )?;
                let rows = stmt
                    .query_map(params![key, start, end], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<rusqlite::Result<Vec<ReasonRow>>>()?;
                rows.into_iter().map(reason_from_row).collect()
            })
            .await
    }
}
