//! Relational schema.
//!
//! All timestamps are integer microseconds since the Unix epoch.

/// Tables created by bootstrap.
pub const TABLES: [&str; 4] = ["collections", "gaps", "reasons", "tolerances"];

pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS collections (
    collection_id TEXT PRIMARY KEY,
    short_name TEXT NOT NULL,
    version TEXT NOT NULL,
    extent_start INTEGER NOT NULL,
    extent_end INTEGER,
    revision INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    CHECK (extent_end IS NULL OR extent_start < extent_end)
);

CREATE TABLE IF NOT EXISTS gaps (
    gap_id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id TEXT NOT NULL REFERENCES collections(collection_id) ON DELETE CASCADE,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    CHECK (start_ts < end_ts)
);

CREATE INDEX IF NOT EXISTS idx_gaps_collection_range ON gaps(collection_id, start_ts, end_ts);

CREATE TABLE IF NOT EXISTS reasons (
    reason_id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id TEXT NOT NULL REFERENCES collections(collection_id) ON DELETE CASCADE,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    CHECK (end_ts - start_ts >= 1000000),
    CHECK (length(reason) BETWEEN 1 AND 255)
);

CREATE INDEX IF NOT EXISTS idx_reasons_collection_range ON reasons(collection_id, start_ts, end_ts);

CREATE TABLE IF NOT EXISTS tolerances (
    short_name TEXT NOT NULL,
    version TEXT NOT NULL,
    tolerance_secs INTEGER NOT NULL CHECK (tolerance_secs >= 0),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (short_name, version)
);
";
