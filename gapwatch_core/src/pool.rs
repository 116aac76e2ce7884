//! Connection pool for concurrent database access.
//!
//! This module provides a semaphore-based connection pool that bounds the
//! number of simultaneously open SQLite connections. Each permit opens its
//! own connection, so there is no connection reuse and no shared state
//! beyond the semaphore itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Semaphore;

use crate::error::{GapError, Result};

/// Connection pool for database connections.
///
/// The pool limits the number of concurrent connections
/// using a semaphore permit system.
///
/// # Examples
///
/// ```no_run
/// use gapwatch_core::pool::ConnectionPool;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let pool = ConnectionPool::new("/path/to/gapwatch.db", 16);
///
/// let count: i64 = pool
///     .run(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
///     .await?;
/// assert_eq!(count, 1);
/// #     Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Semaphore for limiting connections.
    semaphore: Arc<Semaphore>,
    /// Maximum number of connections.
    pub max_connections: usize,
    /// How long a connection waits on a locked database.
    busy_timeout: Duration,
}

impl ConnectionPool {
    /// Creates a new connection pool.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `max_connections` - Maximum number of concurrent connections
    pub fn new(db_path: impl AsRef<Path>, max_connections: usize) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the busy timeout applied to every opened connection.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Acquires a permit from the pool.
    ///
    /// This will wait until a connection is available.
    /// The permit is released when dropped.
    pub async fn acquire(&self) -> anyhow::Result<ConnectionPermit> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(ConnectionPermit {
            _permit: permit,
            db_path: self.db_path.clone(),
            busy_timeout: self.busy_timeout,
        })
    }

    /// Runs `f` against a freshly opened connection on the blocking pool.
    ///
    /// The permit is held until `f` returns, so at most `max_connections`
    /// closures run at once.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let permit = self
            .acquire()
            .await
            .map_err(|e| GapError::DownstreamUnavailable(format!("connection pool: {}", e)))?;

        tokio::task::spawn_blocking(move || {
            let mut conn = permit.open()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GapError::DownstreamUnavailable(format!("database task failed: {}", e)))?
    }
}

/// A permit representing an acquired connection.
///
/// When dropped, the connection slot is returned to the pool.
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPermit")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl ConnectionPermit {
    /// Opens a connection in WAL mode with foreign keys enabled.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}
