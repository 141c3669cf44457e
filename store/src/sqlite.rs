//! A thin wrapper over the SQLite connection pool for one data file.

use camino::{Utf8Path, Utf8PathBuf};
use common::{CoverageError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// One live connection to a coverage data file.
///
/// The pool is capped at a single connection: writes serialize through it,
/// `:memory:` databases survive across operations, and sharing the handle
/// between threads is safe because the pool hands the connection out one
/// checkout at a time.
pub(crate) struct SqliteDb {
    filename: Utf8PathBuf,
    pool: SqlitePool,
}

impl SqliteDb {
    /// Connect, applying the write-throughput pragmas. Rollback journaling
    /// and fsync are off: the data is cheap to regenerate and the caller
    /// never relies on rollback across process death.
    pub(crate) async fn open(filename: &Utf8Path, memory: bool) -> Result<Self> {
        log::debug!("Connecting to {filename:?}");
        let options = if memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(filename.as_std_path())
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Off)
        .synchronous(SqliteSynchronous::Off);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CoverageError::data_file(filename, &e))?;

        Ok(Self {
            filename: filename.to_owned(),
            pool,
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn close(self) {
        self.pool.close().await;
    }

    /// Run a multi-statement SQL script.
    pub(crate) async fn execute_script(&self, script: &str) -> Result<()> {
        log::debug!("Executing script with {} chars", script.len());
        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .map_err(|e| CoverageError::data_file(&self.filename, &e))?;
        Ok(())
    }
}
