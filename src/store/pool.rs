//! Lazily bootstrapped SQLite connection pool.
//!
//! The pool is an explicitly constructed handle. The backing file is opened on
//! the first `acquire`; when it did not exist yet, every registered table is
//! created before the first connection is handed out.
//!
//! Exhaustion policy: `acquire` blocks until a connection is returned or
//! `acquire_timeout_ms` elapses, then fails with [`FleetError::PoolTimeout`].

use std::{path::Path, sync::Arc, time::Duration};

use sqlx::{
    Row, Sqlite, SqliteConnection, SqlitePool,
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    FleetError, Result, StoreConfig,
    store::schema::{Entity, SchemaMapper, TableSpec},
};

pub struct ConnectionPool {
    config: StoreConfig,
    mapper: Arc<SchemaMapper>,
    tables: Vec<Arc<TableSpec>>,
    pool: OnceCell<SqlitePool>,
}

impl ConnectionPool {
    pub fn new(
        config: StoreConfig,
        mapper: Arc<SchemaMapper>,
    ) -> Self {
        Self {
            config,
            mapper,
            tables: Vec::new(),
            pool: OnceCell::new(),
        }
    }

    /// Registers an entity table to create on bootstrap.
    ///
    /// Derives the table right away so a bad schema fails at startup.
    pub fn register<T: Entity>(mut self) -> Result<Self> {
        let table = self.mapper.derive_table::<T>()?;
        self.tables.push(table);
        Ok(self)
    }

    pub fn mapper(&self) -> &Arc<SchemaMapper> {
        &self.mapper
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Hands out a pooled connection, bootstrapping the store on first use.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        let pool = self.pool.get_or_try_init(|| self.bootstrap()).await?;
        pool.acquire().await.map_err(|err| match err {
            sqlx::Error::PoolTimedOut => FleetError::PoolTimeout(format!(
                "no store connection available within {}ms ({} in use)",
                self.config.acquire_timeout_ms,
                pool.size()
            )),
            err => err.into(),
        })
    }

    /// Returns a connection to the pool. `None` is accepted and ignored.
    pub fn release(
        &self,
        conn: Option<PoolConnection<Sqlite>>,
    ) {
        if let Some(conn) = conn {
            drop(conn);
        }
    }

    /// Closes every pooled connection. A later `acquire` fails.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    async fn bootstrap(&self) -> Result<SqlitePool> {
        let path = Path::new(&self.config.path);
        let fresh = !path.exists();
        if fresh {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true).busy_timeout(timeout);
        let pool = SqlitePoolOptions::new().max_connections(self.config.max_connections).acquire_timeout(timeout).connect_with(options).await?;

        if fresh {
            info!("store::bootstrap({}) creating {} tables", self.config.path, self.tables.len());
            let mut conn = pool.acquire().await?;
            for table in self.tables.iter() {
                bootstrap_table(&mut conn, &self.mapper, table).await?;
            }
        }
        Ok(pool)
    }
}

/// Creates `table` and its natural-key index unless the table exists.
///
/// Returns whether the table was created.
pub(crate) async fn bootstrap_table(
    conn: &mut SqliteConnection,
    mapper: &SchemaMapper,
    table: &TableSpec,
) -> Result<bool> {
    let (sql, values) = mapper.table_exists_statement(table);
    let count = sqlx::query_with(&sql, values).fetch_one(&mut *conn).await?.try_get::<i64, _>(0)?;
    if count > 0 {
        return Ok(false);
    }

    debug!("store::create_table({})", table.table_name);
    sqlx::query(&mapper.create_table_statement(table)).execute(&mut *conn).await?;
    if let Some(index) = mapper.create_index_statement(table) {
        sqlx::query(&index).execute(&mut *conn).await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::data::NodeRecord;

    fn config(
        dir: &tempfile::TempDir,
        max_connections: u32,
    ) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("state").join("checkpoint.db").to_string_lossy().to_string(),
            max_connections,
            acquire_timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_lazy_bootstrap_creates_file_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, 4);
        let path = config.path.clone();
        let mapper = Arc::new(SchemaMapper::new());
        let pool = ConnectionPool::new(config, mapper.clone()).register::<NodeRecord>().unwrap();
        assert!(!Path::new(&path).exists());

        let mut conn = pool.acquire().await.unwrap();
        assert!(Path::new(&path).exists());

        let table = mapper.derive_table::<NodeRecord>().unwrap();
        assert!(!bootstrap_table(&mut conn, &mapper, &table).await.unwrap());
        pool.release(Some(conn));
        pool.release(None);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(config(&dir, 1), Arc::new(SchemaMapper::new()));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, FleetError::PoolTimeout(_)));

        pool.release(Some(held));
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_pool_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, 1);
        config.acquire_timeout_ms = 5000;
        let pool = Arc::new(ConnectionPool::new(config, Arc::new(SchemaMapper::new())));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(Some(held));
        assert!(waiter.await.unwrap().is_ok());
    }
}
