//! Generic CRUD facade over the schema mapper and the connection pool.
//!
//! Every operation runs under one coarse async mutex, so at most one caller
//! reads or writes through a `CheckPointDb` at a time.

use std::sync::Arc;

use sqlx::{Connection, Row, SqliteConnection, sqlite::SqliteQueryResult};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::{
    Result,
    store::{
        pool::{ConnectionPool, bootstrap_table},
        schema::{Entity, OrderBy, Page, SchemaMapper, Statement, TableSpec},
    },
};

pub struct CheckPointDb {
    pool: Arc<ConnectionPool>,
    lock: Mutex<()>,
}

impl CheckPointDb {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn mapper(&self) -> &SchemaMapper {
        self.pool.mapper()
    }

    /// Inserts `record` and returns the id the store assigned to it.
    pub async fn insert<T: Entity>(
        &self,
        record: &T,
    ) -> Result<i64> {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        let id = execute(&mut conn, self.mapper().insert_statement(record)?).await?.last_insert_rowid();
        trace!("store::insert({}, {})", table.table_name, id);
        Ok(id)
    }

    /// Deletes rows matching the set key fields of `query`.
    pub async fn delete<T: Entity>(
        &self,
        query: &T,
    ) -> Result<u64> {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        let deleted = execute(&mut conn, self.mapper().delete_by_natural_key_statement(query)?).await?.rows_affected();
        trace!("store::delete({}, {})", table.table_name, deleted);
        Ok(deleted)
    }

    /// Rows whose columns equal every set field of `query`.
    pub async fn find<T: Entity>(
        &self,
        query: &T,
        order_by: &OrderBy,
        page: Page,
    ) -> Result<Vec<T>> {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        self.fetch(&mut conn, &table, self.mapper().select_statement(query, order_by, page)?).await
    }

    /// Ids of the rows [`Self::find`] would return.
    pub async fn find_ids<T: Entity>(
        &self,
        query: &T,
        order_by: &OrderBy,
        page: Page,
    ) -> Result<Vec<i64>> {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        let (sql, values) = self.mapper().select_ids_statement(query, order_by, page)?;
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(|row| row.try_get::<i64, _>(0)).collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn count<T: Entity>(
        &self,
        query: &T,
    ) -> Result<i64> {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        let (sql, values) = self.mapper().count_statement(query)?;
        Ok(sqlx::query_with(&sql, values).fetch_one(&mut *conn).await?.try_get::<i64, _>(0)?)
    }

    pub async fn is_empty<T: Entity>(&self) -> Result<bool> {
        Ok(self.count(&T::default()).await? == 0)
    }

    /// Update-or-insert by natural key.
    ///
    /// - no match: insert
    /// - one match with the same set fields: nothing, returns `false`
    /// - one match that differs: update that row by id
    /// - several matches: delete them all and insert `record`
    pub async fn upsert_by_natural_key<T: Entity>(
        &self,
        record: &T,
    ) -> Result<bool> {
        self.upsert_with(record, |_| true).await
    }

    /// [`Self::upsert_by_natural_key`], guarded by `accept`.
    ///
    /// `accept` sees the rows currently holding the key, inside the same lock
    /// and transaction as the write. Returning `false` leaves the store untouched.
    pub async fn upsert_with<T, F>(
        &self,
        record: &T,
        accept: F,
    ) -> Result<bool>
    where
        T: Entity,
        F: FnOnce(&[T]) -> bool,
    {
        let table = self.mapper().derive_table::<T>()?;
        let _guard = self.lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        self.ensure_table(&mut conn, &table).await?;

        let mut tx = conn.begin().await?;
        let matches: Vec<T> = self.fetch(&mut tx, &table, self.mapper().select_by_natural_key_statement(record)?).await?;
        if !accept(&matches) {
            return Ok(false);
        }

        let changed = match matches.as_slice() {
            [] => {
                let id = execute(&mut tx, self.mapper().insert_statement(record)?).await?.last_insert_rowid();
                trace!("store::upsert({}) inserted {}", table.table_name, id);
                true
            }
            [current] => {
                if same_fields(&table, current, record) {
                    false
                } else {
                    let mut update = record.clone();
                    update.base_mut().id = current.base().id;
                    execute(&mut tx, self.mapper().update_by_id_statement(&update)?).await?;
                    trace!("store::upsert({}) updated {:?}", table.table_name, current.base().id);
                    true
                }
            }
            duplicates => {
                warn!("store::upsert({}) repairing {} rows sharing one natural key", table.table_name, duplicates.len());
                execute(&mut tx, self.mapper().delete_by_natural_key_statement(record)?).await?;
                execute(&mut tx, self.mapper().insert_statement(record)?).await?;
                true
            }
        };
        tx.commit().await?;
        Ok(changed)
    }

    async fn ensure_table(
        &self,
        conn: &mut SqliteConnection,
        table: &TableSpec,
    ) -> Result<()> {
        bootstrap_table(conn, self.mapper(), table).await?;
        Ok(())
    }

    async fn fetch<T: Entity>(
        &self,
        conn: &mut SqliteConnection,
        table: &TableSpec,
        (sql, values): Statement,
    ) -> Result<Vec<T>> {
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
        rows.iter().map(|row| self.mapper().read_row::<T>(table, row)).collect()
    }
}

async fn execute(
    conn: &mut SqliteConnection,
    (sql, values): Statement,
) -> Result<SqliteQueryResult> {
    Ok(sqlx::query_with(&sql, values).execute(&mut *conn).await?)
}

/// Whether every set non-key field of `record` already holds in `current`.
fn same_fields<T: Entity>(
    table: &TableSpec,
    current: &T,
    record: &T,
) -> bool {
    table.entity_columns().filter(|c| !c.is_key_field).all(|column| match record.field(&column.source_field_name) {
        Some(value) => current.field(&column.source_field_name) == Some(value),
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        StoreConfig,
        store::data::{NodeRecord, NodeStatus, Role},
    };

    fn open(dir: &tempfile::TempDir) -> CheckPointDb {
        let config = StoreConfig {
            path: dir.path().join("checkpoint.db").to_string_lossy().to_string(),
            max_connections: 4,
            acquire_timeout_ms: 2000,
        };
        let pool = ConnectionPool::new(config, Arc::new(SchemaMapper::new())).register::<NodeRecord>().unwrap();
        CheckPointDb::new(Arc::new(pool))
    }

    fn peer0() -> NodeRecord {
        NodeRecord::new("Org1MSP", Role::PEER, "peer0", "10.0.0.5", 7051)
    }

    fn without_base(mut record: NodeRecord) -> NodeRecord {
        record.base = Default::default();
        record
    }

    // ==== Bootstrap ====

    #[tokio::test]
    async fn test_schema_bootstrap_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        db.insert(&peer0().with_status(NodeStatus::REGISTERED)).await.unwrap();

        let table = db.mapper().derive_table::<NodeRecord>().unwrap();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            assert!(!bootstrap_table(&mut conn, db.mapper(), &table).await.unwrap());
            assert!(!bootstrap_table(&mut conn, db.mapper(), &table).await.unwrap());
        }
        db.pool().close().await;

        // reopening an existing file skips creation and keeps the rows
        let reopened = open(&dir);
        let rows = reopened.find(&peer0(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(NodeStatus::REGISTERED));
        assert_eq!(rows[0].base.revision, Some(0));
    }

    // ==== CRUD ====

    #[tokio::test]
    async fn test_insert_find_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let record = peer0().with_status(NodeStatus::PACKAGE_BUILT);
        let id = db.insert(&record).await.unwrap();
        assert!(id > 0);

        let rows = db.find(&record.key(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].base.id, Some(id));
        assert!(rows[0].base.created_at.is_some());
        assert!(rows[0].base.modified_at.is_some());
        assert_eq!(without_base(rows[0].clone()), record);
    }

    #[tokio::test]
    async fn test_delete_by_natural_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        db.insert(&peer0()).await.unwrap();
        db.insert(&NodeRecord::new("Org1MSP", Role::PEER, "peer1", "10.0.0.6", 7051)).await.unwrap();

        assert_eq!(db.delete(&peer0()).await.unwrap(), 1);
        assert!(db.find(&peer0(), &OrderBy::new(), Page::all()).await.unwrap().is_empty());
        assert_eq!(db.count(&NodeRecord::default()).await.unwrap(), 1);

        let status_only = NodeRecord {
            status: Some(NodeStatus::FAIL),
            ..Default::default()
        };
        assert!(db.delete(&status_only).await.is_err());
        assert_eq!(db.count(&NodeRecord::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_ids_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        assert!(db.is_empty::<NodeRecord>().await.unwrap());

        let first = db.insert(&peer0()).await.unwrap();
        let second = db.insert(&NodeRecord::new("Org1MSP", Role::ORDERER, "orderer0", "10.0.0.5", 7050)).await.unwrap();
        assert!(!db.is_empty::<NodeRecord>().await.unwrap());

        let same_ip = NodeRecord {
            ip_address: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        assert_eq!(db.count(&same_ip).await.unwrap(), 2);
        assert_eq!(db.find_ids(&same_ip, &OrderBy::new().desc("id"), Page::all()).await.unwrap(), vec![second, first]);
    }

    #[tokio::test]
    async fn test_find_paginates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        for i in (0..10).rev() {
            let record = NodeRecord::new("Org1MSP", Role::PEER, &format!("peer{:02}", i), "10.0.0.9", 7000 + i as u16);
            db.insert(&record).await.unwrap();
        }
        db.insert(&NodeRecord::new("Org1MSP", Role::PEER, "peer99", "10.0.0.10", 7051)).await.unwrap();

        let filter = NodeRecord {
            ip_address: Some("10.0.0.9".to_string()),
            ..Default::default()
        };
        let order = OrderBy::new().asc("host_name");
        let rows = db.find(&filter, &order, Page::new(2, 3)).await.unwrap();
        let hosts = rows.iter().map(|r| r.host_name.clone().unwrap()).collect::<Vec<_>>();
        assert_eq!(hosts, vec!["peer03", "peer04", "peer05"]);

        // non-positive page means every match
        assert_eq!(db.find(&filter, &order, Page::new(0, 3)).await.unwrap().len(), 10);
        assert_eq!(db.find(&filter, &order, Page::new(2, -1)).await.unwrap().len(), 10);
        assert!(db.find(&filter, &order, Page::new(5, 3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_far_page_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        db.insert(&NodeRecord::new("Org1MSP", Role::PEER, "peer0", "10.0.0.5", 7051)).await.unwrap();

        assert!(db.find(&NodeRecord::default(), &OrderBy::new(), Page::new(i64::MAX, 2)).await.unwrap().is_empty());
        assert!(db.find(&NodeRecord::default(), &OrderBy::new(), Page::new(i64::MAX, i64::MAX)).await.unwrap().is_empty());
        assert!(db.find_ids(&NodeRecord::default(), &OrderBy::new(), Page::new(3, i64::MAX)).await.unwrap().is_empty());
    }

    // ==== Upsert ====

    #[tokio::test]
    async fn test_upsert_unchanged_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let record = peer0().with_status(NodeStatus::REGISTERED);

        assert!(db.upsert_by_natural_key(&record).await.unwrap());
        assert!(!db.upsert_by_natural_key(&record).await.unwrap());
        let rows = db.find(&record.key(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].base.revision, Some(0));
    }

    #[tokio::test]
    async fn test_upsert_updates_status_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let id = db.insert(&peer0().with_status(NodeStatus::REGISTERED)).await.unwrap();

        assert!(db.upsert_by_natural_key(&peer0().with_status(NodeStatus::SUCCESS)).await.unwrap());
        let rows = db.find(&peer0(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].base.id, Some(id));
        assert_eq!(rows[0].base.revision, Some(1));
        assert_eq!(rows[0].status, Some(NodeStatus::SUCCESS));
    }

    #[tokio::test]
    async fn test_upsert_repairs_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        db.insert(&peer0().with_status(NodeStatus::REGISTERED)).await.unwrap();
        db.insert(&peer0().with_status(NodeStatus::DOWNLOADED)).await.unwrap();
        assert_eq!(db.count(&peer0()).await.unwrap(), 2);

        assert!(db.upsert_by_natural_key(&peer0().with_status(NodeStatus::INSTALLING)).await.unwrap());
        let rows = db.find(&peer0(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(NodeStatus::INSTALLING));
    }

    #[tokio::test]
    async fn test_upsert_requires_full_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        let mut partial = peer0();
        partial.host_name = None;
        assert!(db.upsert_by_natural_key(&partial).await.is_err());
        assert!(db.is_empty::<NodeRecord>().await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_with_rejection_leaves_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);
        db.insert(&peer0().with_status(NodeStatus::SUCCESS)).await.unwrap();

        let changed = db
            .upsert_with(&peer0().with_status(NodeStatus::REGISTERED), |rows: &[NodeRecord]| NodeStatus::REGISTERED.accepts_from(rows.first().and_then(|r| r.status)))
            .await
            .unwrap();
        assert!(!changed);
        let rows = db.find(&peer0(), &OrderBy::new(), Page::all()).await.unwrap();
        assert_eq!(rows[0].status, Some(NodeStatus::SUCCESS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_upserts_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open(&dir));
        let record = peer0().with_status(NodeStatus::REGISTERED);

        let (a, b) = tokio::join!(
            {
                let db = db.clone();
                let record = record.clone();
                tokio::spawn(async move { db.upsert_by_natural_key(&record).await })
            },
            {
                let db = db.clone();
                let record = record.clone();
                tokio::spawn(async move { db.upsert_by_natural_key(&record).await })
            }
        );
        let mut changed = vec![a.unwrap().unwrap(), b.unwrap().unwrap()];
        changed.sort();
        assert_eq!(changed, vec![false, true]);
        assert_eq!(db.count(&record.key()).await.unwrap(), 1);
    }
}
