//! 변경 레코드 영속 저장소
//!
//! 라이브 캡처 결과를 나중에 재생하기 위해 저장합니다. 기본 키는
//! (스트림 위치, 트랜잭션 내 순번)이며, 재생은 트랜잭션 ID 단위로 이루어집니다.

use crate::dispatcher::ChangeListener;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, Operation};
use crate::lsn::Lsn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_postgres::{Client, Row};
use tracing::{debug, warn};

/// 레코드 테이블 기본 이름
pub const DEFAULT_RECORD_TABLE: &str = "cdc_change_records";

/// 영속 레코드 저장소
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 레코드 저장 (이미 있는 (position, sequence)는 무시), 새로 저장된 개수 반환
    async fn insert(&self, records: &[ChangeRecord]) -> Result<u64>;

    /// 저장된 트랜잭션 ID 목록 (오름차순, 중복 없음)
    async fn transaction_ids(&self) -> Result<Vec<u64>>;

    /// 재생용 저장소 트랜잭션 시작
    async fn begin<'a>(&'a self) -> Result<Box<dyn ReplayTransaction + 'a>>;
}

/// 재생 트랜잭션 (load → dispatch → delete → commit)
#[async_trait]
pub trait ReplayTransaction: Send {
    /// 트랜잭션 ID의 레코드를 (position, sequence) 순으로 읽기
    async fn load(&mut self, transaction_id: u64) -> Result<Vec<ChangeRecord>>;

    async fn delete(&mut self, transaction_id: u64) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// PostgreSQL 테이블 기반 레코드 저장소
pub struct PgRecordStore {
    client: Arc<AsyncMutex<Client>>,
    table: String,
}

impl PgRecordStore {
    pub async fn new(client: Client, table: impl Into<String>) -> Result<Self> {
        let store = PgRecordStore {
            client: Arc::new(AsyncMutex::new(client)),
            table: table.into(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                position BIGINT NOT NULL, \
                sequence INTEGER NOT NULL, \
                table_name TEXT NOT NULL, \
                schema_name TEXT NOT NULL, \
                transaction_id BIGINT NOT NULL, \
                operation TEXT NOT NULL, \
                captured_at TIMESTAMPTZ NOT NULL, \
                payload BYTEA NOT NULL, \
                PRIMARY KEY (position, sequence)); \
             CREATE INDEX IF NOT EXISTS {table}_tx_idx ON {table} (transaction_id);",
            table = self.table
        );
        self.client.lock().await.batch_execute(&ddl).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, records: &[ChangeRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "INSERT INTO {} (position, sequence, table_name, schema_name, transaction_id, \
             operation, captured_at, payload) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (position, sequence) DO NOTHING",
            self.table
        );

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let statement = tx.prepare(&sql).await?;

        let mut inserted = 0;
        for record in records {
            let payload = record.encode_payload()?;
            inserted += tx
                .execute(
                    &statement,
                    &[
                        &(record.position.as_u64() as i64),
                        &(record.sequence as i32),
                        &record.table,
                        &record.schema,
                        &(record.transaction_id as i64),
                        &record.operation.code(),
                        &record.captured_at,
                        &payload,
                    ],
                )
                .await?;
        }
        tx.commit().await?;

        debug!("Persisted {}/{} change records", inserted, records.len());
        Ok(inserted)
    }

    async fn transaction_ids(&self) -> Result<Vec<u64>> {
        let sql = format!(
            "SELECT DISTINCT transaction_id FROM {} ORDER BY transaction_id",
            self.table
        );
        let rows = self.client.lock().await.query(&sql, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<_, i64>(0) as u64)
            .collect())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn ReplayTransaction + 'a>> {
        let client = self.client.clone().lock_owned().await;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgReplayTransaction {
            client: Some(client),
            table: &self.table,
        }))
    }
}

/// 열린 재생 트랜잭션
///
/// commit/rollback 없이 drop되면 연결 잠금을 쥔 채로 ROLLBACK을 보냅니다.
struct PgReplayTransaction<'a> {
    client: Option<OwnedMutexGuard<Client>>,
    table: &'a str,
}

impl<'a> PgReplayTransaction<'a> {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| CdcError::Other("Replay transaction already finished".to_string()))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        self.client()?.batch_execute(statement).await?;
        self.client = None;
        Ok(())
    }
}

impl<'a> Drop for PgReplayTransaction<'a> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        warn!("Replay transaction dropped while open, rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!("Rollback of abandoned replay transaction failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to roll back abandoned replay transaction"),
        }
    }
}

#[async_trait]
impl<'a> ReplayTransaction for PgReplayTransaction<'a> {
    async fn load(&mut self, transaction_id: u64) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT position, sequence, table_name, schema_name, transaction_id, operation, \
             captured_at, payload FROM {} WHERE transaction_id = $1 \
             ORDER BY position, sequence FOR UPDATE",
            self.table
        );
        let rows = self
            .client()?
            .query(&sql, &[&(transaction_id as i64)])
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn delete(&mut self, transaction_id: u64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE transaction_id = $1", self.table);
        Ok(self
            .client()?
            .execute(&sql, &[&(transaction_id as i64)])
            .await?)
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

fn row_to_record(row: &Row) -> Result<ChangeRecord> {
    let position: i64 = row.try_get(0)?;
    let sequence: i32 = row.try_get(1)?;
    let transaction_id: i64 = row.try_get(4)?;
    let operation: String = row.try_get(5)?;
    let captured_at: DateTime<Utc> = row.try_get(6)?;
    let payload: Vec<u8> = row.try_get(7)?;

    Ok(ChangeRecord {
        position: Lsn::new(position as u64),
        sequence: sequence as u32,
        transaction_id: transaction_id as u64,
        table: row.try_get(2)?,
        schema: row.try_get(3)?,
        operation: Operation::from_code(&operation)?,
        payload: ChangeRecord::decode_payload(&payload)?,
        captured_at,
    })
}

/// 메모리 기반 레코드 저장소 (테스트, 임시 실행용)
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(Lsn, u32), ChangeRecord>>,
    fail_next_delete: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        MemoryRecordStore::default()
    }

    pub fn count_for(&self, transaction_id: u64) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// 다음 delete 한 번을 실패시킴
    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, records: &[ChangeRecord]) -> Result<u64> {
        let mut stored = self.records.lock();
        let mut inserted = 0;
        for record in records {
            if !stored.contains_key(&record.key()) {
                stored.insert(record.key(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn transaction_ids(&self) -> Result<Vec<u64>> {
        let ids: BTreeSet<u64> = self
            .records
            .lock()
            .values()
            .map(|r| r.transaction_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn ReplayTransaction + 'a>> {
        Ok(Box::new(MemoryReplayTransaction {
            store: self,
            staged_deletes: Vec::new(),
        }))
    }
}

struct MemoryReplayTransaction<'a> {
    store: &'a MemoryRecordStore,
    staged_deletes: Vec<(Lsn, u32)>,
}

#[async_trait]
impl<'a> ReplayTransaction for MemoryReplayTransaction<'a> {
    async fn load(&mut self, transaction_id: u64) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .store
            .records
            .lock()
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn delete(&mut self, transaction_id: u64) -> Result<u64> {
        if self.store.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(CdcError::QueryError(format!(
                "injected delete failure for transaction {}",
                transaction_id
            )));
        }
        let keys: Vec<(Lsn, u32)> = self
            .store
            .records
            .lock()
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .map(ChangeRecord::key)
            .collect();
        let count = keys.len() as u64;
        self.staged_deletes.extend(keys);
        Ok(count)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut records = self.store.records.lock();
        for key in self.staged_deletes.drain(..) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged_deletes.clear();
        Ok(())
    }
}

/// 분배된 레코드를 재생용 저장소에 기록하는 리스너
pub struct PersistingListener {
    name: String,
    tables: BTreeSet<String>,
    store: Arc<dyn RecordStore>,
}

impl PersistingListener {
    pub fn new(tables: BTreeSet<String>, store: Arc<dyn RecordStore>) -> Self {
        PersistingListener {
            name: "record-persister".to_string(),
            tables,
            store,
        }
    }
}

#[async_trait]
impl ChangeListener for PersistingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn tables(&self) -> BTreeSet<String> {
        self.tables.clone()
    }

    async fn on_changes(&self, table_id: &str, records: &[ChangeRecord]) -> Result<()> {
        let inserted = self.store.insert(records).await?;
        debug!("Stored {} records of {} for replay", inserted, table_id);
        Ok(())
    }
}
