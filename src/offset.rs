//! 스트림 처리 위치 저장 (Offset 및 OffsetStore)
//!
//! 오프셋은 복제 클라이언트의 재시작 토큰인 불투명 key/value 바이트 쌍입니다.
//! 프로세스 시작 시 한 번 읽고, flush 경계마다 덮어씁니다.
//!
//! 저장은 같은 트랜잭션 안에서 "현재 키 upsert → 사라진 키 삭제" 순서로 진행합니다.
//! 중간에 프로세스가 죽어도 테이블이 비는 순간이 없습니다.

use crate::error::{CdcError, Result};
use crate::lsn::Lsn;
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_postgres::Client;
use tracing::{debug, info};

/// 오프셋 테이블 기본 이름
pub const DEFAULT_OFFSET_TABLE: &str = "cdc_offset_store";

/// 스트림 재시작 위치 (key → value)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Offset {
    entries: BTreeMap<Bytes, Bytes>,
}

impl Offset {
    pub fn new() -> Self {
        Offset::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Bytes, Bytes)>) -> Self {
        Offset {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 슬롯 키에 저장된 처리 위치
    pub fn slot_position(&self, slot_name: &str) -> Result<Option<SlotPosition>> {
        self.get(slot_name.as_bytes())
            .map(|value| SlotPosition::decode(value))
            .transpose()
    }

    pub fn set_slot_position(&mut self, slot_name: &str, position: SlotPosition) {
        self.set(
            Bytes::copy_from_slice(slot_name.as_bytes()),
            Bytes::from(position.encode()),
        );
    }
}

/// 복제 슬롯 처리 위치 (마지막으로 전달 완료된 트랜잭션의 커밋 LSN)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPosition {
    pub commit_lsn: Lsn,
    pub transaction_id: u64,
}

impl SlotPosition {
    const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = self.commit_lsn.to_bytes();
        let _ = buffer.write_u64::<BigEndian>(self.transaction_id);
        buffer
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(CdcError::OffsetError(format!(
                "Slot position needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let commit_lsn = Lsn::from_bytes(&bytes[..Lsn::ENCODED_LEN])?;
        let mut rest = &bytes[Lsn::ENCODED_LEN..];
        let transaction_id = rest.read_u64::<BigEndian>()?;
        Ok(SlotPosition {
            commit_lsn,
            transaction_id,
        })
    }
}

impl fmt::Display for SlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tx {})", self.commit_lsn, self.transaction_id)
    }
}

/// 오프셋 행 저장소
#[async_trait]
pub trait OffsetRepository: Send + Sync {
    async fn load_entries(&self) -> Result<Vec<(Bytes, Bytes)>>;

    /// 저장된 행 전체를 주어진 항목으로 교체
    async fn replace_entries(&self, entries: &[(Bytes, Bytes)]) -> Result<()>;
}

/// PostgreSQL 테이블 기반 오프셋 저장소
pub struct PgOffsetRepository {
    client: tokio::sync::Mutex<Client>,
    table: String,
}

impl PgOffsetRepository {
    pub async fn new(client: Client, table: impl Into<String>) -> Result<Self> {
        let repository = PgOffsetRepository {
            client: tokio::sync::Mutex::new(client),
            table: table.into(),
        };
        repository.ensure_table().await?;
        Ok(repository)
    }

    async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                offset_key BYTEA PRIMARY KEY, \
                offset_val BYTEA NOT NULL)",
            self.table
        );
        self.client.lock().await.batch_execute(&ddl).await?;
        Ok(())
    }
}

#[async_trait]
impl OffsetRepository for PgOffsetRepository {
    async fn load_entries(&self) -> Result<Vec<(Bytes, Bytes)>> {
        let query = format!("SELECT offset_key, offset_val FROM {}", self.table);
        let rows = self.client.lock().await.query(&query, &[]).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let key: Vec<u8> = row.get(0);
                let value: Vec<u8> = row.get(1);
                (Bytes::from(key), Bytes::from(value))
            })
            .collect())
    }

    async fn replace_entries(&self, entries: &[(Bytes, Bytes)]) -> Result<()> {
        let upsert = format!(
            "INSERT INTO {} (offset_key, offset_val) VALUES ($1, $2) \
             ON CONFLICT (offset_key) DO UPDATE SET offset_val = EXCLUDED.offset_val",
            self.table
        );
        let prune = format!(
            "DELETE FROM {} WHERE NOT (offset_key = ANY($1))",
            self.table
        );

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        for (key, value) in entries {
            let key: &[u8] = key.as_ref();
            let value: &[u8] = value.as_ref();
            tx.execute(&upsert, &[&key, &value]).await?;
        }

        let keys: Vec<&[u8]> = entries.iter().map(|(key, _)| key.as_ref()).collect();
        let pruned = tx.execute(&prune, &[&keys]).await?;
        tx.commit().await?;

        debug!(
            "Persisted {} offset entries (pruned {})",
            entries.len(),
            pruned
        );
        Ok(())
    }
}

/// 메모리 기반 오프셋 저장소 (테스트, 임시 실행용)
#[derive(Default)]
pub struct MemoryOffsetRepository {
    entries: Mutex<Vec<(Bytes, Bytes)>>,
}

impl MemoryOffsetRepository {
    pub fn new() -> Self {
        MemoryOffsetRepository::default()
    }
}

#[async_trait]
impl OffsetRepository for MemoryOffsetRepository {
    async fn load_entries(&self) -> Result<Vec<(Bytes, Bytes)>> {
        Ok(self.entries.lock().clone())
    }

    async fn replace_entries(&self, entries: &[(Bytes, Bytes)]) -> Result<()> {
        *self.entries.lock() = entries.to_vec();
        Ok(())
    }
}

/// 오프셋 저장소 (메모리 상태 + 영속 저장소)
pub struct OffsetStore {
    repository: Arc<dyn OffsetRepository>,
    current: RwLock<Offset>,
}

impl OffsetStore {
    pub fn new(repository: Arc<dyn OffsetRepository>) -> Self {
        OffsetStore {
            repository,
            current: RwLock::new(Offset::new()),
        }
    }

    /// 저장된 오프셋을 읽어 메모리 상태로 적재
    ///
    /// 행이 없으면 `None` (첫 실행, 슬롯의 현재 위치부터 시작)
    pub async fn load(&self) -> Result<Option<Offset>> {
        let entries = self.repository.load_entries().await?;
        if entries.is_empty() {
            info!("No stored offset found, starting from the current slot position");
            *self.current.write() = Offset::new();
            return Ok(None);
        }

        let offset = Offset::from_entries(entries);
        info!("Loaded offset with {} entries", offset.entries.len());
        *self.current.write() = offset.clone();
        Ok(Some(offset))
    }

    /// 오프셋 영속화
    pub async fn save(&self, offset: &Offset) -> Result<()> {
        let entries: Vec<(Bytes, Bytes)> = offset
            .entries()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.repository.replace_entries(&entries).await?;
        *self.current.write() = offset.clone();
        Ok(())
    }

    pub fn current(&self) -> Offset {
        self.current.read().clone()
    }
}
