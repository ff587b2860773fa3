//! 테스트 공용 fixture

use crate::convert::LogicalType;
use crate::dispatcher::ChangeListener;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, FieldValue, Operation, Payload};
use crate::lsn::Lsn;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `schema.table` 테이블의 INSERT 레코드 (payload: id = position)
pub fn record(position: u64, transaction_id: u64, table_id: &str) -> ChangeRecord {
    let (schema, table) = table_id.split_once('.').unwrap_or(("public", table_id));
    let mut payload = Payload::new();
    payload.insert(
        "id".to_string(),
        FieldValue::new(LogicalType::Int64, json!(position)),
    );
    ChangeRecord {
        position: Lsn::new(position),
        sequence: 0,
        transaction_id,
        schema: schema.to_string(),
        table: table.to_string(),
        operation: Operation::Insert,
        payload,
        captured_at: Utc::now(),
    }
}

/// 주어진 컬럼(정수 값)으로 payload 구성
pub fn payload(columns: &[(&str, i64)]) -> Payload {
    columns
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                FieldValue::new(LogicalType::Int64, json!(value)),
            )
        })
        .collect()
}

/// 호출 내역을 기록하는 리스너
pub struct RecordingListener {
    name: String,
    tables: BTreeSet<String>,
    calls: Mutex<Vec<(String, Vec<u64>)>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
    fail_next: AtomicBool,
}

impl RecordingListener {
    pub fn new<const N: usize>(name: &str, tables: [&str; N]) -> Arc<Self> {
        Arc::new(Self::build(name, tables, None))
    }

    pub fn with_journal<const N: usize>(
        name: &str,
        tables: [&str; N],
        journal: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self::build(name, tables, Some(journal)))
    }

    fn build<const N: usize>(
        name: &str,
        tables: [&str; N],
        journal: Option<Arc<Mutex<Vec<String>>>>,
    ) -> Self {
        RecordingListener {
            name: name.to_string(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
            journal,
            fail_next: AtomicBool::new(false),
        }
    }

    /// 다음 호출 한 번을 실패시킴
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// (테이블, 전달된 레코드 position 목록)
    pub fn calls(&self) -> Vec<(String, Vec<u64>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChangeListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn tables(&self) -> BTreeSet<String> {
        self.tables.clone()
    }

    async fn on_changes(&self, table_id: &str, records: &[ChangeRecord]) -> Result<()> {
        self.calls.lock().push((
            table_id.to_string(),
            records.iter().map(|r| r.position.as_u64()).collect(),
        ));
        if let Some(journal) = &self.journal {
            journal.lock().push(self.name.clone());
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CdcError::listener(&self.name, "injected failure"));
        }
        Ok(())
    }
}
