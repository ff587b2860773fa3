//! 테이블 변경 이벤트 → 대상 DB 쓰기
//!
//! 이벤트마다 스키마 레지스트리에서 키 컬럼과 컬럼 스키마를 조회하고, 각 행을
//! 키(키 컬럼)와 값(나머지 컬럼)으로 나눕니다. 삭제 행은 값이 없는 레코드(tombstone)가 되어 키 기준 삭제로,
//! 나머지는 upsert로 쓰입니다.
//!
//! 레지스트리에 없는 컬럼은 버립니다 (auto.evolve 미지원).

use crate::connection::{MySqlConnectionConfig, PgConnectionConfig};
use crate::convert::SinkValue;
use crate::dispatcher::ChangeListener;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, TableChangeEvent};
use crate::mapper::ChangeEventMapper;
use crate::schema::{SchemaRegistry, TableSchema};
use crate::sink_mysql::MySqlSinkWriter;
use crate::sink_postgres::PgSinkWriter;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 쓰기 대상
#[derive(Debug, Clone)]
pub enum SinkTarget {
    Postgres(PgConnectionConfig),
    MySql(MySqlConnectionConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Insert,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkMode {
    None,
    RecordKey,
}

/// writer 설정
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub target: SinkTarget,
    pub auto_create: bool,
    pub auto_evolve: bool,
    pub delete_enabled: bool,
    pub insert_mode: InsertMode,
    pub pk_mode: PkMode,
}

impl SinkConfig {
    /// 고정 설정: auto.create=true, auto.evolve=false, delete.enabled=true,
    /// insert.mode=upsert, pk.mode=record_key
    pub fn new(target: SinkTarget) -> Self {
        SinkConfig {
            target,
            auto_create: true,
            auto_evolve: false,
            delete_enabled: true,
            insert_mode: InsertMode::Upsert,
            pk_mode: PkMode::RecordKey,
        }
    }

    /// writer가 지원하지 않는 조합 거부
    pub fn validate(&self) -> Result<()> {
        if self.auto_evolve {
            return Err(CdcError::ConfigError(
                "auto.evolve is not supported by this sink".to_string(),
            ));
        }
        if self.delete_enabled && self.pk_mode != PkMode::RecordKey {
            return Err(CdcError::ConfigError(
                "delete.enabled requires pk.mode=record_key".to_string(),
            ));
        }
        Ok(())
    }
}

pub type Fields = Vec<(String, SinkValue)>;

/// writer에 넘기는 레코드 하나
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub schema: String,
    pub table: String,
    pub key: Fields,
    /// 키가 아닌 컬럼들, `None`이면 삭제
    pub value: Option<Fields>,
    pub table_schema: TableSchema,
}

impl SinkRecord {
    pub fn table_id(&self) -> String {
        crate::events::table_id(&self.schema, &self.table)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// INSERT에 쓸 전체 컬럼 (키 뒤에 값), 삭제면 `None`
    pub fn row(&self) -> Option<Vec<&(String, SinkValue)>> {
        self.value
            .as_ref()
            .map(|value| self.key.iter().chain(value).collect())
    }
}

#[async_trait]
pub trait SinkWriter: Send {
    async fn start(&mut self, config: &SinkConfig) -> Result<()>;
    async fn put(&mut self, records: Vec<SinkRecord>) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
}

pub trait SinkWriterFactory: Send + Sync {
    fn create(&self, target: &SinkTarget) -> Box<dyn SinkWriter>;
}

/// 대상 종류에 따라 PostgreSQL / MySQL writer 생성
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWriterFactory;

impl SinkWriterFactory for DefaultWriterFactory {
    fn create(&self, target: &SinkTarget) -> Box<dyn SinkWriter> {
        match target {
            SinkTarget::Postgres(_) => Box::new(PgSinkWriter::new()),
            SinkTarget::MySql(_) => Box::new(MySqlSinkWriter::new()),
        }
    }
}

pub struct Sinker {
    target: SinkTarget,
    registry: Arc<dyn SchemaRegistry>,
    factory: Arc<dyn SinkWriterFactory>,
}

impl Sinker {
    pub fn new(
        target: SinkTarget,
        registry: Arc<dyn SchemaRegistry>,
        factory: Arc<dyn SinkWriterFactory>,
    ) -> Self {
        Sinker {
            target,
            registry,
            factory,
        }
    }

    /// 이벤트들을 한 writer 세션으로 적용
    ///
    /// `put` 실패 시 writer를 best-effort로 멈추고 에러를 반환합니다.
    pub async fn apply(&self, events: &[TableChangeEvent]) -> Result<usize> {
        let mut records = Vec::new();
        for event in events {
            records.extend(self.to_sink_records(event)?);
        }
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();

        let config = SinkConfig::new(self.target.clone());
        let mut writer = self.factory.create(&config.target);
        writer.start(&config).await?;

        if let Err(e) = writer.put(records).await {
            warn!("Sink write failed, aborting batch: {}", e);
            if let Err(stop_err) = writer.stop().await {
                warn!("Failed to stop sink writer: {}", stop_err);
            }
            return Err(e);
        }

        writer.stop().await?;
        info!("Applied {} sink records from {} events", count, events.len());
        Ok(count)
    }

    /// 행 → 키/값 분할
    pub fn to_sink_records(&self, event: &TableChangeEvent) -> Result<Vec<SinkRecord>> {
        let table_id = event.table_id();
        let table_schema = self
            .registry
            .table_schema(&table_id)
            .ok_or_else(|| CdcError::SchemaNotFound(table_id.clone()))?;
        if table_schema.key_columns.is_empty() {
            return Err(CdcError::SinkError(format!(
                "Table {} has no key columns",
                table_id
            )));
        }

        for column in &event.columns {
            if table_schema.column(column).is_none() {
                debug!("Dropping column {}.{} unknown to schema registry", table_id, column);
            }
        }

        let mut records = Vec::with_capacity(event.rows.len());
        for row in &event.rows {
            let mut key = Fields::new();
            let mut value = Fields::new();

            for (column, field) in event.columns.iter().zip(&row.values) {
                let (Some(column_schema), Some(field)) = (table_schema.column(column), field) else {
                    continue;
                };
                let converted = column_schema.logical_type.convert(&field.value)?;
                if table_schema.is_key(column) {
                    key.push((column.clone(), converted));
                } else {
                    value.push((column.clone(), converted));
                }
            }

            if key.len() != table_schema.key_columns.len() {
                return Err(CdcError::SinkError(format!(
                    "Row of {} is missing key columns {:?}",
                    table_id, table_schema.key_columns
                )));
            }

            // key 순서를 key_columns 순서에 맞춤
            key.sort_by_key(|(name, _)| {
                table_schema
                    .key_columns
                    .iter()
                    .position(|k| k == name)
                    .unwrap_or(usize::MAX)
            });

            records.push(SinkRecord {
                schema: event.schema.clone(),
                table: event.table.clone(),
                key,
                value: if row.deleted { None } else { Some(value) },
                table_schema: table_schema.clone(),
            });
        }
        Ok(records)
    }
}

/// 재생 분배 → mapper → sinker
pub struct SinkListener {
    name: String,
    tables: BTreeSet<String>,
    sinker: Arc<Sinker>,
}

impl SinkListener {
    pub fn new(tables: BTreeSet<String>, sinker: Arc<Sinker>) -> Self {
        SinkListener {
            name: "sinker".to_string(),
            tables,
            sinker,
        }
    }
}

#[async_trait]
impl ChangeListener for SinkListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn tables(&self) -> BTreeSet<String> {
        self.tables.clone()
    }

    async fn on_changes(&self, table_id: &str, records: &[ChangeRecord]) -> Result<()> {
        let events = ChangeEventMapper::build_events(records.to_vec());
        let applied = self
            .sinker
            .apply(&events)
            .await
            .map_err(|e| CdcError::listener(&self.name, e.to_string()))?;
        debug!("Sank {} rows of {}", applied, table_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::LogicalType;
    use crate::events::{FieldValue, RowChangeEvent};
    use crate::schema::{ColumnSchema, InMemorySchemaRegistry};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Journal {
        calls: Vec<String>,
        puts: Vec<Vec<SinkRecord>>,
    }

    struct RecordingWriter {
        journal: Arc<Mutex<Journal>>,
        fail_put: bool,
    }

    #[async_trait]
    impl SinkWriter for RecordingWriter {
        async fn start(&mut self, config: &SinkConfig) -> Result<()> {
            config.validate()?;
            self.journal.lock().calls.push("start".to_string());
            Ok(())
        }

        async fn put(&mut self, records: Vec<SinkRecord>) -> Result<()> {
            let mut journal = self.journal.lock();
            journal.calls.push("put".to_string());
            if self.fail_put {
                return Err(CdcError::SinkError("target rejected batch".to_string()));
            }
            journal.puts.push(records);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.journal.lock().calls.push("stop".to_string());
            Ok(())
        }
    }

    struct RecordingFactory {
        journal: Arc<Mutex<Journal>>,
        fail_put: bool,
    }

    impl SinkWriterFactory for RecordingFactory {
        fn create(&self, _target: &SinkTarget) -> Box<dyn SinkWriter> {
            Box::new(RecordingWriter {
                journal: self.journal.clone(),
                fail_put: self.fail_put,
            })
        }
    }

    fn sinker(fail_put: bool) -> (Sinker, Arc<Mutex<Journal>>) {
        let registry = InMemorySchemaRegistry::new();
        registry.register(
            "public.orders",
            TableSchema {
                key_columns: vec!["id".to_string()],
                columns: vec![
                    ColumnSchema::new("id", LogicalType::Int64, false),
                    ColumnSchema::new("qty", LogicalType::Int32, true),
                ],
            },
        );
        let journal = Arc::new(Mutex::new(Journal::default()));
        let factory = RecordingFactory {
            journal: journal.clone(),
            fail_put,
        };
        let sinker = Sinker::new(
            SinkTarget::Postgres(PgConnectionConfig::default()),
            Arc::new(registry),
            Arc::new(factory),
        );
        (sinker, journal)
    }

    fn int(value: i64) -> Option<FieldValue> {
        Some(FieldValue::new(LogicalType::Int64, json!(value)))
    }

    fn orders_event() -> TableChangeEvent {
        TableChangeEvent {
            schema: "public".to_string(),
            table: "orders".to_string(),
            version: "v1".to_string(),
            columns: vec!["id".to_string(), "qty".to_string(), "note".to_string()],
            rows: vec![
                RowChangeEvent {
                    deleted: false,
                    values: vec![int(1), int(5), int(9)],
                },
                RowChangeEvent {
                    deleted: true,
                    values: vec![int(1), None, None],
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_upsert_then_delete_in_order() {
        let (sinker, journal) = sinker(false);
        assert_eq!(sinker.apply(&[orders_event()]).await.unwrap(), 2);

        let journal = journal.lock();
        assert_eq!(journal.calls, vec!["start", "put", "stop"]);
        let batch = &journal.puts[0];
        assert_eq!(batch.len(), 2);

        assert_eq!(batch[0].key, vec![("id".to_string(), SinkValue::Int64(1))]);
        assert_eq!(
            batch[0].value,
            Some(vec![("qty".to_string(), SinkValue::Int32(5))])
        );
        let columns: Vec<&str> = batch[0]
            .row()
            .unwrap()
            .into_iter()
            .map(|(c, _)| c.as_str())
            .collect();
        assert_eq!(columns, vec!["id", "qty"]);
        assert!(batch[1].is_tombstone());
        assert!(batch[1].row().is_none());
        assert_eq!(batch[1].key, vec![("id".to_string(), SinkValue::Int64(1))]);
    }

    #[tokio::test]
    async fn test_put_failure_stops_writer_and_returns_error() {
        let (sinker, journal) = sinker(true);
        assert!(sinker.apply(&[orders_event()]).await.is_err());
        assert_eq!(journal.lock().calls, vec!["start", "put", "stop"]);
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected_before_writer_starts() {
        let (sinker, journal) = sinker(false);
        let mut event = orders_event();
        event.table = "unknown".to_string();

        let err = sinker.apply(&[event]).await.unwrap_err();
        assert!(matches!(err, CdcError::SchemaNotFound(_)));
        assert!(journal.lock().calls.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let (sinker, _) = sinker(false);
        let mut event = orders_event();
        event.rows[0].values[0] = None;
        assert!(sinker.to_sink_records(&event).is_err());
    }

    #[test]
    fn test_fixed_config() {
        let config = SinkConfig::new(SinkTarget::MySql(MySqlConnectionConfig::default()));
        assert!(config.auto_create);
        assert!(!config.auto_evolve);
        assert!(config.delete_enabled);
        assert_eq!(config.insert_mode, InsertMode::Upsert);
        assert_eq!(config.pk_mode, PkMode::RecordKey);
        assert!(config.validate().is_ok());

        let evolving = SinkConfig {
            auto_evolve: true,
            ..config
        };
        assert!(evolving.validate().is_err());
    }
}
