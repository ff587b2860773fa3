//! 테이블 스키마 레지스트리
//!
//! 테이블 식별자(`schema.table`) → 키 컬럼 + 컬럼 스키마.
//! 파이프라인 입장에서는 읽기 전용이며, 갱신은 `PgSchemaLoader`가 담당합니다.

use crate::convert::LogicalType;
use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

/// 컬럼 스키마
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, logical_type: LogicalType, nullable: bool) -> Self {
        ColumnSchema {
            name: name.into(),
            logical_type,
            nullable,
        }
    }
}

/// 테이블 스키마
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub key_columns: Vec<String>,
    /// ordinal 순서
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.key_columns.iter().any(|k| k == name)
    }
}

pub trait SchemaRegistry: Send + Sync {
    fn table_schema(&self, table_id: &str) -> Option<TableSchema>;
}

/// 메모리 레지스트리
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    tables: RwLock<HashMap<String, TableSchema>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table_id: impl Into<String>, schema: TableSchema) {
        self.tables.write().insert(table_id.into(), schema);
    }

    pub fn replace_all(&self, tables: HashMap<String, TableSchema>) {
        *self.tables.write() = tables;
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn table_schema(&self, table_id: &str) -> Option<TableSchema> {
        self.tables.read().get(table_id).cloned()
    }
}

/// PostgreSQL 카탈로그에서 스키마 로드
pub struct PgSchemaLoader<'a> {
    client: &'a Client,
}

impl<'a> PgSchemaLoader<'a> {
    pub fn new(client: &'a Client) -> Self {
        PgSchemaLoader { client }
    }

    /// 주어진 테이블들의 스키마를 읽어 레지스트리 전체를 교체
    ///
    /// 컬럼이 하나도 없는 테이블(존재하지 않음)은 경고 후 건너뜁니다.
    pub async fn refresh(
        &self,
        registry: &InMemorySchemaRegistry,
        tables: &BTreeSet<String>,
    ) -> Result<usize> {
        let mut loaded = HashMap::new();
        for table_id in tables {
            let Some((schema, table)) = table_id.split_once('.') else {
                warn!("Skipping malformed table id '{}'", table_id);
                continue;
            };

            let table_schema = self.load_table(schema, table).await?;
            if table_schema.columns.is_empty() {
                warn!("Table {} not found in source catalog", table_id);
                continue;
            }
            debug!(
                "Loaded schema for {} ({} columns, key {:?})",
                table_id,
                table_schema.columns.len(),
                table_schema.key_columns
            );
            loaded.insert(table_id.clone(), table_schema);
        }

        let count = loaded.len();
        registry.replace_all(loaded);
        info!("Schema registry refreshed with {} tables", count);
        Ok(count)
    }

    async fn load_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?;

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let nullable: String = row.get(2);
                ColumnSchema::new(name, LogicalType::from_name(&data_type), nullable == "YES")
            })
            .collect();

        let key_rows = self
            .client
            .query(
                "SELECT a.attname::text \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indisprimary AND n.nspname = $1 AND c.relname = $2 \
                 ORDER BY array_position(i.indkey::int2[], a.attnum)",
                &[&schema, &table],
            )
            .await?;

        Ok(TableSchema {
            key_columns: key_rows.iter().map(|row| row.get(0)).collect(),
            columns,
        })
    }
}
