//! MySQL 싱크 writer
//!
//! 소스의 `schema`는 MySQL 데이터베이스로 매핑됩니다.
//! upsert: `INSERT .. ON DUPLICATE KEY UPDATE ..`

use crate::connection::MySqlConnection;
use crate::convert::{LogicalType, SinkValue};
use crate::error::{CdcError, Result};
use crate::schema::TableSchema;
use crate::sinker::{InsertMode, SinkConfig, SinkRecord, SinkTarget, SinkWriter};
use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::Queryable;
use mysql_async::{Params, TxOpts, Value};
use std::collections::HashSet;
use tracing::{debug, info};

/// SinkValue → MySQL 값
pub fn to_mysql_value(value: &SinkValue) -> Value {
    match value {
        SinkValue::Null => Value::NULL,
        SinkValue::Int16(v) => Value::Int(i64::from(*v)),
        SinkValue::Int32(v) => Value::Int(i64::from(*v)),
        SinkValue::Int64(v) => Value::Int(*v),
        SinkValue::Float32(v) => Value::Float(*v),
        SinkValue::Float64(v) => Value::Double(*v),
        SinkValue::Boolean(v) => Value::Int(i64::from(*v)),
        SinkValue::Text(v) => Value::Bytes(v.clone().into_bytes()),
        SinkValue::Bytes(v) => Value::Bytes(v.clone()),
        SinkValue::Decimal(v) => Value::Bytes(v.to_string().into_bytes()),
        SinkValue::Uuid(v) => Value::Bytes(v.hyphenated().to_string().into_bytes()),
        SinkValue::Timestamp(v) => Value::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.nanosecond() / 1_000,
        ),
        // DATETIME에는 UTC 기준 값으로 저장
        SinkValue::TimestampTz(v) => to_mysql_value(&SinkValue::Timestamp(v.naive_utc())),
        SinkValue::Json(v) => Value::Bytes(v.to_string().into_bytes()),
        SinkValue::Raw(serde_json::Value::Null) => Value::NULL,
        SinkValue::Raw(serde_json::Value::String(s)) => Value::Bytes(s.clone().into_bytes()),
        SinkValue::Raw(other) => Value::Bytes(other.to_string().into_bytes()),
    }
}

/// auto.create 시 컬럼 타입 (키 컬럼은 인덱스 가능한 타입)
fn column_type(logical_type: &LogicalType, is_key: bool) -> &'static str {
    match logical_type {
        LogicalType::Int16 => "SMALLINT",
        LogicalType::Int32 => "INT",
        LogicalType::Int64 => "BIGINT",
        LogicalType::Float32 => "FLOAT",
        LogicalType::Float64 => "DOUBLE",
        LogicalType::Boolean => "BOOLEAN",
        LogicalType::Text | LogicalType::Other(_) if is_key => "VARCHAR(255)",
        LogicalType::Text | LogicalType::Other(_) => "TEXT",
        LogicalType::Bytes if is_key => "VARBINARY(255)",
        LogicalType::Bytes => "LONGBLOB",
        LogicalType::Decimal => "DECIMAL(65,30)",
        LogicalType::Uuid => "CHAR(36)",
        LogicalType::Timestamp | LogicalType::TimestampTz => "DATETIME(6)",
        LogicalType::Json => "JSON",
    }
}

fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

pub(crate) fn create_table_sql(schema: &str, table: &str, table_schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = table_schema
        .columns
        .iter()
        .map(|column| {
            let is_key = table_schema.is_key(&column.name);
            let not_null = if !column.nullable || is_key { " NOT NULL" } else { "" };
            format!(
                "{} {}{}",
                quote(&column.name),
                column_type(&column.logical_type, is_key),
                not_null
            )
        })
        .collect();
    definitions.push(format!(
        "PRIMARY KEY ({})",
        table_schema
            .key_columns
            .iter()
            .map(|k| quote(k))
            .collect::<Vec<_>>()
            .join(", ")
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(schema, table),
        definitions.join(", ")
    )
}

pub(crate) fn upsert_sql(record: &SinkRecord, columns: &[&str], mode: InsertMode) -> String {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(&record.schema, &record.table),
        columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
        vec!["?"; columns.len()].join(", ")
    );

    if mode == InsertMode::Upsert {
        let mut updates: Vec<String> = columns
            .iter()
            .filter(|c| !record.table_schema.is_key(c))
            .map(|c| format!("{} = VALUES({})", quote(c), quote(c)))
            .collect();
        if updates.is_empty() {
            // 키만 있는 테이블: 아무것도 바꾸지 않는 no-op 갱신
            if let Some((key, _)) = record.key.first() {
                updates.push(format!("{} = {}", quote(key), quote(key)));
            }
        }
        sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")));
    }
    sql
}

pub(crate) fn delete_sql(record: &SinkRecord) -> String {
    let conditions: Vec<String> = record
        .key
        .iter()
        .map(|(k, _)| format!("{} = ?", quote(k)))
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        qualified(&record.schema, &record.table),
        conditions.join(" AND ")
    )
}

fn params<'a>(fields: impl IntoIterator<Item = &'a (String, SinkValue)>) -> Params {
    Params::Positional(fields.into_iter().map(|(_, v)| to_mysql_value(v)).collect())
}

/// MySQL 싱크 writer
#[derive(Default)]
pub struct MySqlSinkWriter {
    connection: Option<MySqlConnection>,
    config: Option<SinkConfig>,
    created: HashSet<String>,
}

impl MySqlSinkWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SinkWriter for MySqlSinkWriter {
    async fn start(&mut self, config: &SinkConfig) -> Result<()> {
        config.validate()?;
        let SinkTarget::MySql(connection) = &config.target else {
            return Err(CdcError::ConfigError(
                "MySQL writer needs a MySQL target".to_string(),
            ));
        };

        self.connection = Some(MySqlConnection::connect(connection).await?);
        self.config = Some(config.clone());
        info!(
            "MySQL sink writer started for {}:{}",
            connection.hostname, connection.port
        );
        Ok(())
    }

    async fn put(&mut self, records: Vec<SinkRecord>) -> Result<()> {
        let (Some(connection), Some(config)) = (self.connection.as_mut(), self.config.as_ref())
        else {
            return Err(CdcError::SinkError("writer not started".to_string()));
        };

        let mut tx = connection.conn().start_transaction(TxOpts::default()).await?;
        for record in &records {
            let table_id = record.table_id();
            if config.auto_create && !self.created.contains(&table_id) {
                tx.query_drop(format!(
                    "CREATE DATABASE IF NOT EXISTS {}",
                    quote(&record.schema)
                ))
                .await?;
                tx.query_drop(create_table_sql(
                    &record.schema,
                    &record.table,
                    &record.table_schema,
                ))
                .await?;
                self.created.insert(table_id.clone());
            }

            match record.row() {
                Some(fields) => {
                    let columns: Vec<&str> = fields.iter().map(|(c, _)| c.as_str()).collect();
                    let sql = upsert_sql(record, &columns, config.insert_mode);
                    tx.exec_drop(sql, params(fields.iter().copied()))
                        .await
                        .map_err(|e| {
                            CdcError::SinkError(format!("Upsert into {} failed: {}", table_id, e))
                        })?;
                }
                None if config.delete_enabled => {
                    tx.exec_drop(delete_sql(record), params(&record.key))
                        .await
                        .map_err(|e| {
                            CdcError::SinkError(format!("Delete from {} failed: {}", table_id, e))
                        })?;
                }
                None => debug!("Ignoring delete of {} (delete disabled)", table_id),
            }
        }
        tx.commit().await?;

        debug!("Wrote {} records to MySQL", records.len());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.config = None;
        if let Some(connection) = self.connection.take() {
            connection.close().await?;
        }
        debug!("MySQL sink writer stopped");
        Ok(())
    }
}
