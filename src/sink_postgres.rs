//! PostgreSQL 싱크 writer
//!
//! upsert: `INSERT .. ON CONFLICT (key) DO UPDATE SET ..`
//! delete: `DELETE .. WHERE key = ..`
//! 한 번의 `put`은 하나의 DB 트랜잭션입니다.

use crate::connection::connect_postgres;
use crate::convert::{LogicalType, SinkValue};
use crate::error::{CdcError, Result};
use crate::schema::TableSchema;
use crate::sinker::{InsertMode, SinkConfig, SinkRecord, SinkTarget, SinkWriter};
use async_trait::async_trait;
use bytes::BytesMut;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashSet;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;
use tracing::{debug, info};

type SqlResult = std::result::Result<IsNull, Box<dyn Error + Sync + Send>>;

impl ToSql for SinkValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> SqlResult {
        match self {
            SinkValue::Null => Ok(IsNull::Yes),
            SinkValue::Int16(v) => integer_to_sql(i64::from(*v), ty, out),
            SinkValue::Int32(v) => integer_to_sql(i64::from(*v), ty, out),
            SinkValue::Int64(v) => integer_to_sql(*v, ty, out),
            SinkValue::Float32(v) => match *ty {
                Type::FLOAT8 => f64::from(*v).to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SinkValue::Float64(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SinkValue::Boolean(v) => v.to_sql_checked(ty, out),
            SinkValue::Text(v) => v.to_sql_checked(ty, out),
            SinkValue::Bytes(v) => v.to_sql_checked(ty, out),
            SinkValue::Decimal(v) => v.to_sql_checked(ty, out),
            SinkValue::Uuid(v) => v.to_sql_checked(ty, out),
            SinkValue::Timestamp(v) => match *ty {
                Type::TIMESTAMPTZ => v.and_utc().to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SinkValue::TimestampTz(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SinkValue::Json(v) => v.to_sql_checked(ty, out),
            SinkValue::Raw(Value::Null) => Ok(IsNull::Yes),
            SinkValue::Raw(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql_checked(ty, out),
                _ => match v {
                    Value::String(s) => s.to_sql_checked(ty, out),
                    other => other.to_string().to_sql_checked(ty, out),
                },
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// 대상 컬럼 타입에 맞춰 정수 폭 조정
fn integer_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> SqlResult {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        _ => v.to_sql_checked(ty, out),
    }
}

/// auto.create 시 컬럼 타입
fn column_type(logical_type: &LogicalType) -> &'static str {
    match logical_type {
        LogicalType::Int16 => "SMALLINT",
        LogicalType::Int32 => "INTEGER",
        LogicalType::Int64 => "BIGINT",
        LogicalType::Float32 => "REAL",
        LogicalType::Float64 => "DOUBLE PRECISION",
        LogicalType::Boolean => "BOOLEAN",
        LogicalType::Text | LogicalType::Other(_) => "TEXT",
        LogicalType::Bytes => "BYTEA",
        LogicalType::Decimal => "NUMERIC",
        LogicalType::Uuid => "UUID",
        LogicalType::Timestamp => "TIMESTAMP",
        LogicalType::TimestampTz => "TIMESTAMPTZ",
        LogicalType::Json => "JSONB",
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

pub(crate) fn create_table_sql(schema: &str, table: &str, table_schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = table_schema
        .columns
        .iter()
        .map(|column| {
            let not_null = if !column.nullable || table_schema.is_key(&column.name) {
                " NOT NULL"
            } else {
                ""
            };
            format!(
                "{} {}{}",
                quote(&column.name),
                column_type(&column.logical_type),
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
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(&record.schema, &record.table),
        columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
        placeholders.join(", ")
    );

    if mode == InsertMode::Upsert {
        let keys: Vec<String> = record.key.iter().map(|(k, _)| quote(k)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !record.table_schema.is_key(c))
            .map(|c| format!("{} = EXCLUDED.{}", quote(c), quote(c)))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                updates.join(", ")
            ));
        }
    }
    sql
}

pub(crate) fn delete_sql(record: &SinkRecord) -> String {
    let conditions: Vec<String> = record
        .key
        .iter()
        .enumerate()
        .map(|(i, (k, _))| format!("{} = ${}", quote(k), i + 1))
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        qualified(&record.schema, &record.table),
        conditions.join(" AND ")
    )
}

/// PostgreSQL 싱크 writer
#[derive(Default)]
pub struct PgSinkWriter {
    client: Option<Client>,
    config: Option<SinkConfig>,
    created: HashSet<String>,
}

impl PgSinkWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SinkWriter for PgSinkWriter {
    async fn start(&mut self, config: &SinkConfig) -> Result<()> {
        config.validate()?;
        let SinkTarget::Postgres(connection) = &config.target else {
            return Err(CdcError::ConfigError(
                "PostgreSQL writer needs a PostgreSQL target".to_string(),
            ));
        };

        self.client = Some(connect_postgres(connection).await?);
        self.config = Some(config.clone());
        info!(
            "PostgreSQL sink writer started for {}:{}/{}",
            connection.hostname, connection.port, connection.database
        );
        Ok(())
    }

    async fn put(&mut self, records: Vec<SinkRecord>) -> Result<()> {
        let (Some(client), Some(config)) = (self.client.as_mut(), self.config.as_ref()) else {
            return Err(CdcError::SinkError("writer not started".to_string()));
        };

        let tx = client.transaction().await?;
        for record in &records {
            let table_id = record.table_id();
            if config.auto_create && !self.created.contains(&table_id) {
                tx.batch_execute(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote(&record.schema)
                ))
                .await?;
                tx.batch_execute(&create_table_sql(
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
                    let params: Vec<&(dyn ToSql + Sync)> =
                        fields.iter().map(|(_, v)| v as &(dyn ToSql + Sync)).collect();
                    tx.execute(&upsert_sql(record, &columns, config.insert_mode), &params)
                        .await
                        .map_err(|e| {
                            CdcError::SinkError(format!("Upsert into {} failed: {}", table_id, e))
                        })?;
                }
                None if config.delete_enabled => {
                    let params: Vec<&(dyn ToSql + Sync)> =
                        record.key.iter().map(|(_, v)| v as &(dyn ToSql + Sync)).collect();
                    tx.execute(&delete_sql(record), &params)
                        .await
                        .map_err(|e| {
                            CdcError::SinkError(format!("Delete from {} failed: {}", table_id, e))
                        })?;
                }
                None => debug!("Ignoring delete of {} (delete disabled)", table_id),
            }
        }
        tx.commit().await?;

        debug!("Wrote {} records to PostgreSQL", records.len());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Client drop 시 백그라운드 connection 태스크도 종료됨
        self.client = None;
        self.config = None;
        debug!("PostgreSQL sink writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    fn record(value: Option<Vec<(String, SinkValue)>>) -> SinkRecord {
        SinkRecord {
            schema: "requisition".to_string(),
            table: "requisitions".to_string(),
            key: vec![("id".to_string(), SinkValue::Int64(1))],
            value,
            table_schema: TableSchema {
                key_columns: vec!["id".to_string()],
                columns: vec![
                    ColumnSchema::new("id", LogicalType::Int64, false),
                    ColumnSchema::new("status", LogicalType::Text, true),
                    ColumnSchema::new("extra", LogicalType::Json, true),
                    ColumnSchema::new("approved_at", LogicalType::TimestampTz, true),
                ],
            },
        }
    }

    #[test]
    fn test_create_table_sql() {
        let r = record(None);
        assert_eq!(
            create_table_sql(&r.schema, &r.table, &r.table_schema),
            r#"CREATE TABLE IF NOT EXISTS "requisition"."requisitions" ("id" BIGINT NOT NULL, "status" TEXT, "extra" JSONB, "approved_at" TIMESTAMPTZ, PRIMARY KEY ("id"))"#
        );
    }

    #[test]
    fn test_upsert_sql() {
        let r = record(Some(vec![]));
        assert_eq!(
            upsert_sql(&r, &["id", "status"], InsertMode::Upsert),
            r#"INSERT INTO "requisition"."requisitions" ("id", "status") VALUES ($1, $2) ON CONFLICT ("id") DO UPDATE SET "status" = EXCLUDED."status""#
        );
        assert_eq!(
            upsert_sql(&r, &["id"], InsertMode::Upsert),
            r#"INSERT INTO "requisition"."requisitions" ("id") VALUES ($1) ON CONFLICT ("id") DO NOTHING"#
        );
        assert_eq!(
            upsert_sql(&r, &["id"], InsertMode::Insert),
            r#"INSERT INTO "requisition"."requisitions" ("id") VALUES ($1)"#
        );
    }

    #[test]
    fn test_delete_sql() {
        assert_eq!(
            delete_sql(&record(None)),
            r#"DELETE FROM "requisition"."requisitions" WHERE "id" = $1"#
        );
    }

    #[test]
    fn test_integer_widening() {
        let mut buf = BytesMut::new();
        assert!(SinkValue::Int16(7).to_sql_checked(&Type::INT8, &mut buf).is_ok());
        assert_eq!(buf.len(), 8);

        let mut buf = BytesMut::new();
        assert!(SinkValue::Int64(70_000).to_sql_checked(&Type::INT2, &mut buf).is_err());
    }

    #[test]
    fn test_timestamptz_binds_to_both_timestamp_types() {
        let instant = chrono::DateTime::from_timestamp(1_709_288_130, 0).unwrap();
        let mut with_zone = BytesMut::new();
        SinkValue::TimestampTz(instant)
            .to_sql_checked(&Type::TIMESTAMPTZ, &mut with_zone)
            .unwrap();
        let mut without_zone = BytesMut::new();
        SinkValue::TimestampTz(instant)
            .to_sql_checked(&Type::TIMESTAMP, &mut without_zone)
            .unwrap();
        assert_eq!(with_zone, without_zone);
    }

    #[tokio::test]
    async fn test_put_before_start_fails() {
        let mut writer = PgSinkWriter::new();
        assert!(writer.put(vec![record(None)]).await.is_err());
    }
}
