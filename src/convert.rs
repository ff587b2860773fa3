//! 논리 타입 변환
//!
//! 소스 페이로드 값은 논리 타입 이름이 붙은 느슨한 JSON 값으로 들어옵니다.
//! 싱크 writer는 `SinkValue` 형태의 네이티브 값을 기대하므로 여기서 변환합니다.
//! 알 수 없는 타입 이름은 실패하지 않고 `LogicalType::Other`로 그대로 통과시킵니다.

use crate::error::{CdcError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 알려진 논리 타입 (닫힌 열거형 + pass-through)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Text,
    Bytes,
    Decimal,
    Uuid,
    Timestamp,
    /// 시간대가 있는 타임스탬프 (UTC로 정규화)
    TimestampTz,
    Json,
    /// 변환 없이 값을 그대로 넘기는 타입
    Other(String),
}

impl LogicalType {
    /// 타입 이름 해석
    ///
    /// Connect 스타일 이름(`int32`, `string`...)과 PostgreSQL 타입 이름
    /// (`integer`, `character varying(255)`...)을 모두 받습니다.
    pub fn from_name(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase();
        let base = match normalized.find('(') {
            Some(idx) => normalized[..idx].trim_end(),
            None => normalized.as_str(),
        };

        match base {
            "int16" | "int2" | "smallint" | "smallserial" => LogicalType::Int16,
            "int32" | "int4" | "int" | "integer" | "serial" => LogicalType::Int32,
            "int64" | "int8" | "bigint" | "bigserial" => LogicalType::Int64,
            "float32" | "float4" | "real" => LogicalType::Float32,
            "float64" | "float8" | "double" | "double precision" => LogicalType::Float64,
            "boolean" | "bool" => LogicalType::Boolean,
            "string" | "text" | "varchar" | "character varying" | "character" | "char"
            | "bpchar" | "name" | "citext" => LogicalType::Text,
            "bytes" | "bytea" => LogicalType::Bytes,
            "decimal" | "numeric" | "org.apache.kafka.connect.data.decimal" => {
                LogicalType::Decimal
            }
            "uuid" => LogicalType::Uuid,
            "timestamp" | "timestamp without time zone" => LogicalType::Timestamp,
            "timestamptz" | "timestamp with time zone" => LogicalType::TimestampTz,
            "json" | "jsonb" => LogicalType::Json,
            _ => LogicalType::Other(name.trim().to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LogicalType::Int16 => "int16",
            LogicalType::Int32 => "int32",
            LogicalType::Int64 => "int64",
            LogicalType::Float32 => "float32",
            LogicalType::Float64 => "float64",
            LogicalType::Boolean => "boolean",
            LogicalType::Text => "string",
            LogicalType::Bytes => "bytes",
            LogicalType::Decimal => "decimal",
            LogicalType::Uuid => "uuid",
            LogicalType::Timestamp => "timestamp",
            LogicalType::TimestampTz => "timestamptz",
            LogicalType::Json => "json",
            LogicalType::Other(name) => name,
        }
    }

    /// JSON 값을 싱크 writer용 네이티브 값으로 변환
    pub fn convert(&self, value: &Value) -> Result<SinkValue> {
        if value.is_null() {
            return Ok(SinkValue::Null);
        }

        match self {
            LogicalType::Int16 => {
                let v = self.integer(value)?;
                i16::try_from(v)
                    .map(SinkValue::Int16)
                    .map_err(|_| CdcError::conversion(self.name(), format!("{} out of range", v)))
            }
            LogicalType::Int32 => {
                let v = self.integer(value)?;
                i32::try_from(v)
                    .map(SinkValue::Int32)
                    .map_err(|_| CdcError::conversion(self.name(), format!("{} out of range", v)))
            }
            LogicalType::Int64 => self.integer(value).map(SinkValue::Int64),
            LogicalType::Float32 => self.float(value).map(|v| SinkValue::Float32(v as f32)),
            LogicalType::Float64 => self.float(value).map(SinkValue::Float64),
            LogicalType::Boolean => self.boolean(value).map(SinkValue::Boolean),
            LogicalType::Text => Ok(SinkValue::Text(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            LogicalType::Bytes => self.bytes(value).map(SinkValue::Bytes),
            LogicalType::Decimal => self.decimal(value).map(SinkValue::Decimal),
            LogicalType::Uuid => {
                let text = self.text(value)?;
                Uuid::parse_str(text)
                    .map(SinkValue::Uuid)
                    .map_err(|e| CdcError::conversion(self.name(), e.to_string()))
            }
            LogicalType::Timestamp => self
                .timestamp(value)
                .map(|dt| SinkValue::Timestamp(dt.naive_utc())),
            LogicalType::TimestampTz => self.timestamp(value).map(SinkValue::TimestampTz),
            LogicalType::Json => Ok(SinkValue::Json(match value {
                // wal2json은 json 컬럼을 문자열로 내보냄
                Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
                other => other.clone(),
            })),
            LogicalType::Other(_) => Ok(SinkValue::Raw(value.clone())),
        }
    }

    fn text<'a>(&self, value: &'a Value) -> Result<&'a str> {
        value.as_str().ok_or_else(|| {
            CdcError::conversion(self.name(), format!("expected text, got {}", value))
        })
    }

    fn integer(&self, value: &Value) -> Result<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| CdcError::conversion(self.name(), format!("not an integer: {}", n))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| CdcError::conversion(self.name(), format!("not an integer: {}", s))),
            other => Err(CdcError::conversion(
                self.name(),
                format!("expected integer, got {}", other),
            )),
        }
    }

    fn float(&self, value: &Value) -> Result<f64> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| CdcError::conversion(self.name(), format!("not a number: {}", n))),
            Value::String(s) => match s.trim() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .parse::<f64>()
                    .map_err(|_| CdcError::conversion(self.name(), format!("not a number: {}", s))),
            },
            other => Err(CdcError::conversion(
                self.name(),
                format!("expected number, got {}", other),
            )),
        }
    }

    fn boolean(&self, value: &Value) -> Result<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "y" | "yes" => Ok(true),
                "f" | "false" | "0" | "n" | "no" => Ok(false),
                _ => Err(CdcError::conversion(self.name(), format!("not a boolean: {}", s))),
            },
            other => Err(CdcError::conversion(
                self.name(),
                format!("expected boolean, got {}", other),
            )),
        }
    }

    fn bytes(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::String(s) => {
                // PostgreSQL bytea 텍스트 출력은 "\x" hex 형식
                if let Some(hex) = s.strip_prefix("\\x") {
                    decode_hex(hex).ok_or_else(|| {
                        CdcError::conversion(self.name(), format!("invalid hex bytea: {}", s))
                    })
                } else {
                    BASE64
                        .decode(s.as_bytes())
                        .map_err(|e| CdcError::conversion(self.name(), e.to_string()))
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| CdcError::conversion(self.name(), "byte array out of range"))
                })
                .collect(),
            other => Err(CdcError::conversion(
                self.name(),
                format!("expected bytes, got {}", other),
            )),
        }
    }

    fn decimal(&self, value: &Value) -> Result<Decimal> {
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(CdcError::conversion(
                    self.name(),
                    format!("expected decimal text, got {}", other),
                ))
            }
        };

        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| CdcError::conversion(self.name(), format!("{}: {}", text, e)))
    }

    /// 오프셋이 없는 텍스트는 UTC로 해석
    fn timestamp(&self, value: &Value) -> Result<DateTime<Utc>> {
        match value {
            // epoch 기준 마이크로초
            Value::Number(n) => {
                let micros = n.as_i64().ok_or_else(|| {
                    CdcError::conversion(self.name(), format!("invalid epoch micros: {}", n))
                })?;
                DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                    CdcError::conversion(self.name(), format!("epoch out of range: {}", micros))
                })
            }
            Value::String(s) => {
                let s = s.trim();
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(dt.with_timezone(&Utc));
                }
                if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
                    return Ok(dt.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map(|naive| naive.and_utc())
                    .map_err(|e| CdcError::conversion(self.name(), format!("{}: {}", s, e)))
            }
            other => Err(CdcError::conversion(
                self.name(),
                format!("expected timestamp, got {}", other),
            )),
        }
    }
}

impl From<String> for LogicalType {
    fn from(name: String) -> Self {
        LogicalType::from_name(&name)
    }
}

impl From<LogicalType> for String {
    fn from(logical_type: LogicalType) -> Self {
        logical_type.name().to_string()
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 싱크 writer가 받는 네이티브 값
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    Text(String),
    Bytes(Vec<u8>),
    Decimal(Decimal),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
    /// 알 수 없는 타입의 원본 값
    Raw(Value),
}

impl SinkValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SinkValue::Null | SinkValue::Raw(Value::Null))
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_name_postgres_types() {
        assert_eq!(LogicalType::from_name("integer"), LogicalType::Int32);
        assert_eq!(LogicalType::from_name("character varying(255)"), LogicalType::Text);
        assert_eq!(LogicalType::from_name("numeric(10,2)"), LogicalType::Decimal);
        assert_eq!(LogicalType::from_name("Double Precision"), LogicalType::Float64);
        assert_eq!(
            LogicalType::from_name("timestamp with time zone"),
            LogicalType::TimestampTz
        );
        assert_eq!(
            LogicalType::from_name("timestamp without time zone"),
            LogicalType::Timestamp
        );
        assert_eq!(
            LogicalType::from_name("geometry"),
            LogicalType::Other("geometry".to_string())
        );
    }

    #[test]
    fn test_name_roundtrip() {
        for t in [
            LogicalType::Int16,
            LogicalType::Int64,
            LogicalType::Bytes,
            LogicalType::Decimal,
            LogicalType::TimestampTz,
            LogicalType::Other("tsvector".to_string()),
        ] {
            assert_eq!(LogicalType::from_name(t.name()), t);
        }
    }

    #[test]
    fn test_convert_integers() {
        assert_eq!(
            LogicalType::Int16.convert(&json!(12)).unwrap(),
            SinkValue::Int16(12)
        );
        assert_eq!(
            LogicalType::Int64.convert(&json!("9000000000")).unwrap(),
            SinkValue::Int64(9_000_000_000)
        );
        assert!(LogicalType::Int16.convert(&json!(70000)).is_err());
    }

    #[test]
    fn test_convert_bytes_base64_and_hex() {
        assert_eq!(
            LogicalType::Bytes.convert(&json!("3q2+7w==")).unwrap(),
            SinkValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert_eq!(
            LogicalType::Bytes.convert(&json!("\\xdeadbeef")).unwrap(),
            SinkValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert!(LogicalType::Bytes.convert(&json!("\\xabc")).is_err());
    }

    #[test]
    fn test_convert_decimal_is_exact() {
        let value = LogicalType::Decimal.convert(&json!("12345.6789")).unwrap();
        assert_eq!(
            value,
            SinkValue::Decimal(Decimal::from_str("12345.6789").unwrap())
        );
    }

    #[test]
    fn test_convert_null_and_passthrough() {
        assert_eq!(LogicalType::Uuid.convert(&Value::Null).unwrap(), SinkValue::Null);
        let raw = json!({"x": 1});
        assert_eq!(
            LogicalType::Other("hstore".to_string()).convert(&raw).unwrap(),
            SinkValue::Raw(raw)
        );
    }

    #[test]
    fn test_convert_timestamp_variants() {
        let expected =
            NaiveDateTime::parse_from_str("2024-03-01 10:15:30", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(
            LogicalType::Timestamp.convert(&json!("2024-03-01 10:15:30")).unwrap(),
            SinkValue::Timestamp(expected)
        );
        assert_eq!(
            LogicalType::Timestamp
                .convert(&json!("2024-03-01 12:15:30+02"))
                .unwrap(),
            SinkValue::Timestamp(expected)
        );
    }

    #[test]
    fn test_convert_timestamptz_keeps_instant() {
        let expected = NaiveDateTime::parse_from_str("2024-03-01 10:15:30", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc();
        assert_eq!(
            LogicalType::TimestampTz
                .convert(&json!("2024-03-01 12:15:30+02"))
                .unwrap(),
            SinkValue::TimestampTz(expected)
        );
        assert_eq!(
            LogicalType::TimestampTz
                .convert(&json!("2024-03-01 10:15:30"))
                .unwrap(),
            SinkValue::TimestampTz(expected)
        );
    }

    #[test]
    fn test_logical_type_serde() {
        let json = serde_json::to_string(&LogicalType::Decimal).unwrap();
        assert_eq!(json, "\"decimal\"");
        let back: LogicalType = serde_json::from_str("\"bigint\"").unwrap();
        assert_eq!(back, LogicalType::Int64);
    }
}
