//! 변경 레코드와 테이블 단위 변경 이벤트 데이터 구조 정의

use crate::convert::{LogicalType, SinkValue};
use crate::error::{CdcError, Result};
use crate::lsn::Lsn;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 컬럼명 → 값 매핑 (삽입 순서 유지)
pub type Payload = IndexMap<String, FieldValue>;

/// 테이블 식별자 (`schema.table`)
pub fn table_id(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// 논리 타입 이름이 붙은 컬럼 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    pub value: Value,
}

impl FieldValue {
    pub fn new(logical_type: LogicalType, value: Value) -> Self {
        FieldValue {
            logical_type,
            value,
        }
    }

    pub fn null(logical_type: LogicalType) -> Self {
        FieldValue::new(logical_type, Value::Null)
    }

    /// 싱크용 네이티브 값으로 변환
    pub fn to_sink_value(&self) -> Result<SinkValue> {
        self.logical_type.convert(&self.value)
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// 영속 저장용 연산 코드
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Insert => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim() {
            "c" => Ok(Operation::Insert),
            "u" => Ok(Operation::Update),
            "d" => Ok(Operation::Delete),
            other => Err(CdcError::InvalidEvent(format!(
                "Unknown operation code: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 행 단위 변경 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// WAL 스트림 위치
    pub position: Lsn,
    /// 트랜잭션 안의 변경 순번
    ///
    /// 다중 행 INSERT/COPY는 행마다 같은 LSN을 가지므로 `(position, sequence)`가
    /// 영속 저장 시 기본 키입니다.
    pub sequence: u32,
    /// 소스 트랜잭션 ID
    pub transaction_id: u64,
    /// 스키마명
    pub schema: String,
    /// 테이블명
    pub table: String,
    /// 연산 타입
    pub operation: Operation,
    /// 컬럼 값들 (INSERT/UPDATE는 after 이미지, DELETE는 before 이미지)
    pub payload: Payload,
    /// 캡처 시각 (처리 시점의 벽시계 시각)
    pub captured_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn table_id(&self) -> String {
        table_id(&self.schema, &self.table)
    }

    /// 영속 저장 키
    pub fn key(&self) -> (Lsn, u32) {
        (self.position, self.sequence)
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// 페이로드를 불투명 바이트 blob으로 직렬화
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    pub fn decode_payload(blob: &[u8]) -> Result<Payload> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// 테이블 단위 변경 이벤트 (영속 저장하지 않음)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChangeEvent {
    pub schema: String,
    pub table: String,
    /// 컬럼 목록에서 계산한 스키마 버전 태그 (drift 감지용)
    pub version: String,
    /// 기여 레코드들의 컬럼 합집합
    pub columns: Vec<String>,
    pub rows: Vec<RowChangeEvent>,
}

impl TableChangeEvent {
    pub fn table_id(&self) -> String {
        table_id(&self.schema, &self.table)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// 행 단위 변경 (컬럼 목록과 위치가 맞춰진 값 리스트)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub deleted: bool,
    /// 값이 없는 컬럼은 `None`
    pub values: Vec<Option<FieldValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ChangeRecord {
        let mut payload = Payload::new();
        payload.insert("id".to_string(), FieldValue::new(LogicalType::Int32, json!(7)));
        payload.insert(
            "name".to_string(),
            FieldValue::new(LogicalType::Text, json!("clinic")),
        );
        ChangeRecord {
            position: Lsn::new(100),
            sequence: 0,
            transaction_id: 42,
            schema: "referencedata".to_string(),
            table: "facilities".to_string(),
            operation: Operation::Update,
            payload,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_table_id() {
        assert_eq!(record().table_id(), "referencedata.facilities");
    }

    #[test]
    fn test_operation_codes() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::from_code(op.code()).unwrap(), op);
        }
        assert!(Operation::from_code("r").is_err());
    }

    #[test]
    fn test_payload_blob_keeps_order_and_types() {
        let record = record();
        let blob = record.encode_payload().unwrap();
        let payload = ChangeRecord::decode_payload(&blob).unwrap();
        let keys: Vec<&String> = payload.keys().collect();
        assert_eq!(keys, vec!["id", "name"]);
        assert_eq!(payload["id"].logical_type, LogicalType::Int32);
    }
}
