//! wal2json (format-version 2) 출력 파싱
//!
//! 논리 디코딩 슬롯이 내보내는 행 하나가 JSON 객체 하나입니다.
//!   - action: B(begin) / C(commit) / I / U / D / T(truncate) / M(message)
//!   - xid, lsn, timestamp: include-xids / include-lsn / include-timestamp 옵션
//!   - columns: 새 행 이미지 (I, U)
//!   - identity: replica identity 이미지 (U, D)
//! 각 컬럼은 {name, type, value} 이며 type은 PostgreSQL 타입 이름입니다.

use crate::convert::LogicalType;
use crate::error::{CdcError, Result};
use crate::events::{FieldValue, Payload};
use crate::lsn::Lsn;
use crate::replication::{SourceEvent, SourceMetadata, SourceOp};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct RawChange {
    action: String,
    #[serde(default)]
    xid: Option<u64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    lsn: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Option<Vec<RawColumn>>,
    #[serde(default)]
    identity: Option<Vec<RawColumn>>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    value: Value,
}

/// wal2json 출력 파서
#[derive(Debug, Clone)]
pub struct Wal2JsonParser {
    topic_prefix: String,
}

impl Wal2JsonParser {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Wal2JsonParser {
            topic_prefix: topic_prefix.into(),
        }
    }

    /// 슬롯 변경 행 하나 파싱
    ///
    /// `slot_lsn`/`slot_xid`는 `pg_logical_slot_peek_changes` 결과 컬럼 값이며,
    /// JSON 안에 같은 정보가 있으면 JSON 쪽을 우선합니다.
    pub fn parse(&self, data: &str, slot_lsn: Lsn, slot_xid: Option<u64>) -> Result<SourceEvent> {
        let raw: RawChange = serde_json::from_str(data).map_err(|e| {
            CdcError::DecodeError(format!("Invalid wal2json row at {}: {}", slot_lsn, e))
        })?;

        let op = match raw.action.as_str() {
            "I" => SourceOp::Create,
            "U" => SourceOp::Update,
            "D" => SourceOp::Delete,
            "B" => SourceOp::Begin,
            "C" => SourceOp::Commit,
            "T" => SourceOp::Truncate,
            "M" => SourceOp::Message,
            other => {
                return Err(CdcError::DecodeError(format!(
                    "Unknown wal2json action '{}' at {}",
                    other, slot_lsn
                )))
            }
        };

        let lsn = match raw.lsn.as_deref() {
            Some(text) => Lsn::parse(text)?,
            None => slot_lsn,
        };

        let committed_at = raw.timestamp.as_deref().and_then(parse_commit_timestamp);

        let topic = match (&raw.schema, &raw.table) {
            (Some(schema), Some(table)) => format!("{}.{}.{}", self.topic_prefix, schema, table),
            _ => self.topic_prefix.clone(),
        };

        let (before, after) = match op {
            SourceOp::Create => (None, raw.columns.map(to_payload)),
            SourceOp::Update => (raw.identity.map(to_payload), raw.columns.map(to_payload)),
            SourceOp::Delete => (raw.identity.map(to_payload), None),
            _ => (None, None),
        };

        Ok(SourceEvent {
            topic,
            op,
            before,
            after,
            source: SourceMetadata {
                lsn: Some(lsn),
                transaction_id: raw.xid.or(slot_xid),
                committed_at,
                sequence: None,
                snapshot: false,
            },
        })
    }
}

fn to_payload(columns: Vec<RawColumn>) -> Payload {
    columns
        .into_iter()
        .map(|column| {
            (
                column.name,
                FieldValue::new(LogicalType::from_name(&column.type_name), column.value),
            )
        })
        .collect()
}

/// "2024-03-01 10:15:30.123456+00" 형식 커밋 시각
fn parse_commit_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> Wal2JsonParser {
        Wal2JsonParser::new("central")
    }

    #[test]
    fn test_parse_insert() {
        let data = r#"{"action":"I","xid":731,"lsn":"0/16B3748","timestamp":"2024-03-01 10:15:30.5+00","schema":"referencedata","table":"facilities","columns":[{"name":"id","type":"uuid","value":"7f2a0c5e-2d1b-4a7e-9d0f-0a1b2c3d4e5f"},{"name":"code","type":"character varying(50)","value":"HC01"},{"name":"active","type":"boolean","value":true}]}"#;
        let event = parser().parse(data, Lsn::new(1), None).unwrap();

        assert_eq!(event.op, SourceOp::Create);
        assert_eq!(event.topic, "central.referencedata.facilities");
        assert_eq!(event.source.transaction_id, Some(731));
        assert_eq!(event.source.lsn, Some(Lsn::parse("0/16B3748").unwrap()));
        assert!(event.source.committed_at.is_some());
        assert!(event.before.is_none());

        let after = event.after.unwrap();
        let keys: Vec<&String> = after.keys().collect();
        assert_eq!(keys, vec!["id", "code", "active"]);
        assert_eq!(after["code"].logical_type, LogicalType::Text);
        assert_eq!(after["active"].value, json!(true));
    }

    #[test]
    fn test_parse_update_and_delete_images() {
        let update = r#"{"action":"U","xid":5,"schema":"public","table":"orders","columns":[{"name":"id","type":"integer","value":1},{"name":"qty","type":"integer","value":3}],"identity":[{"name":"id","type":"integer","value":1}]}"#;
        let event = parser().parse(update, Lsn::new(10), None).unwrap();
        assert_eq!(event.op, SourceOp::Update);
        assert_eq!(event.before.as_ref().unwrap().len(), 1);
        assert_eq!(event.after.as_ref().unwrap().len(), 2);
        // JSON에 lsn이 없으면 슬롯 결과의 lsn 사용
        assert_eq!(event.source.lsn, Some(Lsn::new(10)));

        let delete = r#"{"action":"D","schema":"public","table":"orders","identity":[{"name":"id","type":"integer","value":1}]}"#;
        let event = parser().parse(delete, Lsn::new(11), Some(6)).unwrap();
        assert_eq!(event.op, SourceOp::Delete);
        assert!(event.after.is_none());
        assert_eq!(event.source.transaction_id, Some(6));
    }

    #[test]
    fn test_parse_transaction_markers_have_no_image() {
        let begin = parser().parse(r#"{"action":"B","xid":9}"#, Lsn::new(1), None).unwrap();
        assert_eq!(begin.op, SourceOp::Begin);
        assert!(!begin.has_image());
        assert_eq!(begin.topic, "central");

        let commit = parser().parse(r#"{"action":"C","xid":9}"#, Lsn::new(2), None).unwrap();
        assert_eq!(commit.op, SourceOp::Commit);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parser().parse("not json", Lsn::new(1), None).is_err());
        assert!(parser().parse(r#"{"action":"X"}"#, Lsn::new(1), None).is_err());
    }
}
