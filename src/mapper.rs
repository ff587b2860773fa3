//! 변경 레코드 → 테이블 단위 변경 이벤트 변환
//!
//! 같은 테이블의 레코드라도 스키마 변경을 사이에 두면 payload 키 집합이 다를 수 있습니다.
//! 키가 가장 많은 레코드의 payload 순서를 기준 컬럼 목록으로 삼고, 각 레코드의 값을
//! 그 목록 위치에 맞춰 채웁니다. 없는 컬럼은 `None`입니다.
//!
//! 기준 레코드보다 오래된 레코드에만 있는 컬럼(삭제된 컬럼)은 결과에 포함되지 않습니다.
//! 대상 스키마와의 조정은 Sinker의 몫입니다.

use crate::dispatcher::group_by_table;
use crate::events::{ChangeRecord, RowChangeEvent, TableChangeEvent};

pub struct ChangeEventMapper;

impl ChangeEventMapper {
    /// 테이블별로 묶어 이벤트 생성 (테이블은 처음 등장한 순서)
    pub fn build_events(records: Vec<ChangeRecord>) -> Vec<TableChangeEvent> {
        group_by_table(records)
            .into_values()
            .filter_map(|group| Self::build_grouped_event(&group))
            .collect()
    }

    /// 한 테이블의 레코드들로 이벤트 생성 (레코드가 없으면 `None`)
    pub fn build_grouped_event(records: &[ChangeRecord]) -> Option<TableChangeEvent> {
        let first = records.first()?;
        let columns = Self::canonical_columns(records);

        let rows = records
            .iter()
            .map(|record| RowChangeEvent {
                deleted: record.is_delete(),
                values: columns
                    .iter()
                    .map(|column| record.payload.get(column).cloned())
                    .collect(),
            })
            .collect();

        Some(TableChangeEvent {
            schema: first.schema.clone(),
            table: first.table.clone(),
            version: schema_version(&columns),
            columns,
            rows,
        })
    }

    /// payload 키가 가장 많은 레코드의 컬럼 순서 (동률이면 앞선 레코드)
    fn canonical_columns(records: &[ChangeRecord]) -> Vec<String> {
        let mut canonical: Option<&ChangeRecord> = None;
        for record in records {
            match canonical {
                Some(current) if current.payload.len() >= record.payload.len() => {}
                _ => canonical = Some(record),
            }
        }

        canonical
            .map(|record| record.payload.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// 컬럼 목록의 md5 해시
fn schema_version(columns: &[String]) -> String {
    format!("{:x}", md5::compute(columns.join(",").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Operation;
    use crate::testing::{payload, record};

    fn drifted(position: u64, columns: &[(&str, i64)]) -> ChangeRecord {
        let mut record = record(position, 1, "requisition.line_items");
        record.payload = payload(columns);
        record
    }

    #[test]
    fn test_column_superset_from_widest_record() {
        let records = vec![
            drifted(1, &[("a", 1), ("b", 2)]),
            drifted(2, &[("a", 3), ("b", 4), ("c", 5)]),
            drifted(3, &[("a", 6)]),
        ];

        let event = ChangeEventMapper::build_grouped_event(&records).unwrap();
        assert_eq!(event.columns, vec!["a", "b", "c"]);
        assert_eq!(event.rows.len(), 3);
        assert!(event.rows[0].values[2].is_none());
        assert!(event.rows[1].values.iter().all(Option::is_some));
        assert!(event.rows[2].values[0].is_some());
        assert!(event.rows[2].values[1].is_none());
        assert!(event.rows[2].values[2].is_none());
    }

    #[test]
    fn test_column_order_follows_canonical_payload_not_alphabet() {
        let records = vec![drifted(1, &[("zeta", 1), ("alpha", 2)])];
        let event = ChangeEventMapper::build_grouped_event(&records).unwrap();
        assert_eq!(event.columns, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_deletion_flag() {
        let mut deleted = drifted(2, &[("a", 1)]);
        deleted.operation = Operation::Delete;
        let event =
            ChangeEventMapper::build_grouped_event(&[drifted(1, &[("a", 1)]), deleted]).unwrap();
        assert!(!event.rows[0].deleted);
        assert!(event.rows[1].deleted);
    }

    #[test]
    fn test_version_tracks_column_set() {
        let narrow = ChangeEventMapper::build_grouped_event(&[drifted(1, &[("a", 1)])]).unwrap();
        let wide =
            ChangeEventMapper::build_grouped_event(&[drifted(1, &[("a", 1), ("b", 2)])]).unwrap();
        let narrow_again =
            ChangeEventMapper::build_grouped_event(&[drifted(9, &[("a", 7)])]).unwrap();
        assert_ne!(narrow.version, wide.version);
        assert_eq!(narrow.version, narrow_again.version);
    }

    #[test]
    fn test_build_events_groups_tables() {
        let events = ChangeEventMapper::build_events(vec![
            record(1, 1, "public.b"),
            record(2, 1, "public.a"),
            record(3, 1, "public.b"),
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].table_id(), "public.b");
        assert_eq!(events[0].rows.len(), 2);
        assert_eq!(events[1].table_id(), "public.a");
        assert!(ChangeEventMapper::build_grouped_event(&[]).is_none());
    }
}
