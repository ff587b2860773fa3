//! 임베디드 복제 클라이언트 인터페이스
//!
//! 논리 복제 스트림을 디코딩된 행 변경 이벤트(`SourceEvent`)로 제공하는 쪽과
//! 그 이벤트를 받아 처리하는 쪽(`EventHandler`)의 경계입니다.

use crate::error::Result;
use crate::events::Payload;
use crate::lsn::Lsn;
use crate::offset::{OffsetStore, SlotPosition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

/// 구독 리스너가 하나도 없을 때 테이블 필터에 들어가는 센티널 테이블 ID
///
/// 빈 include 목록은 "모든 테이블"로 해석되므로, 존재하지 않는 테이블 하나를 넣어
/// 필터를 문법적으로 유효하면서도 아무것도 매치하지 않게 만듭니다.
pub const NO_LISTENER_SENTINEL: &str = "public.__edge_sync_no_listener__";

/// 캡처 대상 테이블 필터
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableFilter {
    /// 아직 구독 리스너가 없음
    NoListeners,
    /// `schema.table` 식별자 집합
    Tables(BTreeSet<String>),
}

impl TableFilter {
    pub fn from_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables: BTreeSet<String> = tables.into_iter().map(Into::into).collect();
        if tables.is_empty() {
            TableFilter::NoListeners
        } else {
            TableFilter::Tables(tables)
        }
    }

    pub fn matches(&self, table_id: &str) -> bool {
        match self {
            TableFilter::NoListeners => false,
            TableFilter::Tables(tables) => tables.contains(table_id),
        }
    }

    pub fn tables(&self) -> BTreeSet<String> {
        match self {
            TableFilter::NoListeners => BTreeSet::new(),
            TableFilter::Tables(tables) => tables.clone(),
        }
    }

    /// 복제 클라이언트에 넘길 include 목록 (콤마 구분)
    pub fn include_list(&self) -> String {
        match self {
            TableFilter::NoListeners => NO_LISTENER_SENTINEL.to_string(),
            TableFilter::Tables(tables) => tables.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

/// 소스 이벤트 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceOp {
    Create,
    Update,
    Delete,
    /// 스냅샷 읽기
    Read,
    Begin,
    Commit,
    Truncate,
    Message,
}

/// 소스 오프셋 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub lsn: Option<Lsn>,
    pub transaction_id: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    /// 트랜잭션 안에서의 변경 순번 (같은 LSN을 공유하는 변경 구분)
    pub sequence: Option<u32>,
    pub snapshot: bool,
}

/// 디코딩된 행 변경 이벤트 (before/after 이미지 envelope)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// `<prefix>.<schema>.<table>` 형식 식별자
    pub topic: String,
    pub op: SourceOp,
    pub before: Option<Payload>,
    pub after: Option<Payload>,
    pub source: SourceMetadata,
}

impl SourceEvent {
    pub fn has_image(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }
}

/// 복제 클라이언트가 이벤트를 넘기는 대상
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 이벤트 하나 처리 (큐가 가득 차면 대기)
    async fn handle(&self, event: SourceEvent) -> Result<()>;

    /// 트랜잭션 하나의 이벤트를 모두 넘긴 뒤 커밋 위치 전달
    async fn commit(&self, position: SlotPosition) -> Result<()>;
}

/// 복제 클라이언트 실행 컨텍스트
pub struct ClientContext {
    pub filter: TableFilter,
    pub offsets: Arc<OffsetStore>,
    pub handler: Arc<dyn EventHandler>,
    /// 분배 루프가 리스너에 넘기기를 마친 마지막 커밋 위치
    ///
    /// 오프셋 저장과 슬롯 전진은 이 위치를 넘지 않습니다.
    pub dispatched: watch::Receiver<Option<SlotPosition>>,
    pub shutdown: watch::Receiver<bool>,
}

/// 임베디드 복제 클라이언트
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// shutdown 신호가 올 때까지 스트림을 소비
    async fn run(&self, context: ClientContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_uses_sentinel() {
        let filter = TableFilter::from_tables(Vec::<String>::new());
        assert_eq!(filter, TableFilter::NoListeners);
        assert_eq!(filter.include_list(), NO_LISTENER_SENTINEL);
        assert!(!filter.matches(NO_LISTENER_SENTINEL));
    }

    #[test]
    fn test_filter_include_list() {
        let filter =
            TableFilter::from_tables(["requisition.requisitions", "referencedata.facilities"]);
        assert_eq!(
            filter.include_list(),
            "referencedata.facilities,requisition.requisitions"
        );
        assert!(filter.matches("referencedata.facilities"));
        assert!(!filter.matches("referencedata.programs"));
    }
}
