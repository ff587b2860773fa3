//! 변경 레코드 분배기
//!
//! 라이브 경로: flush된 배치를 테이블별로 묶어 구독 리스너에게 순서대로 전달합니다.
//! 재생 경로: 영속 저장된 트랜잭션을 읽어 같은 방식으로 전달한 뒤, 같은 저장소
//! 트랜잭션 안에서 삭제합니다. 실패하면 롤백되어 레코드가 그대로 남습니다.
//!
//! 테이블 → 리스너 인덱스는 생성 시 한 번 만들어지고 이후 변경되지 않습니다.

use crate::error::Result;
use crate::events::ChangeRecord;
use crate::store::RecordStore;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 변경 레코드 구독자
///
/// 복구 가능한 에러는 리스너 안에서 처리해야 합니다. 반환된 에러는 분배 루프를 멈춥니다.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    fn name(&self) -> &str;

    /// 구독하는 테이블 식별자 (`schema.table`)
    fn tables(&self) -> BTreeSet<String>;

    async fn on_changes(&self, table_id: &str, records: &[ChangeRecord]) -> Result<()>;
}

/// 시작 시점 리스너 등록
#[derive(Default)]
pub struct DispatcherBuilder {
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl DispatcherBuilder {
    pub fn register(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Dispatcher {
        let mut index: HashMap<String, Vec<Arc<dyn ChangeListener>>> = HashMap::new();
        for listener in &self.listeners {
            for table in listener.tables() {
                index.entry(table).or_default().push(listener.clone());
            }
        }

        info!(
            "Dispatcher built with {} listeners over {} tables",
            self.listeners.len(),
            index.len()
        );
        Dispatcher { index }
    }
}

/// 재생 결과 요약
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub transactions: usize,
    pub records: usize,
}

/// 변경 레코드 분배기
pub struct Dispatcher {
    index: HashMap<String, Vec<Arc<dyn ChangeListener>>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// 리스너가 하나 이상 있는 테이블 집합
    pub fn subscribed_tables(&self) -> BTreeSet<String> {
        self.index.keys().cloned().collect()
    }

    pub fn listeners_for(&self, table_id: &str) -> &[Arc<dyn ChangeListener>] {
        self.index.get(table_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 라이브 배치 분배
    pub async fn dispatch(&self, records: Vec<ChangeRecord>) -> Result<()> {
        for (table_id, table_records) in group_by_table(records) {
            let listeners = self.listeners_for(&table_id);
            if listeners.is_empty() {
                warn!(
                    "No listener registered for {}, dropping {} records",
                    table_id,
                    table_records.len()
                );
                continue;
            }

            for listener in listeners {
                debug!(
                    "Dispatching {} records of {} to {}",
                    table_records.len(),
                    table_id,
                    listener.name()
                );
                listener.on_changes(&table_id, &table_records).await?;
            }
        }
        Ok(())
    }

    /// 영속 저장된 트랜잭션 하나 재생
    ///
    /// 분배와 삭제가 같은 저장소 트랜잭션으로 묶입니다. 같은 트랜잭션 ID를 동시에
    /// 재생하는 것은 호출자가 막아야 합니다.
    pub async fn replay_transaction(
        &self,
        store: &dyn RecordStore,
        transaction_id: u64,
    ) -> Result<usize> {
        let mut tx = store.begin().await?;

        let outcome = async {
            let records = tx.load(transaction_id).await?;
            let count = records.len();
            self.dispatch(records).await?;
            tx.delete(transaction_id).await?;
            Ok::<usize, crate::error::CdcError>(count)
        }
        .await;

        match outcome {
            Ok(count) => {
                tx.commit().await?;
                debug!(
                    "Replayed transaction {} ({} records)",
                    transaction_id, count
                );
                Ok(count)
            }
            Err(e) => {
                warn!(
                    "Replay of transaction {} failed, rolling back: {}",
                    transaction_id, e
                );
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        "Rollback of transaction {} failed: {}",
                        transaction_id, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// 영속 저장된 모든 트랜잭션을 ID 오름차순으로 재생
    ///
    /// 실패한 트랜잭션 이후는 재생하지 않습니다 (순서 보장).
    pub async fn replay_all(&self, store: &dyn RecordStore) -> Result<ReplaySummary> {
        let transaction_ids = store.transaction_ids().await?;
        info!("Replaying {} persisted transactions", transaction_ids.len());

        let mut summary = ReplaySummary::default();
        for transaction_id in transaction_ids {
            summary.records += self.replay_transaction(store, transaction_id).await?;
            summary.transactions += 1;
        }

        info!(
            "Replay finished: {} transactions, {} records",
            summary.transactions, summary.records
        );
        Ok(summary)
    }
}

/// 테이블 식별자별 그룹화 (처음 등장한 순서 유지)
pub fn group_by_table(records: Vec<ChangeRecord>) -> IndexMap<String, Vec<ChangeRecord>> {
    let mut groups: IndexMap<String, Vec<ChangeRecord>> = IndexMap::new();
    for record in records {
        groups.entry(record.table_id()).or_default().push(record);
    }
    groups
}
