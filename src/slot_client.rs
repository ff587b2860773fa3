//! 논리 복제 슬롯 폴링 클라이언트
//!
//! `pg_logical_slot_peek_changes`로 wal2json 출력을 읽고, 트랜잭션 단위로 묶어
//! 핸들러에 넘깁니다. peek은 슬롯을 소비하지 않으므로 이미 넘긴 트랜잭션은 커밋 LSN으로
//! 걸러냅니다.
//!
//! 오프셋 저장과 슬롯 전진은 분배 루프가 리스너에 넘기기를 마쳤다고 알린 커밋 위치까지만
//! 진행합니다. 저장 → 전진 사이에 죽으면 다음 실행에서 같은 트랜잭션을 다시 읽지만,
//! 저장된 커밋 LSN 이하의 트랜잭션은 건너뜁니다.

use crate::connection::{connect_postgres, PgConnectionConfig};
use crate::error::{CdcError, Result};
use crate::lsn::Lsn;
use crate::offset::SlotPosition;
use crate::replication::{ClientContext, ReplicationClient, SourceEvent, SourceOp, TableFilter};
use crate::wal2json::Wal2JsonParser;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio_postgres::Client;
use tracing::{debug, error, info, warn};

const PEEK_SQL: &str = "SELECT lsn::text, xid::text, data \
     FROM pg_logical_slot_peek_changes($1, NULL, $2, \
     'format-version', '2', 'include-xids', '1', 'include-lsn', '1', \
     'include-timestamp', '1', 'add-tables', $3)";

/// 슬롯 클라이언트 설정
#[derive(Debug, Clone)]
pub struct SlotClientConfig {
    pub connection: PgConnectionConfig,
    pub slot_name: String,
    pub topic_prefix: String,
    /// 한 번에 읽을 변경 행 수 (트랜잭션 경계에서 초과 가능)
    pub batch_size: i32,
    /// 변경이 없을 때 다음 poll까지 대기
    pub poll_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SlotClientConfig {
    fn default() -> Self {
        SlotClientConfig {
            connection: PgConnectionConfig::default(),
            slot_name: "edge_sync_slot".to_string(),
            topic_prefix: "edge".to_string(),
            batch_size: 1000,
            poll_interval: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SlotClientConfig {
    pub fn new(connection: PgConnectionConfig, slot_name: impl Into<String>) -> Self {
        SlotClientConfig {
            connection,
            slot_name: slot_name.into(),
            ..Default::default()
        }
    }

    /// n번째 연속 실패 후 대기 시간 (지수 증가, 상한 있음)
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 연속 실패 횟수
///
/// 세션이 한 번이라도 poll에 성공하면 0으로 돌아갑니다.
#[derive(Debug, Default)]
pub struct Reconnect {
    failures: u32,
}

impl Reconnect {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// 실패 기록 후 다음 시도까지 대기 시간
    pub fn on_failure(&mut self, config: &SlotClientConfig) -> Duration {
        self.failures += 1;
        config.backoff(self.failures)
    }

    pub fn on_polled(&mut self) {
        if self.failures > 0 {
            debug!("Slot session healthy again after {} failures", self.failures);
            self.failures = 0;
        }
    }
}

/// peek 결과 행
#[derive(Debug, Clone)]
pub struct SlotRow {
    pub lsn: Lsn,
    pub xid: Option<u64>,
    pub data: String,
}

/// 커밋 마커까지 다 읽은 트랜잭션
#[derive(Debug, Clone)]
pub struct PlannedTransaction {
    pub position: SlotPosition,
    /// 트랜잭션 안 순번(`sequence`)이 채워진 이벤트
    pub events: Vec<SourceEvent>,
}

/// 배치 처리 계획
#[derive(Debug, Default)]
pub struct SlotBatch {
    /// 핸들러에 넘길 트랜잭션 (완료된 것만, 커밋 순)
    pub transactions: Vec<PlannedTransaction>,
    /// 이미 넘겨서 건너뛴 트랜잭션 수
    pub skipped_transactions: usize,
    pub decode_errors: usize,
}

impl SlotBatch {
    pub fn event_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.events.len()).sum()
    }
}

/// peek 결과를 트랜잭션 단위로 정리
///
/// `delivered` 이하 커밋 LSN의 트랜잭션은 건너뜁니다. 커밋 마커가 없는 꼬리 트랜잭션은
/// 버립니다 (슬롯이 전진하지 않으므로 다음에 다시 읽힘).
pub fn plan_batch(
    rows: Vec<SlotRow>,
    parser: &Wal2JsonParser,
    delivered: Option<SlotPosition>,
) -> SlotBatch {
    let mut batch = SlotBatch::default();
    let mut pending: Vec<SourceEvent> = Vec::new();

    for row in rows {
        let mut event = match parser.parse(&row.data, row.lsn, row.xid) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping undecodable slot row at {}: {}", row.lsn, e);
                batch.decode_errors += 1;
                continue;
            }
        };

        match event.op {
            SourceOp::Begin => pending.clear(),
            SourceOp::Commit => {
                let position = SlotPosition {
                    commit_lsn: event.source.lsn.unwrap_or(row.lsn),
                    transaction_id: event.source.transaction_id.or(row.xid).unwrap_or(0),
                };
                let already_done = delivered
                    .map(|done| position.commit_lsn <= done.commit_lsn)
                    .unwrap_or(false);

                if already_done {
                    debug!("Skipping already delivered transaction {}", position);
                    batch.skipped_transactions += 1;
                    pending.clear();
                } else {
                    batch.transactions.push(PlannedTransaction {
                        position,
                        events: std::mem::take(&mut pending),
                    });
                }
            }
            _ => {
                event.source.sequence = Some(pending.len() as u32);
                pending.push(event);
            }
        }
    }

    if !pending.is_empty() {
        debug!(
            "Leaving {} events of an unfinished transaction for the next poll",
            pending.len()
        );
    }
    batch
}

/// 새로 저장해야 할 체크포인트 (분배 완료 위치가 저장된 위치보다 앞설 때만)
pub fn checkpoint_target(
    dispatched: Option<SlotPosition>,
    stored: Option<SlotPosition>,
) -> Option<SlotPosition> {
    let dispatched = dispatched?;
    match stored {
        Some(stored) if dispatched.commit_lsn <= stored.commit_lsn => None,
        _ => Some(dispatched),
    }
}

/// 논리 복제 슬롯 폴링 클라이언트
pub struct SlotClient {
    config: SlotClientConfig,
    parser: Wal2JsonParser,
}

impl SlotClient {
    pub fn new(config: SlotClientConfig) -> Self {
        let parser = Wal2JsonParser::new(config.topic_prefix.clone());
        SlotClient { config, parser }
    }

    /// 슬롯이 없으면 wal2json 슬롯 생성
    async fn ensure_slot(&self, client: &Client) -> Result<()> {
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.config.slot_name],
            )
            .await?;
        if exists.is_none() {
            client
                .query_one(
                    "SELECT pg_create_logical_replication_slot($1, 'wal2json')::text",
                    &[&self.config.slot_name],
                )
                .await?;
            info!("Created replication slot '{}'", self.config.slot_name);
        }
        Ok(())
    }

    async fn peek(&self, client: &Client, filter: &TableFilter) -> Result<Vec<SlotRow>> {
        let rows = client
            .query(
                PEEK_SQL,
                &[&self.config.slot_name, &self.config.batch_size, &filter.include_list()],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let lsn: String = row.get(0);
                let xid: Option<String> = row.get(1);
                Ok(SlotRow {
                    lsn: Lsn::parse(&lsn)?,
                    xid: xid.and_then(|x| x.parse().ok()),
                    data: row.get(2),
                })
            })
            .collect()
    }

    /// 분배가 끝난 위치까지 오프셋 저장 후 슬롯 전진
    async fn checkpoint(&self, client: &Client, context: &ClientContext) -> Result<()> {
        let mut offset = context.offsets.current();
        let stored = offset.slot_position(&self.config.slot_name)?;
        let dispatched = *context.dispatched.borrow();
        let Some(position) = checkpoint_target(dispatched, stored) else {
            return Ok(());
        };

        offset.set_slot_position(&self.config.slot_name, position);
        context.offsets.save(&offset).await?;
        client
            .query_one(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)::text",
                &[&self.config.slot_name, &position.commit_lsn.to_string()],
            )
            .await?;
        debug!("Checkpointed slot '{}' at {}", self.config.slot_name, position);
        Ok(())
    }

    /// 연결 하나의 수명 동안 poll 반복 (shutdown 시 `Ok`)
    ///
    /// `delivered`는 핸들러에 넘긴 마지막 커밋 위치로, 재연결 사이에도 유지됩니다.
    async fn run_session(
        &self,
        context: &ClientContext,
        shutdown: &mut watch::Receiver<bool>,
        delivered: &mut Option<SlotPosition>,
        reconnect: &mut Reconnect,
    ) -> Result<()> {
        let client = connect_postgres(&self.config.connection).await?;
        self.ensure_slot(&client).await?;
        info!(
            "Polling slot '{}' for tables [{}]",
            self.config.slot_name,
            context.filter.include_list()
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.checkpoint(&client, context).await?;
            let rows = self.peek(&client, &context.filter).await?;
            reconnect.on_polled();

            let batch = plan_batch(rows, &self.parser, *delivered);
            if batch.transactions.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            let events = batch.event_count();
            let transactions = batch.transactions.len();
            for transaction in batch.transactions {
                for event in transaction.events {
                    context.handler.handle(event).await?;
                }
                context.handler.commit(transaction.position).await?;
                *delivered = Some(transaction.position);
            }
            debug!(
                "Handed over {} events in {} transactions, skipped {}",
                events, transactions, batch.skipped_transactions
            );
        }
    }
}

#[async_trait]
impl ReplicationClient for SlotClient {
    async fn run(&self, context: ClientContext) -> Result<()> {
        let mut shutdown = context.shutdown.clone();
        let mut delivered = context
            .offsets
            .current()
            .slot_position(&self.config.slot_name)?;
        let mut reconnect = Reconnect::default();

        loop {
            let session = self
                .run_session(&context, &mut shutdown, &mut delivered, &mut reconnect)
                .await;
            match session {
                Ok(()) => {
                    info!("Slot client stopped");
                    return Ok(());
                }
                Err(CdcError::ChannelClosed) => {
                    warn!("Change queue closed, slot client stopping");
                    return Err(CdcError::ChannelClosed);
                }
                Err(e) => {
                    let backoff = reconnect.on_failure(&self.config);
                    error!(
                        "Slot polling failed (attempt {}), reconnecting in {:?}: {}",
                        reconnect.failures(),
                        backoff,
                        e
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!("Shutdown during reconnection backoff");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
