//! 트랜잭션 버퍼 / 분배 루프
//!
//! 큐에서 레코드를 꺼내 트랜잭션 단위로 모은 뒤 Dispatcher에 넘깁니다.
//! 상태: 대기 → 버퍼링 → flush → 대기
//!
//! flush 조건 (우선순위 순):
//! 1. 큐 poll 타임아웃 (버퍼가 비어 있지 않을 때)
//! 2. 버퍼가 용량에 도달
//! 3. 도착한 레코드의 트랜잭션 ID가 마지막 버퍼 레코드와 다름
//! 4. 커밋 마커 도착
//!
//! 용량 때문에 하나의 트랜잭션이 두 배치로 나뉠 수 있습니다.
//!
//! 커밋 마커 이전 레코드가 모두 리스너에 전달되면 그 커밋 위치를 `dispatched` 채널로
//! 알립니다. 리스너가 실패하면 위치는 더 이상 전진하지 않습니다.

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::events::ChangeRecord;
use crate::offset::SlotPosition;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info};

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// 분배 큐 메시지
#[derive(Debug, Clone)]
pub enum Envelope {
    Record(ChangeRecord),
    /// 앞서 보낸 레코드들의 트랜잭션 커밋 위치
    Commit(SlotPosition),
    /// 남은 버퍼를 flush하고 루프 종료
    Drain,
}

pub struct TransactionBuffer {
    dispatcher: Arc<Dispatcher>,
    capacity: usize,
    poll_timeout: Duration,
    buffer: Vec<ChangeRecord>,
    /// flush되면 확정되는 커밋 위치
    pending_commit: Option<SlotPosition>,
    dispatched: Option<watch::Sender<Option<SlotPosition>>>,
}

impl TransactionBuffer {
    pub fn new(dispatcher: Arc<Dispatcher>, capacity: usize, poll_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        TransactionBuffer {
            dispatcher,
            capacity,
            poll_timeout,
            buffer: Vec::with_capacity(capacity),
            pending_commit: None,
            dispatched: None,
        }
    }

    /// 분배가 끝난 커밋 위치를 보고할 채널
    pub fn report_to(mut self, dispatched: watch::Sender<Option<SlotPosition>>) -> Self {
        self.dispatched = Some(dispatched);
        self
    }

    /// `Drain`을 받거나 큐가 닫힐 때까지 실행
    ///
    /// 리스너 에러는 잡지 않고 그대로 반환하며 루프가 끝납니다.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) -> Result<()> {
        info!(
            "Dispatch loop started (capacity {}, poll timeout {:?})",
            self.capacity, self.poll_timeout
        );

        loop {
            match timeout(self.poll_timeout, rx.recv()).await {
                Err(_elapsed) => {
                    if !self.buffer.is_empty() {
                        debug!("Poll timed out, flushing {} records", self.buffer.len());
                        self.flush().await?;
                    }
                }
                Ok(None) => {
                    info!("Change queue closed, draining");
                    break;
                }
                Ok(Some(Envelope::Drain)) => {
                    info!("Drain requested");
                    break;
                }
                Ok(Some(Envelope::Record(record))) => {
                    if self.should_flush_before(&record) {
                        self.flush().await?;
                    }
                    self.buffer.push(record);
                }
                Ok(Some(Envelope::Commit(position))) => {
                    self.pending_commit = Some(position);
                    self.flush().await?;
                }
            }
        }

        self.flush().await?;
        info!("Dispatch loop stopped");
        Ok(())
    }

    fn should_flush_before(&self, record: &ChangeRecord) -> bool {
        if self.buffer.len() >= self.capacity {
            return true;
        }
        self.buffer
            .last()
            .map(|last| last.transaction_id != record.transaction_id)
            .unwrap_or(false)
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
            debug!("Flushing batch of {} records", batch.len());
            self.dispatcher.dispatch(batch).await?;
        }
        self.acknowledge();
        Ok(())
    }

    /// 버퍼가 비었으므로 대기 중인 커밋은 모두 분배 완료
    fn acknowledge(&mut self) {
        let Some(position) = self.pending_commit.take() else {
            return;
        };
        debug!("Dispatched through {}", position);
        if let Some(dispatched) = &self.dispatched {
            dispatched.send_replace(Some(position));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use crate::testing::{record, RecordingListener};

    fn setup(capacity: usize) -> (Arc<RecordingListener>, TransactionBuffer) {
        let listener = RecordingListener::new("recorder", ["public.a"]);
        let dispatcher = Arc::new(Dispatcher::builder().register(listener.clone()).build());
        let buffer = TransactionBuffer::new(dispatcher, capacity, DEFAULT_POLL_TIMEOUT);
        (listener, buffer)
    }

    fn commit(commit_lsn: u64, transaction_id: u64) -> Envelope {
        Envelope::Commit(position(commit_lsn, transaction_id))
    }

    fn position(commit_lsn: u64, transaction_id: u64) -> SlotPosition {
        SlotPosition {
            commit_lsn: Lsn::new(commit_lsn),
            transaction_id,
        }
    }

    async fn send_all(tx: &mpsc::Sender<Envelope>, records: &[(u64, u64)]) {
        for (position, transaction_id) in records {
            tx.send(Envelope::Record(record(*position, *transaction_id, "public.a")))
                .await
                .unwrap();
        }
    }

    fn batches(listener: &RecordingListener) -> Vec<Vec<u64>> {
        listener.calls().into_iter().map(|(_, p)| p).collect()
    }

    #[tokio::test]
    async fn test_flush_on_transaction_boundary() {
        let (listener, buffer) = setup(100);
        let (tx, rx) = mpsc::channel(16);

        send_all(&tx, &[(1, 1), (2, 1), (3, 2), (4, 2), (5, 2), (6, 1)]).await;
        tx.send(Envelope::Drain).await.unwrap();
        buffer.run(rx).await.unwrap();

        assert_eq!(batches(&listener), vec![vec![1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[tokio::test]
    async fn test_flush_on_capacity() {
        let (listener, buffer) = setup(2);
        let (tx, rx) = mpsc::channel(16);

        send_all(&tx, &[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]).await;
        drop(tx);
        buffer.run(rx).await.unwrap();

        assert_eq!(batches(&listener), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_after_poll_timeout() {
        let (listener, buffer) = setup(100);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(buffer.run(rx));

        send_all(&tx, &[(1, 1), (2, 1)]).await;
        tokio::time::sleep(DEFAULT_POLL_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(batches(&listener), vec![vec![1, 2]]);

        tx.send(Envelope::Drain).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(batches(&listener).len(), 1);
    }

    #[tokio::test]
    async fn test_listener_error_stops_loop() {
        let (listener, buffer) = setup(100);
        listener.fail_next();
        let (tx, rx) = mpsc::channel(16);

        send_all(&tx, &[(1, 1), (2, 2)]).await;
        assert!(buffer.run(rx).await.is_err());
        assert_eq!(batches(&listener), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_commit_marker_flushes_and_reports_position() {
        let (listener, buffer) = setup(100);
        let (dispatched_tx, dispatched) = watch::channel(None);
        let buffer = buffer.report_to(dispatched_tx);
        let (tx, rx) = mpsc::channel(16);

        send_all(&tx, &[(1, 1), (2, 1)]).await;
        tx.send(commit(3, 1)).await.unwrap();
        send_all(&tx, &[(4, 2)]).await;
        tx.send(commit(5, 2)).await.unwrap();
        // 레코드 없는 트랜잭션도 위치는 전진
        tx.send(commit(6, 3)).await.unwrap();
        drop(tx);
        buffer.run(rx).await.unwrap();

        assert_eq!(batches(&listener), vec![vec![1, 2], vec![4]]);
        assert_eq!(*dispatched.borrow(), Some(position(6, 3)));
    }

    #[tokio::test]
    async fn test_failed_dispatch_does_not_report_position() {
        let (listener, buffer) = setup(100);
        let (dispatched_tx, mut dispatched) = watch::channel(None);
        let buffer = buffer.report_to(dispatched_tx);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(buffer.run(rx));

        send_all(&tx, &[(1, 1)]).await;
        tx.send(commit(2, 1)).await.unwrap();
        dispatched.changed().await.unwrap();
        assert_eq!(*dispatched.borrow(), Some(position(2, 1)));

        listener.fail_next();
        send_all(&tx, &[(3, 2)]).await;
        tx.send(commit(4, 2)).await.unwrap();
        assert!(handle.await.unwrap().is_err());

        assert_eq!(batches(&listener), vec![vec![1], vec![3]]);
        assert_eq!(*dispatched.borrow(), Some(position(2, 1)));
        assert!(tx.send(commit(5, 3)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_records_are_not_reported_before_flush() {
        let (listener, buffer) = setup(100);
        let (dispatched_tx, dispatched) = watch::channel(None);
        let buffer = buffer.report_to(dispatched_tx);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(buffer.run(rx));

        send_all(&tx, &[(1, 1), (2, 1)]).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(batches(&listener).is_empty());
        assert_eq!(*dispatched.borrow(), None);

        tx.send(commit(3, 1)).await.unwrap();
        tx.send(Envelope::Drain).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(*dispatched.borrow(), Some(position(3, 1)));
    }
}
