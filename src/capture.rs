//! 변경 스트림 캡처 서비스
//!
//! 시작 단계:
//! 1. publication 정렬 (구독 리스너가 있는 테이블), 정렬된 테이블 집합이 스트림 필터가 됨
//! 2. 저장된 오프셋 적재
//! 3. 복제 클라이언트 태스크 + 분배 루프 태스크 기동
//!
//! 종료는 역순입니다: 클라이언트 중지 → 분배 루프에 `Drain` 전송 → 분배 루프 종료 대기.

use crate::buffer::{Envelope, TransactionBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_POLL_TIMEOUT};
use crate::dispatcher::Dispatcher;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, Operation};
use crate::offset::{OffsetStore, SlotPosition};
use crate::publication::Aligner;
use crate::replication::{
    ClientContext, EventHandler, ReplicationClient, SourceEvent, SourceOp, TableFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 캡처 설정
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub topic_prefix: String,
    pub queue_capacity: usize,
    pub buffer_capacity: usize,
    pub poll_timeout: Duration,
    /// 종료 시 각 태스크를 기다리는 시간
    pub stop_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            topic_prefix: "edge".to_string(),
            queue_capacity: 10_000,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// 소스 이벤트 → 변경 레코드 변환 후 큐에 적재
pub struct ChangeConsumer {
    topic: Regex,
    sender: mpsc::Sender<Envelope>,
}

impl ChangeConsumer {
    pub fn new(topic_prefix: &str, sender: mpsc::Sender<Envelope>) -> Result<Self> {
        let topic = Regex::new(&format!(
            r"^{}\.([^.]+)\.([^.]+)$",
            regex::escape(topic_prefix)
        ))
        .map_err(|e| {
            CdcError::ConfigError(format!("Invalid topic prefix '{}': {}", topic_prefix, e))
        })?;
        Ok(ChangeConsumer { topic, sender })
    }

    /// 이벤트 하나를 변경 레코드로 변환
    ///
    /// 이미지가 없는 이벤트(heartbeat, begin/commit 마커)와 스냅샷 읽기는 `None`.
    pub fn to_change_record(
        &self,
        event: SourceEvent,
        captured_at: DateTime<Utc>,
    ) -> Result<Option<ChangeRecord>> {
        if !event.has_image() || event.source.snapshot {
            return Ok(None);
        }

        let (operation, image) = match event.op {
            SourceOp::Create => (Operation::Insert, event.after),
            SourceOp::Update => (Operation::Update, event.after),
            SourceOp::Delete => (Operation::Delete, event.before),
            _ => return Ok(None),
        };
        let payload = image.ok_or_else(|| {
            CdcError::InvalidEvent(format!(
                "{:?} event on {} has no usable image",
                operation, event.topic
            ))
        })?;

        let captures = self
            .topic
            .captures(&event.topic)
            .ok_or_else(|| CdcError::InvalidEvent(format!("Unexpected topic '{}'", event.topic)))?;
        let position = event.source.lsn.ok_or_else(|| {
            CdcError::InvalidEvent(format!("Event on {} has no position", event.topic))
        })?;
        let transaction_id = event.source.transaction_id.ok_or_else(|| {
            CdcError::InvalidEvent(format!("Event on {} has no transaction id", event.topic))
        })?;

        Ok(Some(ChangeRecord {
            position,
            sequence: event.source.sequence.unwrap_or(0),
            transaction_id,
            schema: captures[1].to_string(),
            table: captures[2].to_string(),
            operation,
            payload,
            captured_at,
        }))
    }
}

#[async_trait]
impl EventHandler for ChangeConsumer {
    async fn handle(&self, event: SourceEvent) -> Result<()> {
        let record = match self.to_change_record(event, Utc::now()) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Skipping change event: {}", e);
                return Ok(());
            }
        };

        // 큐가 가득 차면 무기한 대기
        self.sender
            .send(Envelope::Record(record))
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }

    async fn commit(&self, position: SlotPosition) -> Result<()> {
        self.sender
            .send(Envelope::Commit(position))
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    sender: mpsc::Sender<Envelope>,
    client_task: JoinHandle<Result<()>>,
    dispatch_task: JoinHandle<Result<()>>,
}

/// 스트림 캡처 서비스
pub struct StreamCapture {
    config: CaptureConfig,
    client: Arc<dyn ReplicationClient>,
    dispatcher: Arc<Dispatcher>,
    offsets: Arc<OffsetStore>,
    aligner: Arc<dyn Aligner>,
    running: Option<Running>,
}

impl StreamCapture {
    pub fn new(
        config: CaptureConfig,
        client: Arc<dyn ReplicationClient>,
        dispatcher: Arc<Dispatcher>,
        offsets: Arc<OffsetStore>,
        aligner: Arc<dyn Aligner>,
    ) -> Self {
        StreamCapture {
            config,
            client,
            dispatcher,
            offsets,
            aligner,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// 캡처 시작
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(CdcError::Other("Stream capture already started".to_string()));
        }
        info!("Starting stream capture");

        let subscribed = TableFilter::from_tables(self.dispatcher.subscribed_tables());
        if subscribed == TableFilter::NoListeners {
            warn!("No listeners registered, capture will not emit any changes");
        }

        let filter = self.aligner.align(&subscribed).await?;
        if filter != subscribed {
            warn!(
                "Streaming {:?} only, other subscribed tables are missing from the source",
                filter.tables()
            );
        }

        match self.offsets.load().await? {
            Some(_) => info!("Resuming from stored offset"),
            None => info!("No stored offset, starting from current slot position"),
        }

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatched_tx, dispatched) = watch::channel(None);
        let consumer = Arc::new(ChangeConsumer::new(&self.config.topic_prefix, sender.clone())?);

        let buffer = TransactionBuffer::new(
            self.dispatcher.clone(),
            self.config.buffer_capacity,
            self.config.poll_timeout,
        )
        .report_to(dispatched_tx);
        let dispatch_task = tokio::spawn(async move {
            let result = buffer.run(receiver).await;
            if let Err(e) = &result {
                error!("Dispatch loop failed: {}", e);
            }
            result
        });

        let client = self.client.clone();
        let context = ClientContext {
            filter,
            offsets: self.offsets.clone(),
            handler: consumer,
            dispatched,
            shutdown: shutdown_rx,
        };
        let client_task = tokio::spawn(async move {
            let result = client.run(context).await;
            if let Err(e) = &result {
                error!("Replication client failed: {}", e);
            }
            result
        });

        self.running = Some(Running {
            shutdown,
            sender,
            client_task,
            dispatch_task,
        });
        info!("Stream capture started");
        Ok(())
    }

    /// 캡처 종료
    ///
    /// 각 단계는 `stop_timeout`만큼만 기다리고, 넘기면 경고 후 태스크를 중단합니다.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("Stopping stream capture");
        let wait = self.config.stop_timeout;

        let _ = running.shutdown.send(true);
        let mut client_task = running.client_task;
        match timeout(wait, &mut client_task).await {
            Ok(Ok(Ok(()))) => debug!("Replication client stopped"),
            Ok(Ok(Err(e))) => warn!("Replication client ended with error: {}", e),
            Ok(Err(e)) => warn!("Replication client task panicked: {}", e),
            Err(_) => {
                warn!("Replication client did not stop within {:?}, aborting", wait);
                client_task.abort();
            }
        }

        if timeout(wait, running.sender.send(Envelope::Drain)).await.is_err() {
            warn!("Could not enqueue drain request within {:?}", wait);
        }
        drop(running.sender);

        let mut dispatch_task = running.dispatch_task;
        let result = match timeout(wait, &mut dispatch_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CdcError::Other(format!("Dispatch task panicked: {}", e))),
            Err(_) => {
                warn!("Dispatch loop did not stop within {:?}, aborting", wait);
                dispatch_task.abort();
                Err(CdcError::Timeout)
            }
        };

        info!("Stream capture stopped");
        result
    }
}
