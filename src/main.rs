/// PostgreSQL CDC / 엣지 복제 실행 파일
///
/// `capture`: 중앙 DB의 변경을 캡처해 재생용 저장소에 기록
/// `replay`: 저장된 트랜잭션을 대상 DB에 반영
use clap::{Parser, Subcommand};
use pg_edge_sync::capture::StreamCapture;
use pg_edge_sync::config::AppConfig;
use pg_edge_sync::connection::connect_postgres;
use pg_edge_sync::dispatcher::Dispatcher;
use pg_edge_sync::offset::{OffsetStore, PgOffsetRepository};
use pg_edge_sync::publication::PublicationAligner;
use pg_edge_sync::schema::{InMemorySchemaRegistry, PgSchemaLoader};
use pg_edge_sync::sinker::{DefaultWriterFactory, SinkListener, Sinker};
use pg_edge_sync::slot_client::SlotClient;
use pg_edge_sync::store::{PersistingListener, PgRecordStore};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pg-edge-sync")]
#[command(about = "PostgreSQL change capture and edge replication")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 변경 캡처 (Ctrl-C로 종료)
    Capture,
    /// 저장된 트랜잭션 재생
    Replay {
        /// 이 트랜잭션 하나만 재생
        #[arg(long)]
        transaction: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    match args.command {
        Command::Capture => capture(config).await?,
        Command::Replay { transaction } => replay(config, transaction).await?,
    }
    Ok(())
}

async fn capture(config: AppConfig) -> pg_edge_sync::Result<()> {
    info!(
        "Capturing from {}:{}/{} via slot '{}'",
        config.source.hostname, config.source.port, config.source.database, config.slot.slot_name
    );
    if config.tables.is_empty() {
        warn!("CAPTURE_TABLES is empty, nothing will be captured");
    }

    let store =
        PgRecordStore::new(connect_postgres(&config.store).await?, &config.record_table).await?;
    let offsets =
        PgOffsetRepository::new(connect_postgres(&config.store).await?, &config.offset_table)
            .await?;

    let dispatcher = Dispatcher::builder()
        .register(Arc::new(PersistingListener::new(
            config.tables.clone(),
            Arc::new(store),
        )))
        .build();

    let mut capture = StreamCapture::new(
        config.capture.clone(),
        Arc::new(SlotClient::new(config.slot.clone())),
        Arc::new(dispatcher),
        Arc::new(OffsetStore::new(Arc::new(offsets))),
        Arc::new(PublicationAligner::new(config.source.clone(), &config.publication)),
    );
    capture.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    capture.stop().await
}

async fn replay(config: AppConfig, transaction: Option<u64>) -> pg_edge_sync::Result<()> {
    let source = connect_postgres(&config.source).await?;
    let registry = Arc::new(InMemorySchemaRegistry::new());
    PgSchemaLoader::new(&source)
        .refresh(&registry, &config.tables)
        .await?;

    let sinker = Arc::new(Sinker::new(
        config.target.clone(),
        registry,
        Arc::new(DefaultWriterFactory),
    ));
    let dispatcher = Dispatcher::builder()
        .register(Arc::new(SinkListener::new(config.tables.clone(), sinker)))
        .build();

    let store =
        PgRecordStore::new(connect_postgres(&config.store).await?, &config.record_table).await?;
    match transaction {
        Some(transaction_id) => {
            let count = dispatcher.replay_transaction(&store, transaction_id).await?;
            info!("Replayed transaction {} ({} records)", transaction_id, count);
        }
        None => {
            let summary = dispatcher.replay_all(&store).await?;
            info!(
                "Replayed {} transactions ({} records)",
                summary.transactions, summary.records
            );
        }
    }
    Ok(())
}
