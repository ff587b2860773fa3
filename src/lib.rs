//! PostgreSQL 변경 데이터 캡처(CDC) 및 엣지 복제 엔진
//!
//! 중앙 PostgreSQL의 논리 복제 스트림을 읽어 트랜잭션 단위로 묶고, 등록된 리스너에게
//! 분배합니다. 영속 저장된 변경은 나중에 재생되어 엣지 DB(PostgreSQL / MySQL)에 반영됩니다.
//! 주요 기능:
//! - publication 정렬 및 오프셋 관리
//! - 트랜잭션 버퍼링과 테이블별 분배
//! - 영속 저장된 트랜잭션 재생
//! - 대상 DB로의 upsert / delete

pub mod buffer;
pub mod capture;
pub mod config;
pub mod connection;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lsn;
pub mod mapper;
pub mod offset;
pub mod publication;
pub mod replication;
pub mod schema;
pub mod sink_mysql;
pub mod sink_postgres;
pub mod sinker;
pub mod slot_client;
pub mod store;
pub mod wal2json;

#[cfg(test)]
mod testing;

pub use capture::StreamCapture;
pub use dispatcher::{ChangeListener, Dispatcher};
pub use error::{CdcError, Result};
pub use events::{ChangeRecord, TableChangeEvent};
pub use lsn::Lsn;
pub use offset::OffsetStore;
pub use sinker::Sinker;
