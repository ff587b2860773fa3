//! CDC 파이프라인 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("데이터베이스 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("변경 이벤트 디코딩 에러: {0}")]
    DecodeError(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("퍼블리케이션 정렬 에러: {0}")]
    PublicationError(String),

    #[error("오프셋 저장소 에러: {0}")]
    OffsetError(String),

    #[error("리스너 '{listener}' 처리 실패: {message}")]
    ListenerError { listener: String, message: String },

    #[error("싱크 쓰기 에러: {0}")]
    SinkError(String),

    #[error("타입 변환 에러 ({logical_type}): {message}")]
    ConversionError {
        logical_type: String,
        message: String,
    },

    #[error("스키마 레지스트리에 테이블이 없습니다: {0}")]
    SchemaNotFound(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    pub fn listener(listener: impl Into<String>, message: impl Into<String>) -> Self {
        CdcError::ListenerError {
            listener: listener.into(),
            message: message.into(),
        }
    }

    pub fn conversion(logical_type: impl Into<String>, message: impl Into<String>) -> Self {
        CdcError::ConversionError {
            logical_type: logical_type.into(),
            message: message.into(),
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<tokio_postgres::Error> for CdcError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            CdcError::ConnectionError(err.to_string())
        } else {
            CdcError::QueryError(err.to_string())
        }
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::ConnectionError(e.to_string()),
            mysql_async::Error::Driver(e) => CdcError::ConnectionError(e.to_string()),
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
