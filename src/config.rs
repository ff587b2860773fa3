//! 프로세스 설정 (환경 변수)
//!
//! | 변수 | 기본값 |
//! |------|--------|
//! | `SOURCE_DB_HOST` / `_PORT` / `_USER` / `_PASSWORD` / `_NAME` | localhost / 5432 / postgres / - / postgres |
//! | `STORE_DB_*` | `SOURCE_DB_*` 값 |
//! | `TARGET_KIND` | postgres (`mysql` 가능) |
//! | `TARGET_DB_*` | localhost / 5432(mysql: 3306) / postgres(mysql: root) / - / postgres |
//! | `SLOT_NAME` | edge_sync_slot |
//! | `PUBLICATION_NAME` | edge_sync_pub |
//! | `TOPIC_PREFIX` | edge |
//! | `CAPTURE_TABLES` | (없음, 콤마 구분 `schema.table`) |
//! | `QUEUE_CAPACITY` | 10000 |
//! | `BUFFER_CAPACITY` | 1000 |
//! | `POLL_TIMEOUT_SECS` | 30 |
//! | `STOP_TIMEOUT_SECS` | 5 |
//! | `SLOT_POLL_INTERVAL_MS` | 1000 |
//! | `SLOT_BATCH_SIZE` | 1000 |
//! | `OFFSET_TABLE` / `RECORD_TABLE` | cdc_offset_store / cdc_change_records |

use crate::capture::CaptureConfig;
use crate::connection::{MySqlConnectionConfig, PgConnectionConfig};
use crate::error::{CdcError, Result};
use crate::offset::DEFAULT_OFFSET_TABLE;
use crate::sinker::SinkTarget;
use crate::slot_client::SlotClientConfig;
use crate::store::DEFAULT_RECORD_TABLE;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: PgConnectionConfig,
    pub store: PgConnectionConfig,
    pub target: SinkTarget,
    pub publication: String,
    pub tables: BTreeSet<String>,
    pub offset_table: String,
    pub record_table: String,
    pub capture: CaptureConfig,
    pub slot: SlotClientConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 임의의 조회 함수로 설정 구성
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let source = env.postgres("SOURCE_DB", &PgConnectionConfig::default())?;
        let store = env.postgres("STORE_DB", &source)?;

        let target = match env.string("TARGET_KIND", "postgres").to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => {
                SinkTarget::Postgres(env.postgres("TARGET_DB", &PgConnectionConfig::default())?)
            }
            "mysql" => SinkTarget::MySql(env.mysql("TARGET_DB")?),
            other => {
                return Err(CdcError::ConfigError(format!(
                    "Unknown TARGET_KIND '{}'",
                    other
                )))
            }
        };

        let tables = env
            .string("CAPTURE_TABLES", "")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                if t.contains('.') {
                    Ok(t.to_string())
                } else {
                    Err(CdcError::ConfigError(format!(
                        "CAPTURE_TABLES entry '{}' must be schema.table",
                        t
                    )))
                }
            })
            .collect::<Result<BTreeSet<String>>>()?;

        let topic_prefix = env.string("TOPIC_PREFIX", "edge");
        let capture = CaptureConfig {
            topic_prefix: topic_prefix.clone(),
            queue_capacity: env.parse("QUEUE_CAPACITY", 10_000)?,
            buffer_capacity: env.parse("BUFFER_CAPACITY", 1_000)?,
            poll_timeout: Duration::from_secs(env.parse("POLL_TIMEOUT_SECS", 30)?),
            stop_timeout: Duration::from_secs(env.parse("STOP_TIMEOUT_SECS", 5)?),
        };

        let slot = SlotClientConfig {
            connection: source.clone(),
            slot_name: env.string("SLOT_NAME", "edge_sync_slot"),
            topic_prefix,
            batch_size: env.parse("SLOT_BATCH_SIZE", 1_000)?,
            poll_interval: Duration::from_millis(env.parse("SLOT_POLL_INTERVAL_MS", 1_000)?),
            ..SlotClientConfig::default()
        };

        Ok(AppConfig {
            source,
            store,
            target,
            publication: env.string("PUBLICATION_NAME", "edge_sync_pub"),
            tables,
            offset_table: env.string("OFFSET_TABLE", DEFAULT_OFFSET_TABLE),
            record_table: env.string("RECORD_TABLE", DEFAULT_RECORD_TABLE),
            capture,
            slot,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| CdcError::ConfigError(format!("{} has invalid value '{}'", key, raw))),
            None => Ok(default),
        }
    }

    fn postgres(&self, prefix: &str, fallback: &PgConnectionConfig) -> Result<PgConnectionConfig> {
        Ok(PgConnectionConfig {
            hostname: self.string(&format!("{}_HOST", prefix), &fallback.hostname),
            port: self.parse(&format!("{}_PORT", prefix), fallback.port)?,
            username: self.string(&format!("{}_USER", prefix), &fallback.username),
            password: self.string(&format!("{}_PASSWORD", prefix), &fallback.password),
            database: self.string(&format!("{}_NAME", prefix), &fallback.database),
            timeout: fallback.timeout,
        })
    }

    fn mysql(&self, prefix: &str) -> Result<MySqlConnectionConfig> {
        let fallback = MySqlConnectionConfig::default();
        Ok(MySqlConnectionConfig {
            hostname: self.string(&format!("{}_HOST", prefix), &fallback.hostname),
            port: self.parse(&format!("{}_PORT", prefix), fallback.port)?,
            username: self.string(&format!("{}_USER", prefix), &fallback.username),
            password: self.string(&format!("{}_PASSWORD", prefix), &fallback.password),
            database: (self.lookup)(&format!("{}_NAME", prefix)),
            timeout: fallback.timeout,
        })
    }
}
