//! 데이터베이스 연결 관리
//!
//! 소스/영속 저장소는 PostgreSQL, 싱크 대상은 PostgreSQL 또는 MySQL 입니다.

use crate::error::{CdcError, Result};
use mysql_async::{Conn, Opts, OptsBuilder, Pool};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

/// PostgreSQL 연결 설정
#[derive(Debug, Clone)]
pub struct PgConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub timeout: Duration,
}

impl Default for PgConnectionConfig {
    fn default() -> Self {
        PgConnectionConfig {
            hostname: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        PgConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.hostname)
            .port(self.port)
            .user(&self.username)
            .dbname(&self.database)
            .connect_timeout(self.timeout)
            .application_name("pg-edge-sync");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

/// PostgreSQL 연결 후 백그라운드에서 connection 태스크 구동
pub async fn connect_postgres(config: &PgConnectionConfig) -> Result<Client> {
    let (client, connection) = config
        .build_config()
        .connect(NoTls)
        .await
        .map_err(|e| {
            CdcError::ConnectionError(format!(
                "Failed to connect to PostgreSQL {}:{}/{}: {}",
                config.hostname, config.port, config.database, e
            ))
        })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {}", e);
        }
    });

    debug!(
        "Connected to PostgreSQL at {}:{}/{}",
        config.hostname, config.port, config.database
    );
    Ok(client)
}

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct MySqlConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub timeout: Duration,
}

impl Default for MySqlConnectionConfig {
    fn default() -> Self {
        MySqlConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl MySqlConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        MySqlConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    pool: Pool,
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &MySqlConnectionConfig) -> Result<Self> {
        let pool = Pool::new(config.build_opts());

        let conn = tokio::time::timeout(config.timeout, pool.get_conn())
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        debug!("Connected to MySQL at {}:{}", config.hostname, config.port);
        Ok(MySqlConnection { pool, conn })
    }

    pub fn conn(&mut self) -> &mut Conn {
        &mut self.conn
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        self.pool.disconnect().await?;
        Ok(())
    }
}
