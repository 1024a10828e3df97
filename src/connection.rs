//! 관리용 MySQL 연결
//!
//! 복제 세션과 별개로 일반 클라이언트 연결을 열어 서버 설정을 조회합니다.
//! (체크섬 알고리즘, 현재 GTID 위치 등)

use crate::config::ConnectionParams;
use crate::error::{ReplicationError, Result};
use crate::events::ChecksumAlgorithm;
use crate::gtid::GtidList;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use serde::Serialize;
use tracing::debug;

/// 서버 복제 관련 설정 요약
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: u32,
    pub binlog_format: Option<String>,
    pub checksum: ChecksumAlgorithm,
    pub gtid_current_pos: Option<String>,
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let conn = Conn::new(build_opts(params))
            .await
            .map_err(|e| ReplicationError::Connect(format!("Failed to connect to MySQL: {}", e)))?;
        Ok(MySqlConnection { conn })
    }

    /// 단일 값 조회 (NULL이면 None)
    async fn select_value(&mut self, query: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = self
            .conn
            .query_first(query)
            .await
            .map_err(|e| ReplicationError::Query(format!("Failed to query {}: {}", query, e)))?;
        Ok(row.and_then(|(value,)| value))
    }

    pub async fn get_server_id(&mut self) -> Result<u32> {
        let value = self
            .select_value("SELECT @@server_id")
            .await?
            .ok_or_else(|| ReplicationError::Query("server_id is NULL".to_string()))?;
        value
            .parse()
            .map_err(|_| ReplicationError::Query(format!("Invalid server_id: {}", value)))
    }

    pub async fn get_binlog_checksum(&mut self) -> Result<ChecksumAlgorithm> {
        let value = self
            .select_value("SELECT @@global.binlog_checksum")
            .await?
            .unwrap_or_default();
        ChecksumAlgorithm::parse(&value)
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<Option<String>> {
        self.select_value("SELECT @@global.binlog_format").await
    }

    /// MariaDB 전용. MySQL에서는 변수가 없어 None
    pub async fn get_gtid_current_pos(&mut self) -> Result<Option<GtidList>> {
        match self.select_value("SELECT @@global.gtid_current_pos").await {
            Ok(Some(value)) => Ok(Some(GtidList::parse(&value)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("gtid_current_pos unavailable: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn status(&mut self) -> Result<ServerStatus> {
        let server_id = self.get_server_id().await?;
        let binlog_format = self.get_binlog_format().await?;
        let checksum = self.get_binlog_checksum().await?;
        let gtid_current_pos = self.get_gtid_current_pos().await?.map(|l| l.to_string());

        Ok(ServerStatus {
            server_id,
            binlog_format,
            checksum,
            gtid_current_pos,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

fn build_opts(params: &ConnectionParams) -> Opts {
    let builder = OptsBuilder::default()
        .ip_or_hostname(params.host.clone())
        .tcp_port(params.port)
        .socket(params.unix_socket.clone())
        .user(Some(params.username.clone()))
        .pass(Some(params.password.clone()))
        .db_name(params.database.clone());
    Opts::from(builder)
}
