//! 연결 파라미터 및 실행 설정
//!
//! 모든 값은 환경 변수에서 읽습니다. 테스트에서는 `from_lookup`에
//! 임의의 조회 함수를 넘겨 프로세스 환경을 건드리지 않습니다.

use crate::error::{ReplicationError, Result};
use crate::gtid::GtidList;
use crate::session::StreamPosition;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// utf8_general_ci
pub const DEFAULT_CHARSET: u8 = 33;

/// MySQL 연결 파라미터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub unix_socket: Option<String>,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub charset: u8,
    /// 핸드셰이크 capability에 추가로 OR 되는 플래그
    pub flags: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            host: "localhost".to_string(),
            port: 3306,
            unix_socket: None,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            charset: DEFAULT_CHARSET,
            flags: 0,
        }
    }
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionParams {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// GTID 모드에서 시퀀스 번호로부터 connect state를 만들 때 사용하는 값
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub gtid_domain_id: u32,
    pub gtid_server_id: u32,
    /// `ReplicationSession::spawn` 채널 용량
    pub event_buffer: usize,
    /// `close()`의 정상 종료(COM_QUIT) 대기 한도
    pub close_timeout_ms: u64,
}

impl SessionOptions {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            gtid_domain_id: 1,
            gtid_server_id: 1,
            event_buffer: 1,
            close_timeout_ms: 5_000,
        }
    }
}

/// slave ID 풀 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveIdRange {
    pub base: u32,
    pub count: u32,
}

impl Default for SlaveIdRange {
    fn default() -> Self {
        SlaveIdRange {
            base: 30,
            count: 16,
        }
    }
}

/// 스트리밍 시작 위치 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFrom {
    Position(StreamPosition),
    /// 서버의 `@@gtid_current_pos`에서 시작
    Current,
}

/// binlog-slave 실행 설정
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionParams,
    pub session: SessionOptions,
    pub slave_ids: SlaveIdRange,
    pub start: StartFrom,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConnectionParams::default();
        let connection = ConnectionParams {
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "DB_PORT", defaults.port)?,
            unix_socket: lookup("DB_SOCKET").filter(|s| !s.is_empty()),
            username: lookup("DB_USER").unwrap_or(defaults.username),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
            database: lookup("DB_NAME").filter(|s| !s.is_empty()),
            charset: parse_or(&lookup, "DB_CHARSET", defaults.charset)?,
            flags: parse_or(&lookup, "DB_FLAGS", defaults.flags)?,
        };

        let session_defaults = SessionOptions::default();
        let session = SessionOptions {
            gtid_domain_id: parse_or(&lookup, "BINLOG_GTID_DOMAIN", session_defaults.gtid_domain_id)?,
            gtid_server_id: parse_or(&lookup, "BINLOG_GTID_SERVER", session_defaults.gtid_server_id)?,
            event_buffer: parse_or(&lookup, "BINLOG_EVENT_BUFFER", session_defaults.event_buffer)?,
            close_timeout_ms: parse_or(
                &lookup,
                "BINLOG_CLOSE_TIMEOUT_MS",
                session_defaults.close_timeout_ms,
            )?,
        };
        if session.event_buffer == 0 {
            return Err(ReplicationError::Config(
                "BINLOG_EVENT_BUFFER는 0보다 커야 합니다".to_string(),
            ));
        }

        let range_defaults = SlaveIdRange::default();
        let slave_ids = SlaveIdRange {
            base: parse_or(&lookup, "SLAVE_ID_BASE", range_defaults.base)?,
            count: parse_or(&lookup, "SLAVE_ID_COUNT", range_defaults.count)?,
        };

        Ok(AppConfig {
            connection,
            session,
            slave_ids,
            start: start_from(&lookup)?,
        })
    }
}

fn start_from<F>(lookup: &F) -> Result<StartFrom>
where
    F: Fn(&str) -> Option<String>,
{
    if parse_or(lookup, "BINLOG_FROM_CURRENT", false)? {
        return Ok(StartFrom::Current);
    }

    if let Some(gtid) = lookup("BINLOG_GTID").filter(|s| !s.is_empty()) {
        return Ok(StartFrom::Position(StreamPosition::Gtid(GtidList::parse(&gtid)?)));
    }

    let offset: u32 = parse_or(lookup, "BINLOG_START_POS", 4)?;
    match lookup("BINLOG_FILE").filter(|s| !s.is_empty()) {
        Some(filename) => Ok(StartFrom::Position(StreamPosition::File { filename, offset })),
        None => Ok(StartFrom::Position(StreamPosition::Sequence(offset))),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ReplicationError::Config(format!("{} 값이 올바르지 않습니다: {}", key, raw))),
        None => Ok(default),
    }
}
