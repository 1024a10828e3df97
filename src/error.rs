//! 복제 세션 에러 타입

use std::fmt;
use std::io;
use thiserror::Error;

/// errno 2013: Lost connection to MySQL server during query
pub const CR_SERVER_LOST: u16 = 2013;

/// 서버(또는 클라이언트 측 드라이버)가 보고한 SQL 에러
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        ServerError {
            code,
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }

    /// 연결이 끊긴 경우의 에러 (CR_SERVER_LOST)
    pub fn lost_connection(detail: impl fmt::Display) -> Self {
        ServerError::new(
            CR_SERVER_LOST,
            "HY000",
            format!("Lost connection to MySQL server during query ({})", detail),
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.message, self.sql_state, self.code)
    }
}

impl std::error::Error for ServerError {}

/// 스트림 읽기 실패 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureKind {
    /// 복구 불가능한 프로토콜/전송 오류
    Fatal,
    /// 외부에서 세션을 닫으면서 발생하는 예상된 연결 끊김
    ExpectedDisconnect,
}

impl ReadFailureKind {
    pub fn classify(err: &ReplicationError) -> Self {
        match err.server_code() {
            Some(CR_SERVER_LOST) => ReadFailureKind::ExpectedDisconnect,
            _ => ReadFailureKind::Fatal,
        }
    }
}

impl fmt::Display for ReadFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFailureKind::Fatal => f.write_str("fatal"),
            ReadFailureKind::ExpectedDisconnect => f.write_str("expected disconnect"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("MySQL 연결 에러: {0}")]
    Connect(String),

    #[error("서버 에러: {0}")]
    Server(#[from] ServerError),

    #[error("복제 협상 실패 `{statement}`: {source}")]
    Negotiation {
        statement: String,
        #[source]
        source: Box<ReplicationError>,
    },

    #[error("COM_BINLOG_DUMP 전송 실패: {0}")]
    DumpCommand(#[source] Box<ReplicationError>),

    #[error("binlog 스트림 읽기 실패 ({kind}): {source}")]
    StreamRead {
        kind: ReadFailureKind,
        #[source]
        source: Box<ReplicationError>,
    },

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("I/O 에러: {0}")]
    Io(String),

    #[error("사용 가능한 slave ID가 없습니다")]
    PoolExhausted,

    #[error("세션이 이미 닫혔습니다")]
    SessionClosed,

    #[error("세션이 이미 스트리밍 중입니다")]
    AlreadyStreaming,

    #[error("GTID 처리 에러: {0}")]
    Gtid(String),

    #[error("쿼리 실행 에러: {0}")]
    Query(String),
}

impl ReplicationError {
    /// 에러에 담긴 서버 에러 코드 (있는 경우)
    pub fn server_code(&self) -> Option<u16> {
        match self {
            ReplicationError::Server(e) => Some(e.code),
            ReplicationError::Negotiation { source, .. }
            | ReplicationError::DumpCommand(source)
            | ReplicationError::StreamRead { source, .. } => source.server_code(),
            _ => None,
        }
    }

    pub fn read_failure_kind(&self) -> Option<ReadFailureKind> {
        match self {
            ReplicationError::StreamRead { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn stream_read(source: ReplicationError) -> Self {
        ReplicationError::StreamRead {
            kind: ReadFailureKind::classify(&source),
            source: Box::new(source),
        }
    }
}

impl From<io::Error> for ReplicationError {
    fn from(err: io::Error) -> Self {
        ReplicationError::Io(err.to_string())
    }
}

impl From<mysql_async::Error> for ReplicationError {
    fn from(err: mysql_async::Error) -> Self {
        ReplicationError::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
