//! MySQL/MariaDB binlog slave 세션
//!
//! primary에 replication slave로 접속해 binlog 이벤트를 스트리밍합니다.
//! 주요 기능:
//! - slave capability / 체크섬 / GTID 시작 위치 협상
//! - COM_BINLOG_DUMP 전송 및 이벤트 패킷 읽기
//! - 다른 태스크에서의 강제 종료 (대기 중인 읽기 해제)
//! - slave ID 풀 관리

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod observer;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{ConnectionParams, SessionOptions};
pub use error::{ReadFailureKind, ReplicationError, Result};
pub use events::{ChecksumAlgorithm, RawEvent};
pub use gtid::{Gtid, GtidList};
pub use observer::{SessionEvent, SessionObserver, TracingObserver};
pub use pool::{RangeSlaveIdPool, SlaveId, SlaveIdPool};
pub use session::{BinlogStream, ReplicationSession, SessionState, StreamPosition};
pub use transport::{MysqlTransport, Transport};
