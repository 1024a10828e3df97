//! 세션 수명 주기 이벤트 보고
//!
//! 세션은 진단 정보를 직접 출력하지 않고 `SessionObserver`로 넘깁니다.
//! 기본 구현 `TracingObserver`는 각 이벤트를 해당 레벨의 tracing 로그로 남깁니다.

use crate::events::ChecksumAlgorithm;
use crate::pool::SlaveId;
use tracing::{debug, error, info, warn, Level};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened { slave_id: SlaveId },
    StatementAcknowledged { statement: String },
    NegotiationFailed { statement: String, message: String },
    ChecksumNegotiated { algorithm: ChecksumAlgorithm },
    DumpRequested { slave_id: SlaveId, position: String },
    EndOfStream { events: u64 },
    /// 외부 종료와 경합한 읽기 실패 (예상된 종료)
    Disconnected { events: u64, message: String },
    ReadFailed { events: u64, message: String },
    ForceClosing { slave_id: SlaveId },
    CloseFailed { message: String },
    Closed { slave_id: SlaveId },
}

impl SessionEvent {
    pub fn level(&self) -> Level {
        match self {
            SessionEvent::StatementAcknowledged { .. } | SessionEvent::ForceClosing { .. } => {
                Level::DEBUG
            }
            SessionEvent::Opened { .. }
            | SessionEvent::ChecksumNegotiated { .. }
            | SessionEvent::DumpRequested { .. }
            | SessionEvent::EndOfStream { .. }
            | SessionEvent::Disconnected { .. }
            | SessionEvent::Closed { .. } => Level::INFO,
            SessionEvent::CloseFailed { .. } => Level::WARN,
            SessionEvent::NegotiationFailed { .. } | SessionEvent::ReadFailed { .. } => {
                Level::ERROR
            }
        }
    }
}

pub trait SessionObserver: Send + Sync {
    fn observe(&self, event: &SessionEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn observe(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Opened { slave_id } => {
                info!("Opened replication session as slave {}", slave_id)
            }
            SessionEvent::StatementAcknowledged { statement } => {
                debug!("Negotiation statement acknowledged: {}", statement)
            }
            SessionEvent::NegotiationFailed { statement, message } => {
                error!("Failed to execute {}: {}", statement, message)
            }
            SessionEvent::ChecksumNegotiated { algorithm } => {
                info!("Binlog checksum algorithm: {:?}", algorithm)
            }
            SessionEvent::DumpRequested { slave_id, position } => {
                info!("Sent COM_BINLOG_DUMP: slave_id={}, position={}", slave_id, position)
            }
            SessionEvent::EndOfStream { events } => {
                info!("Received EOF packet in binlog dump after {} events", events)
            }
            SessionEvent::Disconnected { events, message } => info!(
                "Connection closed during binlog stream after {} events (possibly intentional): {}",
                events, message
            ),
            SessionEvent::ReadFailed { events, message } => error!(
                "Read error while streaming binlog events after {} events: {}",
                events, message
            ),
            SessionEvent::ForceClosing { slave_id } => {
                debug!("Force-closing slave {} socket to unblock reads", slave_id)
            }
            SessionEvent::CloseFailed { message } => {
                warn!("Failed to close slave connection cleanly: {}", message)
            }
            SessionEvent::Closed { slave_id } => {
                info!("Closed slave connection, recycling slave id {}", slave_id)
            }
        }
    }
}
