//! 테스트용 전송 계층, 풀, observer

use crate::error::{ReplicationError, Result, ServerError};
use crate::observer::{SessionEvent, SessionObserver};
use crate::pool::{SlaveId, SlaveIdPool};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `read_packet` 호출마다 순서대로 돌려줄 응답
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Packet(Vec<u8>),
    Error(ServerError),
    /// abort 토큰이 취소될 때까지 대기 후 CR_SERVER_LOST
    Block,
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<Reply>,
    rejected: Option<String>,
    checksum: Option<String>,
    stall_close: bool,
    statements: Vec<String>,
    queries: Vec<String>,
    commands: Vec<(u8, Vec<u8>)>,
    reads: usize,
    closes: usize,
}

/// 스크립트 기반 전송 계층. clone은 같은 상태를 공유
#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    abort: CancellationToken,
}

impl MockTransport {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                replies: replies.into(),
                checksum: Some("CRC32".to_string()),
                ..Default::default()
            })),
            abort: CancellationToken::new(),
        }
    }

    /// 해당 문장을 서버가 거부하도록 설정
    pub(crate) fn reject(self, statement: &str) -> Self {
        self.state.lock().rejected = Some(statement.to_string());
        self
    }

    /// `SELECT @master_binlog_checksum` 응답 값 (None은 NULL)
    pub(crate) fn checksum(self, value: Option<&str>) -> Self {
        self.state.lock().checksum = value.map(str::to_string);
        self
    }

    /// `close()`가 끝나지 않도록 설정
    pub(crate) fn stall_close(self) -> Self {
        self.state.lock().stall_close = true;
        self
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub(crate) fn commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().commands.clone()
    }

    pub(crate) fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().closes
    }

    fn lost() -> ReplicationError {
        ServerError::lost_connection("mock transport aborted").into()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(Self::lost());
        }
        let mut state = self.state.lock();
        state.statements.push(statement.to_string());
        if state.rejected.as_deref() == Some(statement) {
            return Err(ServerError::new(1193, "HY000", "Unknown system variable").into());
        }
        Ok(())
    }

    async fn select_value(&mut self, query: &str) -> Result<Option<String>> {
        if self.abort.is_cancelled() {
            return Err(Self::lost());
        }
        let mut state = self.state.lock();
        state.queries.push(query.to_string());
        if state.rejected.as_deref() == Some(query) {
            return Err(ServerError::new(1193, "HY000", "Unknown system variable").into());
        }
        Ok(state.checksum.clone())
    }

    async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(Self::lost());
        }
        self.state.lock().commands.push((command, payload.to_vec()));
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Bytes> {
        if self.abort.is_cancelled() {
            return Err(Self::lost());
        }

        let reply = {
            let mut state = self.state.lock();
            state.reads += 1;
            state.replies.pop_front().unwrap_or(Reply::Block)
        };

        match reply {
            Reply::Packet(data) => Ok(Bytes::from(data)),
            Reply::Error(err) => Err(err.into()),
            Reply::Block => {
                self.abort.cancelled().await;
                Err(Self::lost())
            }
        }
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    async fn close(&mut self) -> Result<()> {
        let stall = {
            let mut state = self.state.lock();
            state.closes += 1;
            state.stall_close
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// acquire/release 호출을 기록하는 풀
pub(crate) struct CountingPool {
    next: SlaveId,
    acquired: Mutex<Vec<SlaveId>>,
    released: Mutex<Vec<SlaveId>>,
}

impl CountingPool {
    pub(crate) fn new(first: SlaveId) -> Self {
        CountingPool {
            next: first,
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn acquires(&self) -> usize {
        self.acquired.lock().len()
    }

    pub(crate) fn releases(&self) -> usize {
        self.released.lock().len()
    }

    pub(crate) fn released(&self) -> Vec<SlaveId> {
        self.released.lock().clone()
    }
}

impl SlaveIdPool for CountingPool {
    fn acquire(&self) -> Result<SlaveId> {
        let mut acquired = self.acquired.lock();
        let id = self.next + acquired.len() as SlaveId;
        acquired.push(id);
        Ok(id)
    }

    fn release(&self, id: SlaveId) {
        self.released.lock().push(id);
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn observe(&self, event: &SessionEvent) {
        self.events.lock().push(event.clone());
    }
}
