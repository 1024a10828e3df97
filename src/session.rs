//! binlog 복제 세션
//!
//! slave로 위장해 primary에 접속한 뒤 다음 순서로 진행합니다:
//! 1. 협상: GTID capability, 체크섬 형식, 시작 위치(connect state), strict mode
//! 2. COM_BINLOG_DUMP 전송 (응답 없음)
//! 3. 패킷을 하나씩 읽어 이벤트로 전달. 첫 바이트 0xFE는 스트림 종료
//!
//! 세션 핸들은 복제 가능합니다. 한쪽에서 스트림을 읽는 동안 다른 태스크가
//! `close()`를 호출하면 전송 계층의 abort 토큰이 취소되고, 대기 중인 읽기는
//! CR_SERVER_LOST로 끝나 `ReadFailureKind::ExpectedDisconnect`로 보고됩니다.

use crate::config::{ConnectionParams, SessionOptions};
use crate::error::{ReadFailureKind, ReplicationError, Result};
use crate::events::{ChecksumAlgorithm, RawEvent};
use crate::gtid::{Gtid, GtidList};
use crate::observer::{SessionEvent, SessionObserver, TracingObserver};
use crate::pool::{SlaveId, SlaveIdPool};
use crate::protocol::{command::COM_BINLOG_DUMP, EOF_PACKET_HEADER};
use crate::transport::{MysqlTransport, Transport};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// binlog 파일의 첫 이벤트 위치 (4 bytes 매직 넘버 다음)
pub const BIN_LOG_HEADER_SIZE: u32 = 4;

/// COM_BINLOG_DUMP flags (예약, 항상 0)
pub const BINLOG_DUMP_FLAGS: u16 = 0;

pub const CHECKSUM_STATEMENT: &str = "SET @master_binlog_checksum=@@global.binlog_checksum";

/// 체크섬 SET 직후 실행해 서버가 적용한 알고리즘을 확인
pub const CHECKSUM_QUERY: &str = "SELECT @master_binlog_checksum";

/// 스트리밍 시작 위치
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPosition {
    /// 시퀀스 번호. `{domain}-{server}-{seq}` GTID로 변환되어 connect state로 전달
    Sequence(u32),
    /// connect state로 그대로 전달되는 GTID 목록
    Gtid(GtidList),
    /// 파일명 + 오프셋 (connect state 없이 COM_BINLOG_DUMP에 직접 지정)
    File { filename: String, offset: u32 },
}

impl StreamPosition {
    pub fn connect_state(&self, options: &SessionOptions) -> Option<GtidList> {
        match self {
            StreamPosition::Sequence(seq) => Some(GtidList::from(Gtid::new(
                options.gtid_domain_id,
                options.gtid_server_id,
                u64::from(*seq),
            ))),
            StreamPosition::Gtid(list) => Some(list.clone()),
            StreamPosition::File { .. } => None,
        }
    }

    pub fn dump_offset(&self) -> u32 {
        match self {
            StreamPosition::Sequence(seq) => *seq,
            StreamPosition::Gtid(_) => BIN_LOG_HEADER_SIZE,
            StreamPosition::File { offset, .. } => *offset,
        }
    }

    /// connect state를 쓰는 경우 파일명은 무시되므로 비워 둠
    pub fn dump_filename(&self) -> &str {
        match self {
            StreamPosition::File { filename, .. } => filename,
            _ => "",
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamPosition::Sequence(seq) => write!(f, "seq {}", seq),
            StreamPosition::Gtid(list) => write!(f, "gtid {}", list),
            StreamPosition::File { filename, offset } => write!(f, "{}:{}", filename, offset),
        }
    }
}

/// 협상 단계에서 순서대로 실행할 문장
pub fn negotiation_statements(position: &StreamPosition, options: &SessionOptions) -> Vec<String> {
    let mut statements = vec![
        // MARIA_SLAVE_CAPABILITY_GTID
        "SET @mariadb_slave_capability=4".to_string(),
        CHECKSUM_STATEMENT.to_string(),
    ];
    if let Some(state) = position.connect_state(options) {
        statements.push(format!("SET @slave_connect_state='{}'", state));
    }
    statements.push("SET @slave_gtid_strict_mode=1".to_string());
    statements
}

/// COM_BINLOG_DUMP 페이로드 생성 (명령어 코드 제외)
///
/// | offset | size | field |
/// |---|---|---|
/// | 0 | 4 | binlog position (LE) |
/// | 4 | 2 | flags (LE) |
/// | 6 | 4 | slave server id (LE) |
/// | 10 | n | filename, 길이/종결자 없음 |
pub fn make_binlog_dump_command(pos: u32, flags: u16, slave_id: SlaveId, filename: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4 + 2 + 4 + filename.len());
    buffer.extend_from_slice(&pos.to_le_bytes());
    buffer.extend_from_slice(&flags.to_le_bytes());
    buffer.extend_from_slice(&slave_id.to_le_bytes());
    buffer.extend_from_slice(filename.as_bytes());
    buffer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Streaming,
    Closed,
}

struct SessionInner<T> {
    transport: Arc<Mutex<Option<T>>>,
    abort: CancellationToken,
    slave_id: SlaveId,
    pool: Arc<dyn SlaveIdPool>,
    observer: Arc<dyn SessionObserver>,
    options: SessionOptions,
    state: parking_lot::Mutex<SessionState>,
    checksum: parking_lot::Mutex<Option<ChecksumAlgorithm>>,
    closed: AtomicBool,
}

impl<T> SessionInner<T> {
    fn observe(&self, event: SessionEvent) {
        self.observer.observe(&event);
    }

    /// Closed는 종료 상태이므로 덮어쓰지 않음
    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = next;
        }
    }
}

/// 복제 세션 핸들
pub struct ReplicationSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for ReplicationSession<T> {
    fn clone(&self) -> Self {
        ReplicationSession {
            inner: self.inner.clone(),
        }
    }
}

impl ReplicationSession<MysqlTransport> {
    /// MySQL 서버에 연결하고 풀에서 slave ID를 할당받음
    pub async fn open(
        params: &ConnectionParams,
        pool: Arc<dyn SlaveIdPool>,
        options: SessionOptions,
    ) -> Result<Self> {
        Self::establish(
            MysqlTransport::connect(params),
            pool,
            options,
            Arc::new(TracingObserver),
        )
        .await
    }
}

impl<T: Transport> ReplicationSession<T> {
    /// 전송 계층 연결 future로 세션 생성. 연결 실패 시 slave ID는 반환됨
    pub async fn establish<F>(
        connect: F,
        pool: Arc<dyn SlaveIdPool>,
        options: SessionOptions,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self>
    where
        F: Future<Output = Result<T>>,
    {
        let slave_id = pool.acquire()?;
        let transport = match connect.await {
            Ok(transport) => transport,
            Err(e) => {
                pool.release(slave_id);
                return Err(match e {
                    ReplicationError::Connect(_) => e,
                    other => ReplicationError::Connect(other.to_string()),
                });
            }
        };

        let inner = SessionInner {
            abort: transport.abort_token(),
            transport: Arc::new(Mutex::new(Some(transport))),
            slave_id,
            pool,
            observer,
            options,
            state: parking_lot::Mutex::new(SessionState::Idle),
            checksum: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        inner.observe(SessionEvent::Opened { slave_id });

        Ok(ReplicationSession {
            inner: Arc::new(inner),
        })
    }

    pub fn slave_id(&self) -> SlaveId {
        self.inner.slave_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// 마지막 협상에서 서버가 적용한 체크섬 알고리즘 (협상 전에는 None)
    pub fn checksum(&self) -> Option<ChecksumAlgorithm> {
        *self.inner.checksum.lock()
    }

    /// 협상 후 COM_BINLOG_DUMP를 보내고 이벤트 스트림을 반환
    pub async fn start_streaming(&self, position: StreamPosition) -> Result<BinlogStream<T>> {
        if self.is_closed() {
            return Err(ReplicationError::SessionClosed);
        }

        let mut guard = self
            .inner
            .transport
            .clone()
            .try_lock_owned()
            .map_err(|_| ReplicationError::AlreadyStreaming)?;

        {
            let mut state = self.inner.state.lock();
            if self.is_closed() || guard.is_none() || *state == SessionState::Closed {
                return Err(ReplicationError::SessionClosed);
            }
            *state = SessionState::Negotiating;
        }

        let transport = guard.as_mut().ok_or(ReplicationError::SessionClosed)?;

        let checksum = match self.negotiate(transport, &position).await {
            Ok(checksum) => checksum,
            Err(e) => {
                self.inner.transition(SessionState::Idle);
                return Err(e);
            }
        };

        let payload = make_binlog_dump_command(
            position.dump_offset(),
            BINLOG_DUMP_FLAGS,
            self.inner.slave_id,
            position.dump_filename(),
        );
        if let Err(e) = transport.send_command(COM_BINLOG_DUMP, &payload).await {
            self.inner.transition(SessionState::Closed);
            return Err(ReplicationError::DumpCommand(Box::new(e)));
        }

        self.inner.observe(SessionEvent::DumpRequested {
            slave_id: self.inner.slave_id,
            position: position.to_string(),
        });

        Ok(BinlogStream {
            guard,
            inner: self.inner.clone(),
            checksum,
            events: 0,
            finished: false,
        })
    }

    /// 협상 문장을 순서대로 실행하고 서버가 적용한 체크섬 알고리즘을 반환
    async fn negotiate(
        &self,
        transport: &mut T,
        position: &StreamPosition,
    ) -> Result<ChecksumAlgorithm> {
        let mut checksum = ChecksumAlgorithm::None;

        for statement in negotiation_statements(position, &self.inner.options) {
            if let Err(e) = transport.execute(&statement).await {
                return Err(self.negotiation_failed(statement, e));
            }
            let is_checksum = statement == CHECKSUM_STATEMENT;
            self.inner
                .observe(SessionEvent::StatementAcknowledged { statement });

            if is_checksum {
                checksum = match read_checksum(transport).await {
                    Ok(algorithm) => algorithm,
                    Err(e) => return Err(self.negotiation_failed(CHECKSUM_QUERY.to_string(), e)),
                };
                *self.inner.checksum.lock() = Some(checksum);
                self.inner
                    .observe(SessionEvent::ChecksumNegotiated { algorithm: checksum });
            }
        }
        Ok(checksum)
    }

    fn negotiation_failed(&self, statement: String, err: ReplicationError) -> ReplicationError {
        self.inner.observe(SessionEvent::NegotiationFailed {
            statement: statement.clone(),
            message: err.to_string(),
        });
        ReplicationError::Negotiation {
            statement,
            source: Box::new(err),
        }
    }

    /// 읽기 루프를 별도 태스크에서 실행. 이벤트는 채널로, 최종 결과는 JoinHandle로 전달
    pub fn spawn(
        &self,
        position: StreamPosition,
    ) -> (mpsc::Receiver<RawEvent>, JoinHandle<Result<u64>>) {
        let (tx, rx) = mpsc::channel(self.inner.options.event_buffer.max(1));
        let session = self.clone();

        let handle = tokio::spawn(async move {
            let mut stream = session.start_streaming(position).await?;
            while let Some(event) = stream.next_event().await? {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping binlog stream");
                    break;
                }
            }
            Ok(stream.events_received())
        });

        (rx, handle)
    }

    /// 세션 종료. 여러 번 호출해도 안전하며 읽기가 진행 중이어도 호출 가능
    ///
    /// 전송 계층을 아무도 쓰지 않으면 바로 정상 종료(COM_QUIT)합니다.
    /// 정상 종료가 `close_timeout` 안에 끝나지 않으면 중단하고 소켓을 버립니다.
    /// 스트림이 잡고 있으면 abort 토큰을 취소해 대기 중인 읽기를 풀고,
    /// 스트림이 놓을 때까지 백그라운드에서 기다렸다가 닫습니다.
    /// slave ID는 어느 경우든 즉시 풀에 반환됩니다.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slave_id = self.inner.slave_id;
        self.inner.transition(SessionState::Closed);

        let inner = self.inner.clone();
        match self.inner.transport.clone().try_lock_owned() {
            Ok(guard) => {
                let mut closing = tokio::spawn(close_transport(guard, inner));
                let timeout = self.inner.options.close_timeout();
                match tokio::time::timeout(timeout, &mut closing).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.inner.observe(SessionEvent::CloseFailed {
                        message: e.to_string(),
                    }),
                    Err(_) => {
                        // 태스크를 중단하면 전송 계층이 drop되어 소켓이 닫힘
                        closing.abort();
                        self.inner.observe(SessionEvent::CloseFailed {
                            message: format!("orderly close timed out after {:?}", timeout),
                        });
                    }
                }
                self.inner.abort.cancel();
            }
            Err(_) => {
                self.inner.observe(SessionEvent::ForceClosing { slave_id });
                self.inner.abort.cancel();

                let transport = self.inner.transport.clone();
                tokio::spawn(async move {
                    let guard = transport.lock_owned().await;
                    close_transport(guard, inner).await;
                });
            }
        }

        self.inner.pool.release(slave_id);
        self.inner.observe(SessionEvent::Closed { slave_id });
    }
}

async fn read_checksum<T: Transport>(transport: &mut T) -> Result<ChecksumAlgorithm> {
    let value = transport.select_value(CHECKSUM_QUERY).await?;
    ChecksumAlgorithm::parse(value.as_deref().unwrap_or_default())
}

async fn close_transport<T: Transport>(mut guard: OwnedMutexGuard<Option<T>>, inner: Arc<SessionInner<T>>) {
    if let Some(mut transport) = guard.take() {
        if let Err(e) = transport.close().await {
            inner.observe(SessionEvent::CloseFailed {
                message: e.to_string(),
            });
        }
    }
}

/// 지연 평가되는 이벤트 스트림. 패킷은 호출할 때마다 하나씩 읽음
pub struct BinlogStream<T: Transport> {
    guard: OwnedMutexGuard<Option<T>>,
    inner: Arc<SessionInner<T>>,
    checksum: ChecksumAlgorithm,
    events: u64,
    finished: bool,
}

impl<T: Transport> BinlogStream<T> {
    /// 다음 이벤트. `Ok(None)`은 서버가 보낸 EOF(정상 종료)이며,
    /// 종료 결과를 한 번 반환한 뒤에는 계속 `Ok(None)`
    pub async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        if self.finished {
            return Ok(None);
        }

        let read = match self.guard.as_mut() {
            Some(transport) => transport.read_packet().await,
            None => Err(ReplicationError::SessionClosed),
        };
        let packet = match read {
            Ok(packet) => packet,
            Err(e) => return Err(self.fail(e)),
        };

        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Negotiating {
                *state = SessionState::Streaming;
            }
        }

        match packet.first() {
            None => Err(self.fail(ReplicationError::Protocol(
                "Received empty packet in binlog stream".to_string(),
            ))),
            Some(&EOF_PACKET_HEADER) => {
                self.finished = true;
                self.inner.transition(SessionState::Closed);
                self.inner.observe(SessionEvent::EndOfStream {
                    events: self.events,
                });
                Ok(None)
            }
            Some(_) => {
                self.events += 1;
                Ok(Some(RawEvent::new(packet.slice(1..))))
            }
        }
    }

    pub fn events_received(&self) -> u64 {
        self.events
    }

    /// 이 스트림의 이벤트 끝에 붙는 체크섬 형식
    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    fn fail(&mut self, err: ReplicationError) -> ReplicationError {
        self.finished = true;
        self.inner.transition(SessionState::Closed);

        let message = err.to_string();
        let event = match ReadFailureKind::classify(&err) {
            ReadFailureKind::ExpectedDisconnect => SessionEvent::Disconnected {
                events: self.events,
                message,
            },
            ReadFailureKind::Fatal => SessionEvent::ReadFailed {
                events: self.events,
                message,
            },
        };
        self.inner.observe(event);

        ReplicationError::stream_read(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServerError, CR_SERVER_LOST};
    use crate::mock::{CountingPool, MockTransport, RecordingObserver, Reply};
    use std::time::Duration;
    use tracing::Level;

    struct Fixture {
        session: ReplicationSession<MockTransport>,
        transport: MockTransport,
        pool: Arc<CountingPool>,
        observer: Arc<RecordingObserver>,
    }

    async fn fixture(replies: Vec<Reply>) -> Fixture {
        fixture_with(MockTransport::new(replies)).await
    }

    async fn fixture_with(transport: MockTransport) -> Fixture {
        let pool = Arc::new(CountingPool::new(30));
        let observer = Arc::new(RecordingObserver::default());
        let handle = transport.clone();
        let session = ReplicationSession::establish(
            async move { Ok(transport) },
            pool.clone(),
            SessionOptions::default(),
            observer.clone(),
        )
        .await
        .unwrap();

        Fixture {
            session,
            transport: handle,
            pool,
            observer,
        }
    }

    #[test]
    fn test_make_binlog_dump_command_layout() {
        let cmd = make_binlog_dump_command(245, 0x0102, 30, "mysql-bin.000001");

        assert_eq!(cmd.len(), 10 + "mysql-bin.000001".len());
        assert_eq!(&cmd[0..4], &245u32.to_le_bytes());
        assert_eq!(&cmd[4..6], &[0x02, 0x01]);
        assert_eq!(&cmd[6..10], &30u32.to_le_bytes());
        assert_eq!(&cmd[10..], b"mysql-bin.000001");
    }

    #[test]
    fn test_dump_command_position_round_trips() {
        for pos in [0u32, 4, 245, 0x01020304, u32::MAX] {
            let cmd = make_binlog_dump_command(pos, 0, 1, "");
            assert_eq!(u32::from_le_bytes([cmd[0], cmd[1], cmd[2], cmd[3]]), pos);
            assert_eq!(cmd.len(), 10);
        }
    }

    #[test]
    fn test_negotiation_statements_sequence() {
        let statements =
            negotiation_statements(&StreamPosition::Sequence(245), &SessionOptions::default());
        assert_eq!(
            statements,
            vec![
                "SET @mariadb_slave_capability=4",
                "SET @master_binlog_checksum=@@global.binlog_checksum",
                "SET @slave_connect_state='1-1-245'",
                "SET @slave_gtid_strict_mode=1",
            ]
        );
    }

    #[test]
    fn test_negotiation_statements_file_skips_connect_state() {
        let position = StreamPosition::File {
            filename: "mysql-bin.000003".to_string(),
            offset: 4,
        };
        let statements = negotiation_statements(&position, &SessionOptions::default());
        assert_eq!(statements.len(), 3);
        assert!(statements.iter().all(|s| !s.contains("slave_connect_state")));
    }

    #[test]
    fn test_connect_state_uses_configured_domain() {
        let options = SessionOptions {
            gtid_domain_id: 0,
            gtid_server_id: 7,
            ..Default::default()
        };
        let state = StreamPosition::Sequence(12).connect_state(&options).unwrap();
        assert_eq!(state.to_string(), "0-7-12");
    }

    #[tokio::test]
    async fn test_streams_events_until_eof() {
        let f = fixture(vec![
            Reply::Packet(vec![0x01, 0xB1]),
            Reply::Packet(vec![0x00, 0xB2, 0xB3]),
            Reply::Packet(vec![0xFE]),
            Reply::Packet(vec![0x00, 0xFF]),
        ])
        .await;
        assert_eq!(f.session.state(), SessionState::Idle);

        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(245))
            .await
            .unwrap();
        assert_eq!(f.session.state(), SessionState::Negotiating);

        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.as_bytes(), &[0xB1]);
        assert_eq!(f.session.state(), SessionState::Streaming);

        let second = stream.next_event().await.unwrap().unwrap();
        assert_eq!(second.as_bytes(), &[0xB2, 0xB3]);

        assert!(stream.next_event().await.unwrap().is_none());
        assert!(stream.next_event().await.unwrap().is_none());
        assert_eq!(stream.events_received(), 2);
        assert_eq!(f.transport.reads(), 3);
        assert_eq!(f.session.state(), SessionState::Closed);
        assert!(f
            .observer
            .events()
            .contains(&SessionEvent::EndOfStream { events: 2 }));
    }

    #[tokio::test]
    async fn test_sends_statements_then_dump_command() {
        let f = fixture(vec![Reply::Packet(vec![0xFE])]).await;
        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(245))
            .await
            .unwrap();
        assert!(stream.next_event().await.unwrap().is_none());

        assert_eq!(
            f.transport.statements(),
            negotiation_statements(&StreamPosition::Sequence(245), &SessionOptions::default())
        );
        let commands = f.transport.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, COM_BINLOG_DUMP);
        assert_eq!(
            commands[0].1,
            make_binlog_dump_command(245, 0, f.session.slave_id(), "")
        );
    }

    #[tokio::test]
    async fn test_checksum_read_back_after_checksum_statement() {
        let f = fixture(vec![Reply::Packet(vec![0xFE])]).await;
        assert_eq!(f.session.checksum(), None);

        let stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();

        assert_eq!(stream.checksum(), ChecksumAlgorithm::Crc32);
        assert_eq!(f.session.checksum(), Some(ChecksumAlgorithm::Crc32));
        assert_eq!(f.transport.queries(), vec![CHECKSUM_QUERY.to_string()]);
        assert!(f.observer.events().contains(&SessionEvent::ChecksumNegotiated {
            algorithm: ChecksumAlgorithm::Crc32
        }));
    }

    #[tokio::test]
    async fn test_null_checksum_means_none() {
        let f = fixture_with(MockTransport::new(vec![]).checksum(None)).await;
        let stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();
        assert_eq!(stream.checksum(), ChecksumAlgorithm::None);
    }

    #[tokio::test]
    async fn test_checksum_query_failure_is_negotiation_error() {
        let f = fixture_with(MockTransport::new(vec![]).reject(CHECKSUM_QUERY)).await;

        let err = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .err()
            .unwrap();
        match err {
            ReplicationError::Negotiation { ref statement, .. } => {
                assert_eq!(statement, CHECKSUM_QUERY)
            }
            other => panic!("unexpected error: {}", other),
        }
        // capability, checksum SET 이후 중단
        assert_eq!(f.transport.statements().len(), 2);
        assert!(f.transport.commands().is_empty());
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stalled_orderly_close() {
        let pool = Arc::new(CountingPool::new(30));
        let transport = MockTransport::new(vec![]).stall_close();
        let handle = transport.clone();
        let options = SessionOptions {
            close_timeout_ms: 20,
            ..Default::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let session = ReplicationSession::establish(
            async move { Ok(transport) },
            pool.clone(),
            options,
            observer.clone(),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.close())
            .await
            .expect("close must not wait for a stalled transport");

        assert_eq!(handle.closes(), 1);
        assert!(handle.abort_token().is_cancelled());
        assert_eq!(pool.releases(), 1);
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::CloseFailed { .. })));
    }

    #[tokio::test]
    async fn test_file_position_sends_filename() {
        let f = fixture(vec![Reply::Packet(vec![0xFE])]).await;
        let position = StreamPosition::File {
            filename: "mysql-bin.000003".to_string(),
            offset: 120,
        };
        f.session.start_streaming(position).await.unwrap();

        assert_eq!(f.transport.statements().len(), 3);
        let commands = f.transport.commands();
        assert_eq!(&commands[0].1[0..4], &120u32.to_le_bytes());
        assert_eq!(&commands[0].1[10..], b"mysql-bin.000003");
    }

    #[tokio::test]
    async fn test_rejected_statement_aborts_before_dump() {
        let expected =
            negotiation_statements(&StreamPosition::Sequence(9), &SessionOptions::default());

        for (index, rejected) in expected.iter().enumerate() {
            let f = fixture_with(MockTransport::new(vec![]).reject(rejected)).await;

            let err = f
                .session
                .start_streaming(StreamPosition::Sequence(9))
                .await
                .err()
                .unwrap();
            match err {
                ReplicationError::Negotiation { ref statement, .. } => {
                    assert_eq!(statement, rejected)
                }
                other => panic!("unexpected error: {}", other),
            }

            assert_eq!(f.transport.statements(), expected[..=index].to_vec());
            assert!(f.transport.commands().is_empty());
            assert_eq!(f.session.state(), SessionState::Idle);
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let f = fixture(vec![Reply::Packet(vec![0x00, 0x01]), Reply::Block]).await;
        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();
        stream.next_event().await.unwrap().unwrap();

        let reader = tokio::spawn(async move { stream.next_event().await });
        tokio::task::yield_now().await;

        f.session.close().await;
        let err = reader.await.unwrap().unwrap_err();

        assert_eq!(
            err.read_failure_kind(),
            Some(ReadFailureKind::ExpectedDisconnect)
        );
        assert_eq!(err.server_code(), Some(CR_SERVER_LOST));
        assert_eq!(f.pool.releases(), 1);

        let disconnected = f
            .observer
            .events()
            .into_iter()
            .find(|e| matches!(e, SessionEvent::Disconnected { .. }))
            .unwrap();
        assert_eq!(disconnected.level(), Level::INFO);

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.transport.closes() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_other_read_error_is_fatal() {
        let f = fixture(vec![Reply::Error(ServerError::new(
            1236,
            "HY000",
            "Could not find GTID state requested by slave",
        ))])
        .await;
        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();

        let err = stream.next_event().await.unwrap_err();
        assert_eq!(err.read_failure_kind(), Some(ReadFailureKind::Fatal));
        assert_eq!(err.server_code(), Some(1236));
        assert!(stream.next_event().await.unwrap().is_none());
        assert!(f
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ReadFailed { .. }) && e.level() == Level::ERROR));
    }

    #[tokio::test]
    async fn test_empty_packet_is_fatal() {
        let f = fixture(vec![Reply::Packet(vec![])]).await;
        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();

        let err = stream.next_event().await.unwrap_err();
        assert_eq!(err.read_failure_kind(), Some(ReadFailureKind::Fatal));
    }

    #[tokio::test]
    async fn test_close_twice_releases_once() {
        let f = fixture(vec![]).await;
        let slave_id = f.session.slave_id();

        f.session.close().await;
        f.session.close().await;

        assert!(f.session.is_closed());
        assert_eq!(f.session.state(), SessionState::Closed);
        assert_eq!(f.pool.releases(), 1);
        assert_eq!(f.pool.released(), vec![slave_id]);
        assert_eq!(f.transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_start_after_close_fails() {
        let f = fixture(vec![Reply::Block]).await;
        f.session.close().await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            f.session.start_streaming(StreamPosition::Sequence(4)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ReplicationError::SessionClosed)));
        assert!(f.transport.statements().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_eof_fails() {
        let f = fixture(vec![Reply::Packet(vec![0xFE])]).await;
        let mut stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();
        assert!(stream.next_event().await.unwrap().is_none());
        drop(stream);

        assert!(matches!(
            f.session.start_streaming(StreamPosition::Sequence(4)).await,
            Err(ReplicationError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_second_stream_rejected() {
        let f = fixture(vec![Reply::Block]).await;
        let _stream = f
            .session
            .start_streaming(StreamPosition::Sequence(4))
            .await
            .unwrap();

        assert!(matches!(
            f.session.start_streaming(StreamPosition::Sequence(4)).await,
            Err(ReplicationError::AlreadyStreaming)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slave_id() {
        let pool = Arc::new(CountingPool::new(30));
        let result = ReplicationSession::<MockTransport>::establish(
            async { Err(ReplicationError::Io("connection refused".to_string())) },
            pool.clone(),
            SessionOptions::default(),
            Arc::new(RecordingObserver::default()),
        )
        .await;

        assert!(matches!(result, Err(ReplicationError::Connect(_))));
        assert_eq!(pool.acquires(), 1);
        assert_eq!(pool.releases(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_before_connecting() {
        use crate::config::SlaveIdRange;
        use crate::pool::RangeSlaveIdPool;

        let pool = Arc::new(RangeSlaveIdPool::new(SlaveIdRange { base: 30, count: 0 }));
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();

        let result = ReplicationSession::establish(
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(MockTransport::new(vec![]))
            },
            pool,
            SessionOptions::default(),
            Arc::new(RecordingObserver::default()),
        )
        .await;

        assert!(matches!(result, Err(ReplicationError::PoolExhausted)));
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawn_delivers_events_in_order() {
        let f = fixture(vec![
            Reply::Packet(vec![0x00, 1]),
            Reply::Packet(vec![0x00, 2]),
            Reply::Packet(vec![0x00, 3]),
            Reply::Packet(vec![0xFE]),
        ])
        .await;

        let (mut rx, handle) = f.session.spawn(StreamPosition::Sequence(4));
        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event.as_bytes()[0]);
        }

        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_spawn_reports_disconnect_after_close() {
        let f = fixture(vec![Reply::Block]).await;
        let (_rx, handle) = f.session.spawn(StreamPosition::Sequence(4));
        tokio::task::yield_now().await;

        f.session.close().await;
        let err = handle.await.unwrap().unwrap_err();
        // 협상 도중 닫히면 협상 에러, 읽기 도중이면 스트림 에러
        assert_eq!(err.server_code(), Some(CR_SERVER_LOST));
    }
}
