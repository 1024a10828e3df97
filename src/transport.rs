//! 복제 세션이 사용하는 전송 계층
//!
//! `Transport`는 세션이 필요로 하는 최소 기능만 정의합니다.
//! `MysqlTransport`는 TCP 또는 unix socket 위의 MySQL 프로토콜 구현입니다.
//!
//! 동시성 계약: `abort_token()`으로 받은 토큰은 다른 태스크에서 언제든
//! 취소할 수 있고, 취소되면 진행 중이거나 이후의 모든 전송 작업은
//! CR_SERVER_LOST(2013) 에러로 즉시 실패해야 합니다.

use crate::auth::{self, NATIVE_PASSWORD_PLUGIN};
use crate::config::ConnectionParams;
use crate::error::{ReplicationError, Result, ServerError};
use crate::protocol::{
    self, command, AuthSwitchRequest, ErrorPacket, GreetingPacket, PacketChannel,
    EOF_PACKET_HEADER,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Transport: Send + 'static {
    /// 관리용 문장 실행 후 응답(OK 또는 결과셋)까지 대기
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// 첫 행의 첫 컬럼 조회. 결과셋이 없거나 값이 NULL이면 None
    async fn select_value(&mut self, query: &str) -> Result<Option<String>>;

    /// 명령어 코드를 붙여 바이너리 명령 전송 (응답은 기다리지 않음)
    async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()>;

    /// 다음 패킷 본문 읽기 (블로킹)
    async fn read_packet(&mut self) -> Result<Bytes>;

    /// 강제 종료용 토큰. 취소하면 대기 중인 읽기가 풀림
    fn abort_token(&self) -> CancellationToken;

    /// 정상 종료 (여러 번 호출해도 안전)
    async fn close(&mut self) -> Result<()>;
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// MySQL 서버 연결
pub struct MysqlTransport {
    channel: PacketChannel<Box<dyn AsyncStream>>,
    abort: CancellationToken,
    greeting: GreetingPacket,
    closed: bool,
}

impl MysqlTransport {
    /// 소켓 연결 후 핸드셰이크 및 인증까지 수행
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let stream = open_stream(params).await?;
        let mut channel = PacketChannel::new(stream);

        let greeting_packet = channel.read_packet().await.map_err(connect_error)?;
        let greeting = GreetingPacket::parse(&greeting_packet).map_err(connect_error)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let response = auth::create_handshake_response(params, &greeting.scramble)?;
        channel.write_packet(&response).await.map_err(connect_error)?;

        let mut auth_result = channel.read_packet().await.map_err(connect_error)?;
        if auth_result.first() == Some(&EOF_PACKET_HEADER) {
            let switch = AuthSwitchRequest::parse(&auth_result).map_err(connect_error)?;
            if switch.plugin != NATIVE_PASSWORD_PLUGIN {
                return Err(ReplicationError::Connect(format!(
                    "Unsupported auth plugin requested by server: {}",
                    switch.plugin
                )));
            }
            debug!("Server requested auth switch to {}", switch.plugin);
            let response = auth::create_auth_response(&params.password, &switch.scramble);
            channel.write_packet(&response).await.map_err(connect_error)?;
            auth_result = channel.read_packet().await.map_err(connect_error)?;
        }

        if protocol::is_error_packet(&auth_result) {
            let err = ErrorPacket::parse(&auth_result)?;
            return Err(ReplicationError::Connect(format!(
                "Authentication failed: {}",
                err
            )));
        }
        if !protocol::is_ok_packet(&auth_result) {
            return Err(ReplicationError::Connect(format!(
                "Unexpected authentication response: 0x{:02x}",
                auth_result.first().copied().unwrap_or_default()
            )));
        }

        info!("Authentication successful as {}", params.username);

        Ok(MysqlTransport {
            channel,
            abort: CancellationToken::new(),
            greeting,
            closed: false,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.greeting.server_version
    }

    pub fn thread_id(&self) -> u32 {
        self.greeting.thread_id
    }

    /// COM_QUERY 응답 소비: OK, 에러, 또는 결과셋 전체.
    /// 결과셋이면 첫 행 패킷을 돌려줌
    async fn read_query_response(
        channel: &mut PacketChannel<Box<dyn AsyncStream>>,
    ) -> Result<Option<Bytes>> {
        let first = channel.read_packet().await?;
        if protocol::is_error_packet(&first) {
            return Err(ErrorPacket::parse(&first)?.into());
        }
        if protocol::is_ok_packet(&first) {
            return Ok(None);
        }

        let columns = protocol::read_lenenc_int(&mut Cursor::new(&first[..]))?;
        debug!("Draining result set with {} columns", columns);

        // 컬럼 정의 .. EOF
        loop {
            let packet = channel.read_packet().await?;
            if protocol::is_error_packet(&packet) {
                return Err(ErrorPacket::parse(&packet)?.into());
            }
            if protocol::is_eof_packet(&packet) {
                break;
            }
        }

        // 행 .. EOF
        let mut first_row = None;
        loop {
            let packet = channel.read_packet().await?;
            if protocol::is_error_packet(&packet) {
                return Err(ErrorPacket::parse(&packet)?.into());
            }
            if protocol::is_eof_packet(&packet) {
                break;
            }
            if first_row.is_none() {
                first_row = Some(packet);
            }
        }
        Ok(first_row)
    }
}

#[async_trait]
impl Transport for MysqlTransport {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let abort = self.abort.clone();
        let channel = &mut self.channel;
        guarded(&abort, async move {
            channel
                .write_command(command::COM_QUERY, statement.as_bytes())
                .await
                .map_err(lost_on_io)?;
            Self::read_query_response(channel).await.map_err(lost_on_io)
        })
        .await
        .map(|_| ())
    }

    async fn select_value(&mut self, query: &str) -> Result<Option<String>> {
        let abort = self.abort.clone();
        let channel = &mut self.channel;
        let row = guarded(&abort, async move {
            channel
                .write_command(command::COM_QUERY, query.as_bytes())
                .await
                .map_err(lost_on_io)?;
            Self::read_query_response(channel).await.map_err(lost_on_io)
        })
        .await?;

        match row {
            Some(row) => protocol::read_lenenc_string(&row),
            None => Ok(None),
        }
    }

    async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        let abort = self.abort.clone();
        let channel = &mut self.channel;
        guarded(&abort, async move {
            channel
                .write_command(command, payload)
                .await
                .map_err(lost_on_io)
        })
        .await
    }

    async fn read_packet(&mut self) -> Result<Bytes> {
        let abort = self.abort.clone();
        let channel = &mut self.channel;
        let packet = guarded(&abort, async move { channel.read_packet().await.map_err(lost_on_io) })
            .await?;

        if protocol::is_error_packet(&packet) {
            return Err(ErrorPacket::parse(&packet)?.into());
        }
        Ok(packet)
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // 강제 종료된 소켓에는 COM_QUIT을 보내지 않음
        if !self.abort.is_cancelled() {
            if let Err(e) = self.channel.write_command(command::COM_QUIT, &[]).await {
                warn!("Failed to send COM_QUIT: {}", e);
            }
        }
        self.channel.shutdown().await
    }
}

async fn open_stream(params: &ConnectionParams) -> Result<Box<dyn AsyncStream>> {
    if let Some(ref path) = params.unix_socket {
        return open_unix_stream(path).await;
    }

    let addr = params.address();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ReplicationError::Connect(format!("Failed to connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    debug!("Connected to MySQL at {}", addr);
    Ok(Box::new(stream))
}

#[cfg(unix)]
async fn open_unix_stream(path: &str) -> Result<Box<dyn AsyncStream>> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| ReplicationError::Connect(format!("Failed to connect to {}: {}", path, e)))?;
    debug!("Connected to MySQL at {}", path);
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn open_unix_stream(path: &str) -> Result<Box<dyn AsyncStream>> {
    Err(ReplicationError::Config(format!(
        "Unix sockets are not supported on this platform: {}",
        path
    )))
}

/// 취소 토큰과 경주시켜 강제 종료 시 2013 에러로 끝나게 함
async fn guarded<F, T>(abort: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(ServerError::lost_connection("connection force-closed").into()),
        result = fut => result,
    }
}

/// 소켓 I/O 실패는 드라이버와 동일하게 CR_SERVER_LOST로 보고
fn lost_on_io(err: ReplicationError) -> ReplicationError {
    match err {
        ReplicationError::Io(detail) => ServerError::lost_connection(detail).into(),
        other => other,
    }
}

fn connect_error(err: ReplicationError) -> ReplicationError {
    match err {
        ReplicationError::Connect(_) => err,
        other => ReplicationError::Connect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CR_SERVER_LOST;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut params = ConnectionParams::new("127.0.0.1", "root");
        params.port = port;

        match MysqlTransport::connect(&params).await {
            Err(ReplicationError::Connect(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_guarded_cancelled() {
        let abort = CancellationToken::new();
        abort.cancel();
        let result: Result<()> = guarded(&abort, std::future::pending()).await;
        assert_eq!(result.unwrap_err().server_code(), Some(CR_SERVER_LOST));
    }

    #[test]
    fn test_lost_on_io() {
        let err = lost_on_io(ReplicationError::Io("connection reset".to_string()));
        assert_eq!(err.server_code(), Some(CR_SERVER_LOST));

        let err = lost_on_io(ReplicationError::Protocol("bad".to_string()));
        assert_eq!(err.server_code(), None);
    }
}
