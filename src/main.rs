/// binlog slave 실행 예제
///
/// 환경 변수로 연결 정보를 받아 slave로 접속하고, 받은 이벤트의 헤더와
/// 본문 길이(체크섬 제외)를 한 줄에 하나씩 JSON으로 출력합니다.
/// Ctrl-C로 세션을 닫습니다.
use binlog_slave::config::{AppConfig, StartFrom};
use binlog_slave::connection::MySqlConnection;
use binlog_slave::events::ChecksumAlgorithm;
use binlog_slave::pool::RangeSlaveIdPool;
use binlog_slave::session::{ReplicationSession, StreamPosition};
use binlog_slave::ReadFailureKind;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;

    info!(
        "Connecting to {}:{}",
        config.connection.host, config.connection.port
    );

    // 서버 설정 확인
    let mut admin = MySqlConnection::connect(&config.connection).await?;
    let status = admin.status().await?;
    info!(
        "Primary server_id={}, binlog_format={:?}, checksum={:?}",
        status.server_id, status.binlog_format, status.checksum
    );

    let position = match config.start {
        StartFrom::Position(position) => position,
        StartFrom::Current => {
            let current = admin
                .get_gtid_current_pos()
                .await?
                .ok_or("server has no @@gtid_current_pos; set BINLOG_FILE/BINLOG_START_POS")?;
            StreamPosition::Gtid(current)
        }
    };
    admin.close().await?;

    let pool = Arc::new(RangeSlaveIdPool::new(config.slave_ids));
    let session = ReplicationSession::open(&config.connection, pool, config.session).await?;
    if session.slave_id() == status.server_id {
        warn!(
            "Slave id {} collides with the primary's server_id",
            session.slave_id()
        );
    }

    let closer = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            closer.close().await;
        }
    });

    info!("Starting binlog streaming from {}", position);
    let (mut events, handle) = session.spawn(position);

    while let Some(event) = events.recv().await {
        // 첫 이벤트 전에 협상이 끝나므로 여기서는 항상 값이 있음
        let checksum = session.checksum().unwrap_or(ChecksumAlgorithm::None);
        let header = match event.header() {
            Some(header) => header,
            None => {
                warn!("Received {} byte event without a full header", event.len());
                continue;
            }
        };
        if header.event_length as usize != event.len() {
            warn!(
                "Event length mismatch: header says {}, received {}",
                header.event_length,
                event.len()
            );
        }
        let body_len = event.body(checksum).map(|body| body.len());
        println!(
            "{}",
            serde_json::json!({ "header": header, "body_len": body_len, "checksum": checksum })
        );
    }

    let outcome = handle.await?;
    session.close().await;

    match outcome {
        Ok(count) => {
            info!("Binlog stream ended. Total events received: {}", count);
            Ok(())
        }
        Err(e) if e.read_failure_kind() == Some(ReadFailureKind::ExpectedDisconnect) => {
            info!("Binlog stream stopped: {}", e);
            Ok(())
        }
        Err(e) => {
            error!("Binlog streaming error: {}", e);
            Err(e.into())
        }
    }
}
