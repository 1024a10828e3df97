//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 헤더: 3 bytes 길이 (little-endian) + 1 byte 시퀀스 번호.
//! 길이가 0xFFFFFF인 패킷은 다음 패킷과 이어지는 페이로드입니다.

use crate::error::{ReplicationError, Result, ServerError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use std::io::{Cursor, Read};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PACKET_HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FF_FF;

pub const OK_PACKET_HEADER: u8 = 0x00;
pub const EOF_PACKET_HEADER: u8 = 0xFE;
pub const ERROR_PACKET_HEADER: u8 = 0xFF;

/// 명령어 코드
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_BINLOG_DUMP: u8 = 0x12;
}

/// MySQL 패킷 채널
pub struct PacketChannel<S> {
    stream: S,
    sequence: u8,
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream,
            sequence: 0,
        }
    }

    /// 패킷 읽기 (분할된 페이로드는 하나로 합침)
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.stream.read_exact(&mut header).await?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if length < MAX_PAYLOAD_LEN {
                return Ok(payload.freeze());
            }
        }
    }

    /// 현재 시퀀스 번호로 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PAYLOAD_LEN).peekable();
        let mut header = Vec::with_capacity(PACKET_HEADER_SIZE);

        if chunks.peek().is_none() {
            return self.write_chunk(&mut header, &[]).await;
        }
        while let Some(chunk) = chunks.next() {
            self.write_chunk(&mut header, chunk).await?;
            // 정확히 최대 길이로 끝나면 빈 패킷으로 종료를 알림
            if chunks.peek().is_none() && chunk.len() == MAX_PAYLOAD_LEN {
                self.write_chunk(&mut header, &[]).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, header: &mut Vec<u8>, chunk: &[u8]) -> Result<()> {
        header.clear();
        WriteBytesExt::write_u24::<LittleEndian>(header, chunk.len() as u32)?;
        WriteBytesExt::write_u8(header, self.sequence)?;
        self.sequence = self.sequence.wrapping_add(1);

        self.stream.write_all(header).await?;
        self.stream.write_all(chunk).await?;
        if chunk.is_empty() {
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// 새 명령 전송 (시퀀스 번호 0부터 시작)
    pub async fn write_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.sequence = 0;
        let mut packet = Vec::with_capacity(1 + payload.len());
        packet.push(command);
        packet.extend_from_slice(payload);
        self.write_packet(&packet).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: Option<String>,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(ErrorPacket::parse(data)?.into());
        }

        let mut cursor = Cursor::new(data);

        let protocol_version = read_u8(&mut cursor, "protocol version")?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| protocol_error("thread ID", e))?;

        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble)
            .map_err(|e| protocol_error("scramble part 1", e))?;

        // Filler (1 byte, always 0x00)
        read_u8(&mut cursor, "filler")?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| protocol_error("capabilities", e))?;
        let server_collation = read_u8(&mut cursor, "collation")?;
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| protocol_error("status", e))?;
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| protocol_error("capabilities upper", e))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = read_u8(&mut cursor, "auth data length")?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| protocol_error("reserved", e))?;

        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(|e| protocol_error("scramble part 2", e))?;
        // 마지막 null byte 제외
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]);

        let auth_plugin = if (cursor.position() as usize) < data.len() {
            Some(read_null_terminated_string(&mut cursor)?)
        } else {
            None
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }
}

/// Error 패킷 (0xFF)
pub struct ErrorPacket;

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Result<ServerError> {
        if !is_error_packet(data) {
            return Err(ReplicationError::Protocol(
                "Not an error packet".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[1..]);
        let code = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| protocol_error("error code", e))?;

        let rest = &data[1 + cursor.position() as usize..];
        let (sql_state, message) = match rest.first() {
            Some(b'#') if rest.len() >= 6 => (
                String::from_utf8_lossy(&rest[1..6]).to_string(),
                String::from_utf8_lossy(&rest[6..]).to_string(),
            ),
            _ => ("HY000".to_string(), String::from_utf8_lossy(rest).to_string()),
        };

        Ok(ServerError::new(code, sql_state, message))
    }
}

/// 인증 플러그인 전환 요청 (0xFE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&EOF_PACKET_HEADER) {
            return Err(ReplicationError::Protocol(
                "Not an auth switch request".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[1..]);
        let plugin = read_null_terminated_string(&mut cursor)?;
        let mut scramble = data[1 + cursor.position() as usize..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }

        Ok(AuthSwitchRequest { plugin, scramble })
    }
}

/// length-encoded integer 읽기
pub fn read_lenenc_int<R: Read>(reader: &mut R) -> Result<u64> {
    let first = read_u8(reader, "length-encoded integer")?;
    let value = match first {
        0xFC => ReadBytesExt::read_u16::<LittleEndian>(reader).map(u64::from),
        0xFD => ReadBytesExt::read_u24::<LittleEndian>(reader).map(u64::from),
        0xFE => ReadBytesExt::read_u64::<LittleEndian>(reader),
        0xFB | 0xFF => {
            return Err(ReplicationError::Protocol(format!(
                "Invalid length-encoded integer prefix: 0x{:02x}",
                first
            )))
        }
        n => Ok(n as u64),
    };
    value.map_err(|e| protocol_error("length-encoded integer", e))
}

/// length-encoded string 읽기. 0xFB는 NULL
pub fn read_lenenc_string(data: &[u8]) -> Result<Option<String>> {
    if data.first() == Some(&0xFB) {
        return Ok(None);
    }

    let mut cursor = Cursor::new(data);
    let length = read_lenenc_int(&mut cursor)? as usize;
    let start = cursor.position() as usize;
    let bytes = data.get(start..start + length).ok_or_else(|| {
        ReplicationError::Protocol(format!(
            "Length-encoded string of {} bytes exceeds packet",
            length
        ))
    })?;
    Ok(Some(String::from_utf8_lossy(bytes).to_string()))
}

fn read_u8<R: Read>(reader: &mut R, what: &str) -> Result<u8> {
    ReadBytesExt::read_u8(reader).map_err(|e| protocol_error(what, e))
}

fn protocol_error(what: &str, err: std::io::Error) -> ReplicationError {
    ReplicationError::Protocol(format!("Failed to read {}: {}", what, err))
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = read_u8(reader, "string byte")?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| ReplicationError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&ERROR_PACKET_HEADER)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&OK_PACKET_HEADER)
}

/// 결과셋 안의 EOF 패킷 확인 (0xFE, 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&EOF_PACKET_HEADER) && data.len() < 9
}
