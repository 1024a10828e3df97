//! 스트림에서 전달되는 binlog 이벤트
//!
//! 세션은 이벤트 내용을 해석하지 않습니다. `RawEvent::header`는 표시용으로
//! 19 bytes 공통 헤더만 들여다봅니다.
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)

use crate::error::{ReplicationError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const EVENT_HEADER_SIZE: usize = 19;

/// 상태 바이트가 제거된 이벤트 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent(Bytes);

impl RawEvent {
    pub fn new(payload: Bytes) -> Self {
        RawEvent(payload)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn header(&self) -> Option<EventHeader> {
        EventHeader::parse(&self.0)
    }

    /// 헤더와 체크섬 trailer를 뺀 본문
    pub fn body(&self, checksum: ChecksumAlgorithm) -> Option<&[u8]> {
        let end = self.0.len().checked_sub(checksum.trailer_len())?;
        self.0.get(EVENT_HEADER_SIZE..end)
    }
}

impl AsRef<[u8]> for RawEvent {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `@master_binlog_checksum` 값. 이벤트 끝에 붙는 trailer 길이를 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    None,
    Crc32,
}

impl ChecksumAlgorithm {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NONE" | "" => Ok(ChecksumAlgorithm::None),
            "CRC32" => Ok(ChecksumAlgorithm::Crc32),
            other => Err(ReplicationError::Query(format!(
                "Unknown binlog checksum algorithm: {}",
                other
            ))),
        }
    }

    pub fn trailer_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }
}

/// Binlog 이벤트 타입 (MariaDB 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    QueryEvent,
    RotateEvent,
    FormatDescriptionEvent,
    XidEvent,
    TableMapEvent,
    WriteRowsEvent,
    UpdateRowsEvent,
    DeleteRowsEvent,
    HeartbeatEvent,
    AnnotateRowsEvent,
    BinlogCheckpointEvent,
    GtidEvent,
    GtidListEvent,
    Unknown(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 | 30 => EventType::WriteRowsEvent,
            24 | 31 => EventType::UpdateRowsEvent,
            25 | 32 => EventType::DeleteRowsEvent,
            27 => EventType::HeartbeatEvent,
            160 => EventType::AnnotateRowsEvent,
            161 => EventType::BinlogCheckpointEvent,
            162 => EventType::GtidEvent,
            163 => EventType::GtidListEvent,
            other => EventType::Unknown(other),
        }
    }
}

/// Binlog 이벤트 공통 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        Some(EventHeader {
            timestamp: cursor.read_u32::<LittleEndian>().ok()?,
            event_type: EventType::from_u8(cursor.read_u8().ok()?),
            server_id: cursor.read_u32::<LittleEndian>().ok()?,
            event_length: cursor.read_u32::<LittleEndian>().ok()?,
            next_pos: cursor.read_u32::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }
}
