//! MySQL 인증 처리
//!
//! Native password authentication 구현

use crate::config::ConnectionParams;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// binlog 덤프용 클라이언트 capability
pub fn client_capabilities(params: &ConnectionParams) -> u32 {
    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH
        | params.flags;

    if params.database.is_some() {
        flags |= capabilities::CONNECT_WITH_DB;
    }
    flags
}

/// HandshakeResponse41 패킷 생성
pub fn create_handshake_response(
    params: &ConnectionParams,
    scramble: &[u8],
) -> Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    buffer.write_u32::<LittleEndian>(client_capabilities(params))?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    buffer.write_u8(params.charset)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(params.username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(&params.password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(ref db) = params.database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_auth_response_empty_password() {
        let response = create_auth_response("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
    }

    #[test]
    fn test_create_auth_response() {
        let scramble = vec![0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];
        let response = create_auth_response("password", &scramble);
        assert_eq!(response.len(), 20);
        assert_ne!(response, create_auth_response("password", &[0u8; 8]));
    }

    #[test]
    fn test_create_handshake_response() {
        let mut params = ConnectionParams::new("localhost", "root");
        params.password = "password".to_string();
        params.database = Some("testing".to_string());

        let packet = create_handshake_response(&params, &[0x40; 20]).unwrap();

        let caps = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        assert_ne!(caps & capabilities::CONNECT_WITH_DB, 0);
        assert_eq!(packet[8], params.charset);
        // capability(4) + max packet(4) + charset(1) + reserved(23) 다음에 username
        assert_eq!(&packet[32..37], b"root\0");
        assert_eq!(packet[37], 20);
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_extra_flags_are_ored() {
        let mut params = ConnectionParams::default();
        params.flags = 1 << 24;
        assert_ne!(client_capabilities(&params) & (1 << 24), 0);
        assert_eq!(client_capabilities(&params) & capabilities::CONNECT_WITH_DB, 0);
    }
}
