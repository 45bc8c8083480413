//! Building and writing MySQL packets

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::packets::{
    ErrPacket, HandshakeResponse41, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
    CLIENT_SECURE_CONNECTION, HEADER_SIZE,
};
use crate::error::Result;

/// Frame a payload as one MySQL packet and write it out.
///
/// The 4-byte header carries the payload length in its low three bytes,
/// little-endian, and the sequence id in the fourth.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence_id: u8,
    payload: &[u8],
) -> Result<()> {
    let len = payload.len();
    let mut packet = Vec::with_capacity(HEADER_SIZE + len);
    packet.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence_id]);
    packet.extend_from_slice(payload);
    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode an ERR packet payload: the 0xFF marker, the error code, the
/// '#'-prefixed SQL state, and the message text.
pub fn build_err_packet(err: &ErrPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + err.error_message.len());
    payload.push(err.header);
    payload.extend_from_slice(&err.error_code.to_le_bytes());
    payload.push(err.sql_state_marker as u8);
    payload.extend_from_slice(&err.sql_state);
    payload.extend_from_slice(err.error_message.as_bytes());
    payload
}

/// Encode a HandshakeResponse41 payload.
///
/// Field order is fixed by the protocol: capability flags, max packet
/// size, character set, a 23-byte filler, then the username, the auth
/// data, and optionally a database name. How the auth data is delimited
/// depends on the capabilities the response claims.
pub fn build_handshake_response41(response: &HandshakeResponse41) -> Vec<u8> {
    let caps = response.capability_flags;
    let mut payload =
        Vec::with_capacity(41 + response.username.len() + response.auth_response.len());

    payload.extend_from_slice(&caps.to_le_bytes());
    payload.extend_from_slice(&response.max_packet_size.to_le_bytes());
    payload.push(response.character_set);
    payload.extend_from_slice(&response.reserved);
    push_nul_terminated(&mut payload, response.username.as_bytes());

    if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        push_length_encoded_int(&mut payload, response.auth_response.len() as u64);
        payload.extend_from_slice(&response.auth_response);
    } else if caps & CLIENT_SECURE_CONNECTION != 0 {
        // One length byte, then the data
        payload.push(response.auth_response.len() as u8);
        payload.extend_from_slice(&response.auth_response);
    } else {
        // Pre-4.1 clients delimit the auth data with a NUL instead
        push_nul_terminated(&mut payload, &response.auth_response);
    }

    if caps & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some(ref database) = response.database {
            push_nul_terminated(&mut payload, database.as_bytes());
        }
    }

    payload
}

fn push_nul_terminated(payload: &mut Vec<u8>, bytes: &[u8]) {
    payload.extend_from_slice(bytes);
    payload.push(0);
}

/// Read the client capability flags from a full handshake-response packet
/// (header included). Returns `None` if the packet is too short to carry
/// them.
pub fn client_capabilities(packet: &[u8]) -> Option<u32> {
    if packet.len() < HEADER_SIZE + 4 {
        return None;
    }
    Some(u32::from_le_bytes([
        packet[HEADER_SIZE],
        packet[HEADER_SIZE + 1],
        packet[HEADER_SIZE + 2],
        packet[HEADER_SIZE + 3],
    ]))
}

/// Append a length-encoded integer.
///
/// Values below 251 fit in a single byte; larger values get a marker byte
/// (0xFC, 0xFD, or 0xFE) followed by 2, 3, or 8 little-endian bytes.
fn push_length_encoded_int(payload: &mut Vec<u8>, value: u64) {
    match value {
        0..=250 => payload.push(value as u8),
        251..=0xFFFF => {
            payload.push(0xFC);
            payload.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            payload.push(0xFD);
            payload.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            payload.push(0xFE);
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }
}
