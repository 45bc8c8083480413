//! Handshake-phase packet inspection.
//!
//! The first packets of a session are checked for sequence-id continuity.
//! The server greets with sequence 0, the client answers with sequence 1,
//! and the server's reply with sequence 2 completes the phase. Two cases
//! end inspection early: the client requesting a TLS switch (the rest of
//! the exchange is opaque) and the server answering with an ERR packet
//! (forwarded as-is, not counted as a failed handshake).

use crate::error::{Result, RoutingError};
use crate::protocol::mysql::packets::{CLIENT_SSL, HEADER_SIZE};
use crate::protocol::mysql::parser::client_capabilities;

/// What the relay should do with an inspected packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    /// Forward the buffer and keep inspecting subsequent packets
    Forward,
    /// Forward the buffer; the handshake phase is over
    HandshakeDone,
}

/// Per-connection handshake inspection state.
#[derive(Debug)]
pub struct HandshakeInspector {
    pktnr: u8,
    done: bool,
}

impl HandshakeInspector {
    /// Create an inspector for a fresh connection
    pub fn new() -> Self {
        Self {
            pktnr: 0,
            done: false,
        }
    }

    /// Whether the handshake phase has completed
    pub fn handshake_done(&self) -> bool {
        self.done
    }

    /// Inspect one packet read during the handshake phase.
    ///
    /// `buf` holds the bytes of a single read, header included. A sequence
    /// violation or an under-length packet is a protocol error that the
    /// caller escalates.
    pub fn inspect(&mut self, buf: &[u8]) -> Result<Inspection> {
        if self.done {
            return Ok(Inspection::Forward);
        }

        if buf.len() < HEADER_SIZE {
            return Err(RoutingError::Protocol(format!(
                "packet shorter than the {}-byte header",
                HEADER_SIZE
            )));
        }

        let pktnr = buf[3];
        if self.pktnr > 0 && pktnr != self.pktnr.wrapping_add(1) {
            return Err(RoutingError::Protocol(format!(
                "received incorrect packet number; aborting (was {})",
                pktnr
            )));
        }

        if buf.len() > HEADER_SIZE && buf[HEADER_SIZE] == 0xFF {
            // ERR from the server while handshaking; the client still gets
            // the packet and the phase ends cleanly.
            self.pktnr = 2;
            self.done = true;
            return Ok(Inspection::HandshakeDone);
        }

        if pktnr == 1 {
            // Client handshake response; check for a TLS switch request.
            let capabilities = client_capabilities(buf).ok_or_else(|| {
                RoutingError::Protocol("handshake response too short for capability flags".into())
            })?;
            if capabilities & CLIENT_SSL != 0 {
                self.pktnr = 2;
                self.done = true;
                return Ok(Inspection::HandshakeDone);
            }
        }

        self.pktnr = pktnr;
        if self.pktnr == 2 {
            self.done = true;
            return Ok(Inspection::HandshakeDone);
        }
        Ok(Inspection::Forward)
    }
}

impl Default for HandshakeInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packets::CLIENT_PROTOCOL_41;

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![payload.len() as u8, 0, 0, seq];
        buf.extend_from_slice(payload);
        buf
    }

    fn response_packet(seq: u8, capabilities: u32) -> Vec<u8> {
        let mut payload = capabilities.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 28]);
        packet(seq, &payload)
    }

    #[test]
    fn test_monotone_sequence_completes_handshake() {
        let mut inspector = HandshakeInspector::new();

        // Server greeting, protocol version 10
        let greeting = packet(0, &[10, b'5', b'.', b'7', 0]);
        assert_eq!(inspector.inspect(&greeting).unwrap(), Inspection::Forward);
        assert!(!inspector.handshake_done());

        // Client response without TLS
        let response = response_packet(1, CLIENT_PROTOCOL_41);
        assert_eq!(inspector.inspect(&response).unwrap(), Inspection::Forward);
        assert!(!inspector.handshake_done());

        // Server OK reply
        let ok = packet(2, &[0x00, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(inspector.inspect(&ok).unwrap(), Inspection::HandshakeDone);
        assert!(inspector.handshake_done());
    }

    #[test]
    fn test_truncated_packet_is_violation() {
        let mut inspector = HandshakeInspector::new();
        assert!(inspector.inspect(&[1, 0, 0]).is_err());
        assert!(inspector.inspect(&[]).is_err());
    }

    #[test]
    fn test_skipped_sequence_number_is_violation() {
        let mut inspector = HandshakeInspector::new();
        inspector
            .inspect(&packet(0, &[10, 0, 0, 0, 0]))
            .unwrap();
        inspector
            .inspect(&response_packet(1, CLIENT_PROTOCOL_41))
            .unwrap();

        // Sequence 5 after 1 breaks continuity
        let err = inspector.inspect(&packet(5, &[0x00])).unwrap_err();
        assert!(err.to_string().contains("incorrect packet number"));
        assert!(!inspector.handshake_done());
    }

    #[test]
    fn test_ssl_capability_ends_inspection() {
        let mut inspector = HandshakeInspector::new();
        inspector
            .inspect(&packet(0, &[10, 0, 0, 0, 0]))
            .unwrap();

        let response = response_packet(1, CLIENT_PROTOCOL_41 | crate::protocol::mysql::packets::CLIENT_SSL);
        assert_eq!(
            inspector.inspect(&response).unwrap(),
            Inspection::HandshakeDone
        );
        assert!(inspector.handshake_done());
    }

    #[test]
    fn test_server_error_packet_ends_inspection_cleanly() {
        let mut inspector = HandshakeInspector::new();
        inspector
            .inspect(&packet(0, &[10, 0, 0, 0, 0]))
            .unwrap();
        inspector
            .inspect(&response_packet(1, CLIENT_PROTOCOL_41))
            .unwrap();

        // ERR packet from the server instead of OK
        let err_packet = packet(2, &[0xFF, 0x15, 0x04, b'#', b'2', b'8', b'0', b'0', b'0']);
        assert_eq!(
            inspector.inspect(&err_packet).unwrap(),
            Inspection::HandshakeDone
        );
        assert!(inspector.handshake_done());
    }

    #[test]
    fn test_response_too_short_for_capabilities_is_violation() {
        let mut inspector = HandshakeInspector::new();
        inspector
            .inspect(&packet(0, &[10, 0, 0, 0, 0]))
            .unwrap();
        // Sequence 1 but fewer than 4 payload bytes
        assert!(inspector.inspect(&[2, 0, 0, 1, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_done_inspector_passes_through() {
        let mut inspector = HandshakeInspector::new();
        inspector
            .inspect(&packet(0, &[10, 0, 0, 0, 0]))
            .unwrap();
        inspector
            .inspect(&response_packet(1, CLIENT_PROTOCOL_41))
            .unwrap();
        inspector.inspect(&packet(2, &[0x00])).unwrap();

        // Anything after completion is forwarded without checks
        assert_eq!(
            inspector.inspect(&packet(99, &[0xFF])).unwrap(),
            Inspection::Forward
        );
    }
}
