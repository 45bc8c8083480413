//! MySQL packet structures
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// Size of the packet header: 3-byte little-endian payload length plus a
/// 1-byte sequence id.
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (2^24 - 1)
pub const MAX_PAYLOAD_LENGTH: u32 = 0xFF_FF_FF;

// ============================================================================
// Capability Flags
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
// ============================================================================

/// Can specify db on connect
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
/// New 4.1 protocol
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
/// Switch to SSL after handshake
pub const CLIENT_SSL: u32 = 0x0000_0800;
/// Old flag for 4.1 authentication (deprecated)
pub const CLIENT_RESERVED2: u32 = 0x0000_8000;
/// Length of auth response can be > 255
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

/// Older flag name for secure connection
pub const CLIENT_SECURE_CONNECTION: u32 = CLIENT_RESERVED2;

/// MySQL ERR Packet (server -> client)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_err_packet.html>
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Header (0xFF)
    pub header: u8,
    /// Error code
    pub error_code: u16,
    /// SQL state marker
    pub sql_state_marker: char,
    /// SQL state (5 characters)
    pub sql_state: [u8; 5],
    /// Error message
    pub error_message: String,
}

impl Default for ErrPacket {
    fn default() -> Self {
        Self {
            header: 0xFF,
            error_code: 0,
            sql_state_marker: '#',
            sql_state: *b"HY000",
            error_message: String::new(),
        }
    }
}

impl ErrPacket {
    /// Create a new error packet with the given code and message
    pub fn new(error_code: u16, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            ..Default::default()
        }
    }

    /// Too many connections (1040)
    pub fn too_many_connections() -> Self {
        Self::new(1040, "Too many connections")
    }

    /// Out of resources (1041)
    pub fn out_of_resources() -> Self {
        Self::new(1041, "Out of resources (please check logs)")
    }

    /// Host blocked after repeated connection errors (1129)
    pub fn blocked_client(ip: &str) -> Self {
        Self::new(1129, format!("Too many connection errors from {}", ip))
    }

    /// No destination server reachable (2003)
    pub fn cannot_connect() -> Self {
        Self::new(2003, "Can't connect to MySQL server")
    }
}

/// MySQL Handshake Response 41 packet (client -> server)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_response.html>
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    /// Capability flags (4 bytes)
    pub capability_flags: u32,
    /// Max packet size
    pub max_packet_size: u32,
    /// Character set
    pub character_set: u8,
    /// Reserved (23 bytes of zeros)
    pub reserved: [u8; 23],
    /// Username (null-terminated)
    pub username: String,
    /// Auth response (encoding depends on capability flags)
    pub auth_response: Vec<u8>,
    /// Database name (if CLIENT_CONNECT_WITH_DB)
    pub database: Option<String>,
}

impl Default for HandshakeResponse41 {
    fn default() -> Self {
        Self {
            capability_flags: 0,
            max_packet_size: 0x00FF_FFFF,
            character_set: 0x21, // utf8_general_ci
            reserved: [0u8; 23],
            username: String::new(),
            auth_response: Vec::new(),
            database: None,
        }
    }
}
