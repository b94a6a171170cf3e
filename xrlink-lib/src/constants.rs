// Protocol constants for the XR glasses link

/// Magic of every host-to-device command frame (`45 4D` on the wire)
pub const CMD_MAGIC: u16 = 0x4D45;

/// Magic of every device-to-host acknowledgment frame (`4F 42` on the wire)
pub const ACK_MAGIC: u16 = 0x424F;

/// Command class of the binary-packet transport
pub const CMD_BINARY_PACKET: u16 = 0x001A;

/// Size of the outer command header (magic, command, length, length bitfield)
pub const CMD_HEADER_SIZE: usize = 8;

/// Size of the packet request header (bin type, slice tag, crc32, index)
pub const PACKET_HEADER_SIZE: usize = 10;

/// Size of the common-data header prepended by the generic framer
pub const COMMON_DATA_HEADER_SIZE: usize = 25;

/// Both framing headers together
pub const FRAME_OVERHEAD: usize = CMD_HEADER_SIZE + PACKET_HEADER_SIZE;

/// Largest value length the 15-bit length field can carry
pub const MAX_VALUE_LEN: usize = 0x7FFF;

/// Largest MTU whose frames still fit the length field
pub const MAX_FRAME_MTU: usize = CMD_HEADER_SIZE + MAX_VALUE_LEN;

/// ATT write-without-response overhead reserved by the OTA framer
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Smallest effective transmission unit the OTA framer will assume
pub const OTA_MIN_EFFECTIVE_MTU: usize = 20;

/// Default ATT MTU before negotiation
pub const DEFAULT_MTU: usize = 23;

/// Size of the handshake token
pub const TOKEN_SIZE: usize = 27;

/// Marker byte following the 3-byte token prefix
pub const TOKEN_MARKER: u8 = 0xE0;

/// Size of a handshake response
pub const HANDSHAKE_RESPONSE_SIZE: usize = 18;

/// First byte of an accepted handshake response
pub const HANDSHAKE_ACCEPTED: u8 = 0x64;

/// First byte of a rejected handshake response
pub const HANDSHAKE_REJECTED: u8 = 0x01;

/// Header stripped from every telemetry notification
pub const TELEMETRY_HEADER_SIZE: usize = 8;

/// Size of one telemetry record (kind, timestamp, x, y, z)
pub const TELEMETRY_RECORD_SIZE: usize = 21;

/// Maximum length of a single RLC section
pub const RLC_SECTION_MAX: usize = 127;

/// Firmware container (BAG) magic, "MBAG" little-endian
pub const BAG_MAGIC: u32 = 0x4741_424D;

/// Firmware section (OTA header) magic, "MBFW" little-endian
pub const OTA_SECTION_MAGIC: u32 = 0x5746_424D;

/// Size of the firmware container header
pub const BAG_HEADER_SIZE: usize = 32;

/// Size of a firmware section header
pub const OTA_SECTION_HEADER_SIZE: usize = 48;
