//! ICMP echo request/reply encoding (RFC 792, RFC 4443).

use bytes::{BufMut, Bytes, BytesMut};

/// ICMPv4 echo reply type
pub const ECHO_REPLY_V4: u8 = 0;
/// ICMPv4 echo request type
pub const ECHO_REQUEST_V4: u8 = 8;
/// ICMPv6 echo request type
pub const ECHO_REQUEST_V6: u8 = 128;
/// ICMPv6 echo reply type
pub const ECHO_REPLY_V6: u8 = 129;

const HEADER_LEN: usize = 8;

/// ICMP echo message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    /// Message type (request or reply, per address family)
    pub icmp_type: u8,
    /// Echo identifier
    pub identifier: u16,
    /// Echo sequence number
    pub sequence: u16,
    /// Opaque payload echoed back by the target
    pub payload: Bytes,
}

impl EchoPacket {
    /// Create an echo request
    pub fn request(ipv6: bool, identifier: u16, sequence: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            icmp_type: if ipv6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 },
            identifier,
            sequence,
            payload: payload.into(),
        }
    }

    /// Serialize the message.
    ///
    /// ICMPv4 carries its own checksum. ICMPv6 checksums cover a pseudo-header
    /// the kernel fills in, so the field is left zero.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());

        buf.put_u8(self.icmp_type);
        buf.put_u8(0); // code
        buf.put_u16(0); // checksum placeholder
        buf.put_u16(self.identifier);
        buf.put_u16(self.sequence);
        buf.put_slice(&self.payload);

        if self.icmp_type == ECHO_REQUEST_V4 || self.icmp_type == ECHO_REPLY_V4 {
            let sum = checksum(&buf);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());
        }

        buf.freeze()
    }

    /// Parse an echo reply received on an ICMP socket.
    ///
    /// Raw IPv4 sockets deliver the IP header too; it is skipped when present.
    pub fn parse_reply(data: &[u8], ipv6: bool) -> Result<Self, &'static str> {
        let icmp = if !ipv6 && data.first().is_some_and(|b| b >> 4 == 4) {
            let header_len = ((data[0] & 0x0F) as usize) * 4;
            if header_len < 20 || data.len() < header_len {
                return Err("Truncated IPv4 header");
            }
            &data[header_len..]
        } else {
            data
        };

        if icmp.len() < HEADER_LEN {
            return Err("Packet too short for ICMP echo");
        }

        let expected = if ipv6 { ECHO_REPLY_V6 } else { ECHO_REPLY_V4 };
        if icmp[0] != expected {
            return Err("Not an echo reply");
        }
        if icmp[1] != 0 {
            return Err("Invalid echo reply code");
        }

        Ok(Self {
            icmp_type: icmp[0],
            identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
            sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
            payload: Bytes::copy_from_slice(&icmp[HEADER_LEN..]),
        })
    }
}

/// RFC 1071 internet checksum
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
