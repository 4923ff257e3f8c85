//! Frame metadata encoding/decoding
//!
//! Frame format:
//! ```text
//! +-----------+------------+--------+--------+
//! | Len (2B)  | Session(2B)| Status | Option |
//! +-----------+------------+--------+--------+
//! | (New only) Network(1B) | Port(2B) | AddrType(1B) | Addr |
//! +------------------------------------------------------------+
//! | (Option::DATA only) ChunkLen(2B) | Chunk bytes             |
//! +------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. `Len` covers everything after itself up to
//! the chunk, and is capped at [`MAX_METADATA_LEN`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{Address, Destination, Network};
use crate::error::{Error, Result};

/// Largest metadata body a peer may announce
pub const MAX_METADATA_LEN: usize = 512;

/// Largest chunk a stream session writes at once (8KB)
pub const MAX_CHUNK_SIZE: usize = 8 * 1024;

/// Session id + status + option
const METADATA_HEADER_LEN: usize = 4;

/// Virtual host addressed to ask for a multiplexed connection
pub const MUX_COOL_DOMAIN: &str = "v1.mux.cool";

/// Port paired with [`MUX_COOL_DOMAIN`]
pub const MUX_COOL_PORT: u16 = 9527;

/// The well-known destination that carries multiplexed traffic
pub fn mux_cool_destination() -> Destination {
    Destination::tcp(Address::domain(MUX_COOL_DOMAIN, MUX_COOL_PORT))
}

// ============================================================================
// Discriminators
// ============================================================================

/// Session status carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    New = 0x01,
    Keep = 0x02,
    End = 0x03,
    KeepAlive = 0x04,
}

impl TryFrom<u8> for SessionStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(SessionStatus::New),
            0x02 => Ok(SessionStatus::Keep),
            0x03 => Ok(SessionStatus::End),
            0x04 => Ok(SessionStatus::KeepAlive),
            other => Err(Error::Frame(format!("unknown session status: {}", other))),
        }
    }
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::New => "new",
            SessionStatus::Keep => "keep",
            SessionStatus::End => "end",
            SessionStatus::KeepAlive => "keepalive",
        }
    }
}

/// Frame option bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOption(u8);

impl FrameOption {
    /// A data chunk follows the metadata
    pub const DATA: u8 = 0x01;
    /// The session ended abnormally
    pub const ERROR: u8 = 0x02;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_data(mut self) -> Self {
        self.0 |= Self::DATA;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.0 |= Self::ERROR;
        self
    }

    pub fn has_data(&self) -> bool {
        (self.0 & Self::DATA) != 0
    }

    pub fn has_error(&self) -> bool {
        (self.0 & Self::ERROR) != 0
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl From<u8> for FrameOption {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Wire value for a target network
fn network_byte(network: Network) -> u8 {
    match network {
        Network::Tcp => 0x01,
        Network::Udp => 0x02,
    }
}

fn network_from_byte(value: u8) -> Result<Network> {
    match value {
        0x01 => Ok(Network::Tcp),
        0x02 => Ok(Network::Udp),
        other => Err(Error::Frame(format!("unknown network type: {}", other))),
    }
}

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x02;
const ADDR_TYPE_IPV6: u8 = 0x03;

/// How a session's payload is chunked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Byte stream: chunks may be split and merged freely
    Stream,
    /// Datagrams: one chunk per packet, boundaries preserved
    Packet,
}

impl From<Network> for TransferType {
    fn from(network: Network) -> Self {
        match network {
            Network::Tcp => TransferType::Stream,
            Network::Udp => TransferType::Packet,
        }
    }
}

// ============================================================================
// FrameMetadata
// ============================================================================

/// Header of one frame.
///
/// `target` is present exactly when `status` is `New`; the constructors keep
/// it that way and decoding never produces anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub session_id: u16,
    pub status: SessionStatus,
    pub option: FrameOption,
    pub target: Option<Destination>,
}

impl FrameMetadata {
    pub fn new_session(session_id: u16, target: Destination) -> Self {
        Self {
            session_id,
            status: SessionStatus::New,
            option: FrameOption::new(),
            target: Some(target),
        }
    }

    pub fn keep(session_id: u16) -> Self {
        Self::without_target(session_id, SessionStatus::Keep)
    }

    pub fn end(session_id: u16) -> Self {
        Self::without_target(session_id, SessionStatus::End)
    }

    pub fn keep_alive(session_id: u16) -> Self {
        Self::without_target(session_id, SessionStatus::KeepAlive)
    }

    fn without_target(session_id: u16, status: SessionStatus) -> Self {
        Self {
            session_id,
            status,
            option: FrameOption::new(),
            target: None,
        }
    }

    pub fn with_option(mut self, option: FrameOption) -> Self {
        self.option = option;
        self
    }

    /// Append the encoded metadata (length prefix included) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        // Placeholder length, backfilled once the body is written
        let length_pos = buf.len();
        buf.put_u16(0);
        let body_start = buf.len();

        buf.put_u16(self.session_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(self.option.raw());

        if self.status == SessionStatus::New {
            let target = self.target.as_ref().ok_or_else(|| {
                Error::Frame("target required for new session".into())
            })?;
            buf.put_u8(network_byte(target.network));
            encode_address(buf, &target.address)?;
        }

        let body_len = buf.len() - body_start;
        if body_len > MAX_METADATA_LEN {
            return Err(Error::Frame(format!("metadata too long: {}", body_len)));
        }
        buf[length_pos..body_start].copy_from_slice(&(body_len as u16).to_be_bytes());

        Ok(())
    }

    /// Encode to a standalone buffer
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(METADATA_HEADER_LEN + 2 + 1 + 2 + 1 + 256);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode length-prefixed metadata as produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Frame("insufficient buffer".into()));
        }
        let len = check_metadata_len(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        if bytes.len() < 2 + len {
            return Err(Error::Frame("insufficient buffer".into()));
        }
        Self::decode_body(&bytes[2..2 + len])
    }

    /// Decode a metadata body (the bytes covered by the length prefix).
    pub fn decode_body(mut body: &[u8]) -> Result<Self> {
        if body.len() < METADATA_HEADER_LEN {
            return Err(Error::Frame("insufficient buffer".into()));
        }

        let session_id = body.get_u16();
        let status = SessionStatus::try_from(body.get_u8())?;
        let option = FrameOption::from(body.get_u8());

        let target = if status == SessionStatus::New {
            need(&body, 1)?;
            let network = network_from_byte(body.get_u8())?;
            let address = decode_address(&mut body)?;
            Some(Destination::new(network, address))
        } else {
            None
        };

        // Trailing bytes are extensions this side doesn't know; ignore them
        Ok(Self {
            session_id,
            status,
            option,
            target,
        })
    }
}

impl std::fmt::Display for FrameMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(id={}", self.status.as_str(), self.session_id)?;
        if self.option.has_data() {
            write!(f, ",data")?;
        }
        if self.option.has_error() {
            write!(f, ",error")?;
        }
        if let Some(target) = &self.target {
            write!(f, ",target={}", target)?;
        }
        write!(f, ")")
    }
}

/// Reject announced metadata lengths above the cap before allocating
pub fn check_metadata_len(len: u16) -> Result<usize> {
    let len = len as usize;
    if len > MAX_METADATA_LEN {
        return Err(Error::Frame(format!("invalid metadata length: {}", len)));
    }
    Ok(len)
}

// ============================================================================
// Address encoding (port first, then typed address)
// ============================================================================

fn encode_address(buf: &mut BytesMut, address: &Address) -> Result<()> {
    buf.put_u16(address.port());
    match address {
        Address::Socket(SocketAddr::V4(addr)) => {
            buf.put_u8(ADDR_TYPE_IPV4);
            buf.put_slice(&addr.ip().octets());
        }
        Address::Socket(SocketAddr::V6(addr)) => {
            buf.put_u8(ADDR_TYPE_IPV6);
            buf.put_slice(&addr.ip().octets());
        }
        Address::Domain(domain, _) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::Frame(format!("domain too long: {}", domain.len())))?;
            buf.put_u8(ADDR_TYPE_DOMAIN);
            buf.put_u8(len);
            buf.put_slice(domain.as_bytes());
        }
    }
    Ok(())
}

fn decode_address(body: &mut &[u8]) -> Result<Address> {
    need(body, 3)?;
    let port = body.get_u16();
    match body.get_u8() {
        ADDR_TYPE_IPV4 => {
            need(body, 4)?;
            let mut octets = [0u8; 4];
            body.copy_to_slice(&mut octets);
            Ok(Address::ip_port(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ADDR_TYPE_IPV6 => {
            need(body, 16)?;
            let mut octets = [0u8; 16];
            body.copy_to_slice(&mut octets);
            Ok(Address::ip_port(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ADDR_TYPE_DOMAIN => {
            need(body, 1)?;
            let len = body.get_u8() as usize;
            need(body, len)?;
            let domain = std::str::from_utf8(&body[..len])
                .map_err(|_| Error::Frame("invalid domain encoding".into()))?
                .to_string();
            body.advance(len);
            Ok(Address::Domain(domain, port))
        }
        other => Err(Error::Frame(format!("unknown address type: {}", other))),
    }
}

fn need(body: &[u8], n: usize) -> Result<()> {
    if body.len() < n {
        return Err(Error::Frame("insufficient buffer".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(meta: &FrameMetadata) -> FrameMetadata {
        let encoded = meta.encode().unwrap();
        FrameMetadata::decode(&encoded).unwrap()
    }

    #[test]
    fn test_new_frame_round_trip_all_address_families() {
        let targets = [
            Destination::tcp(Address::ip_port(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80)),
            Destination::udp(Address::ip_port(IpAddr::V6(Ipv6Addr::LOCALHOST), 53)),
            Destination::tcp(Address::domain("www.example.com", 443)),
        ];

        for (i, target) in targets.into_iter().enumerate() {
            let meta = FrameMetadata::new_session(i as u16 + 1, target)
                .with_option(FrameOption::new().with_data());
            assert_eq!(round_trip(&meta), meta);
        }
    }

    #[test]
    fn test_new_frame_wire_layout() {
        let target = Destination::tcp(Address::ip_port(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 80));
        let encoded = FrameMetadata::new_session(1, target).encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[0x00, 0x0c, 0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x50, 0x01, 127, 0, 0, 1]
        );
    }

    #[test]
    fn test_keep_frame_has_no_target() {
        let encoded = FrameMetadata::keep(9).with_option(FrameOption::new().with_data()).encode().unwrap();
        assert_eq!(&encoded[..], &[0x00, 0x04, 0x00, 0x09, 0x02, 0x01]);

        let decoded = FrameMetadata::decode(&encoded).unwrap();
        assert_eq!(decoded.status, SessionStatus::Keep);
        assert!(decoded.target.is_none());
        assert!(decoded.option.has_data());
        assert!(!decoded.option.has_error());
    }

    #[test]
    fn test_end_with_error() {
        let meta = FrameMetadata::end(3).with_option(FrameOption::new().with_error());
        let decoded = round_trip(&meta);
        assert!(decoded.option.has_error());
        assert_eq!(decoded.to_string(), "end(id=3,error)");
    }

    #[test]
    fn test_metadata_length_cap() {
        assert!(check_metadata_len(512).is_ok());
        assert!(matches!(check_metadata_len(513), Err(Error::Frame(_))));

        let mut bytes = vec![0x02, 0x01];
        bytes.extend(vec![0u8; 513]);
        assert!(matches!(FrameMetadata::decode(&bytes), Err(Error::Frame(_))));
    }

    #[test]
    fn test_insufficient_buffer() {
        assert!(matches!(FrameMetadata::decode_body(&[0x00, 0x01, 0x02]), Err(Error::Frame(_))));
        assert!(matches!(FrameMetadata::decode(&[0x00]), Err(Error::Frame(_))));
        assert!(matches!(FrameMetadata::decode(&[0x00, 0x08, 0x00, 0x01]), Err(Error::Frame(_))));

        // New frame truncated inside the address
        let body = [0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x50, 0x01, 127, 0];
        assert!(matches!(FrameMetadata::decode_body(&body), Err(Error::Frame(_))));
    }

    #[test]
    fn test_unknown_discriminators() {
        let bad_status = [0x00, 0x01, 0x09, 0x00];
        let err = FrameMetadata::decode_body(&bad_status).unwrap_err();
        assert!(err.to_string().contains("unknown session status"));

        let bad_network = [0x00, 0x01, 0x01, 0x00, 0x07, 0x00, 0x50, 0x01, 1, 1, 1, 1];
        let err = FrameMetadata::decode_body(&bad_network).unwrap_err();
        assert!(err.to_string().contains("unknown network type"));

        let bad_addr = [0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x50, 0x05, 1, 1, 1, 1];
        let err = FrameMetadata::decode_body(&bad_addr).unwrap_err();
        assert!(err.to_string().contains("unknown address type"));
    }

    #[test]
    fn test_new_without_target_rejected() {
        let meta = FrameMetadata {
            session_id: 1,
            status: SessionStatus::New,
            option: FrameOption::new(),
            target: None,
        };
        assert!(meta.encode().is_err());
    }

    #[test]
    fn test_domain_too_long_rejected() {
        let meta = FrameMetadata::new_session(1, Destination::tcp(Address::domain("a".repeat(300), 80)));
        assert!(meta.encode().is_err());
    }

    #[test]
    fn test_trailing_extension_bytes_ignored() {
        let body = [0x00, 0x05, 0x03, 0x00, 0xaa, 0xbb];
        let meta = FrameMetadata::decode_body(&body).unwrap();
        assert_eq!(meta, FrameMetadata::end(5));
    }

    #[test]
    fn test_transfer_type_from_network() {
        assert_eq!(TransferType::from(Network::Tcp), TransferType::Stream);
        assert_eq!(TransferType::from(Network::Udp), TransferType::Packet);
        assert_eq!(mux_cool_destination().to_string(), "tcp:v1.mux.cool:9527");
    }
}
