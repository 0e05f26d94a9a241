//! Typed protocol messages and their payload codecs.
//!
//! The dispatcher works on command strings; commands we do not recognize
//! decode to `Unknown` and are counted + ignored, never a disconnect.

use crate::constants::{
    MAX_ADDR_PER_MSG, MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG, MAX_LOCATOR_HASHES,
    MAX_USER_AGENT_LEN,
};
use crate::errors::WireError;
use crate::net::wire::{read_vec, Reader, Writer};
use crate::primitives::header::{BlockHeader, HEADER_SIZE};
use crate::primitives::Hash256;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Inventory type for a block announcement.
pub const INV_BLOCK: u32 = 2;

/// Network endpoint as carried inside VERSION (no timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: &SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetAddress {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.services);
        w.put_bytes(&self.ip);
        w.put_u16_be(self.port);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(NetAddress {
            services: r.read_u64()?,
            ip: r.read_array()?,
            port: r.read_u16_be()?,
        })
    }
}

/// ADDR table entry: endpoint plus last-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedAddress {
    pub time: u32,
    pub addr: NetAddress,
}

impl TimedAddress {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.time);
        self.addr.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(TimedAddress {
            time: r.read_u32()?,
            addr: NetAddress::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMsg {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMsg {
    pub version: i32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMsg),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimedAddress>),
    GetAddr,
    Inv(Vec<InvItem>),
    GetHeaders(GetHeadersMsg),
    Headers(Vec<BlockHeader>),
    Unknown(String),
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Unknown(cmd) => cmd,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Version(v) => {
                w.put_i32(v.version);
                w.put_u64(v.services);
                w.put_i64(v.timestamp);
                v.receiver.encode(&mut w);
                v.sender.encode(&mut w);
                w.put_u64(v.nonce);
                w.put_varstr(&v.user_agent);
                w.put_i32(v.start_height);
                w.put_bool(v.relay);
            }
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => w.put_u64(*nonce),
            Message::Addr(entries) => {
                w.put_varint(entries.len() as u64);
                for entry in entries {
                    entry.encode(&mut w);
                }
            }
            Message::Inv(items) => {
                w.put_varint(items.len() as u64);
                for item in items {
                    w.put_u32(item.kind);
                    w.put_bytes(&item.hash.0);
                }
            }
            Message::GetHeaders(msg) => {
                w.put_i32(msg.version);
                w.put_varint(msg.locator.len() as u64);
                for hash in &msg.locator {
                    w.put_bytes(&hash.0);
                }
                w.put_bytes(&msg.stop.0);
            }
            Message::Headers(headers) => {
                w.put_varint(headers.len() as u64);
                for header in headers {
                    w.put_bytes(&header.encode());
                }
            }
            Message::Unknown(_) => {}
        }
        w.into_vec()
    }

    /// Decode a payload for a known command. Unrecognized commands come
    /// back as `Unknown`.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(payload);
        let msg = match command {
            "version" => Message::Version(VersionMsg {
                version: r.read_i32()?,
                services: r.read_u64()?,
                timestamp: r.read_i64()?,
                receiver: NetAddress::decode(&mut r)?,
                sender: NetAddress::decode(&mut r)?,
                nonce: r.read_u64()?,
                user_agent: r.read_varstr(MAX_USER_AGENT_LEN)?,
                start_height: r.read_i32()?,
                relay: r.read_bool()?,
            }),
            "verack" => Message::Verack,
            "ping" => Message::Ping(r.read_u64()?),
            "pong" => Message::Pong(r.read_u64()?),
            "addr" => Message::Addr(read_vec(&mut r, MAX_ADDR_PER_MSG, 30, |r| {
                TimedAddress::decode(r)
            })?),
            "getaddr" => Message::GetAddr,
            "inv" => Message::Inv(read_vec(&mut r, MAX_INV_PER_MSG, 36, |r| {
                Ok(InvItem {
                    kind: r.read_u32()?,
                    hash: Hash256(r.read_array()?),
                })
            })?),
            "getheaders" => {
                let version = r.read_i32()?;
                let locator = read_vec(&mut r, MAX_LOCATOR_HASHES, 32, |r| {
                    Ok(Hash256(r.read_array()?))
                })?;
                let stop = Hash256(r.read_array()?);
                Message::GetHeaders(GetHeadersMsg {
                    version,
                    locator,
                    stop,
                })
            }
            "headers" => Message::Headers(decode_headers(&mut r)?),
            other => Message::Unknown(other.to_string()),
        };
        Ok(msg)
    }
}

/// HEADERS entries are 100 bytes each; a legacy zero tx-count byte per
/// entry is tolerated. The payload length decides which form is in use.
fn decode_headers(r: &mut Reader<'_>) -> Result<Vec<BlockHeader>, WireError> {
    let start_remaining = r.remaining();
    let mut probe = Reader::new(r.read_bytes(start_remaining)?);
    let count = probe.read_varint()?;
    if count > MAX_HEADERS_PER_MSG {
        return Err(WireError::ContainerTooLarge {
            count,
            cap: MAX_HEADERS_PER_MSG,
        });
    }
    let body = probe.remaining();
    let with_txcount = if body == count as usize * HEADER_SIZE {
        false
    } else if body == count as usize * (HEADER_SIZE + 1) {
        true
    } else {
        return Err(WireError::TruncatedPayload);
    };
    let chunk = (crate::constants::ALLOC_CHUNK_BYTES / HEADER_SIZE).max(1) as u64;
    let mut out = Vec::new();
    let mut i = 0u64;
    while i < count {
        if i % chunk == 0 {
            out.reserve(chunk.min(count - i) as usize);
        }
        let header = BlockHeader::decode(probe.read_bytes(HEADER_SIZE)?)?;
        if with_txcount && probe.read_u8()? != 0 {
            return Err(WireError::TruncatedPayload);
        }
        out.push(header);
        i += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Hash160, Hash256};

    fn sample_version() -> VersionMsg {
        let addr: SocketAddr = "10.1.2.3:9590".parse().unwrap();
        VersionMsg {
            version: 1,
            services: 1,
            timestamp: 1_700_000_000,
            receiver: NetAddress::from_socket(&addr, 1),
            sender: NetAddress::from_socket(&addr, 1),
            nonce: 0xdead_beef_cafe_f00d,
            user_agent: "/coinbasechain:0.1.0/".into(),
            start_height: 42,
            relay: true,
        }
    }

    fn sample_header(n: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_id: Hash256([n as u8; 32]),
            miner: Hash160([7; 20]),
            time: 1000 + n,
            bits: 0x207fffff,
            nonce: n,
            pow_commitment: Hash256([9; 32]),
        }
    }

    fn roundtrip(msg: Message) -> Message {
        let payload = msg.encode_payload();
        Message::decode(msg.command(), &payload).unwrap()
    }

    #[test]
    fn version_roundtrip() {
        let msg = Message::Version(sample_version());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn simple_messages_roundtrip() {
        for msg in [
            Message::Verack,
            Message::GetAddr,
            Message::Ping(7),
            Message::Pong(7),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn addr_roundtrip() {
        let addr: SocketAddr = "192.168.7.7:19590".parse().unwrap();
        let msg = Message::Addr(vec![TimedAddress {
            time: 123,
            addr: NetAddress::from_socket(&addr, 1),
        }]);
        let decoded = roundtrip(msg.clone());
        assert_eq!(decoded, msg);
        if let Message::Addr(entries) = decoded {
            assert_eq!(entries[0].addr.socket_addr(), addr);
        }
    }

    #[test]
    fn addr_over_cap_rejected() {
        let addr: SocketAddr = "192.168.7.7:19590".parse().unwrap();
        let entry = TimedAddress {
            time: 1,
            addr: NetAddress::from_socket(&addr, 1),
        };
        let msg = Message::Addr(vec![entry; MAX_ADDR_PER_MSG as usize + 1]);
        let payload = msg.encode_payload();
        assert!(matches!(
            Message::decode("addr", &payload),
            Err(WireError::ContainerTooLarge { .. })
        ));
    }

    #[test]
    fn getheaders_roundtrip() {
        let msg = Message::GetHeaders(GetHeadersMsg {
            version: 1,
            locator: vec![Hash256([1; 32]), Hash256([2; 32])],
            stop: Hash256::ZERO,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn locator_over_cap_rejected() {
        let msg = Message::GetHeaders(GetHeadersMsg {
            version: 1,
            locator: vec![Hash256::ZERO; MAX_LOCATOR_HASHES as usize + 1],
            stop: Hash256::ZERO,
        });
        let payload = msg.encode_payload();
        assert!(matches!(
            Message::decode("getheaders", &payload),
            Err(WireError::ContainerTooLarge { .. })
        ));
    }

    #[test]
    fn headers_roundtrip_at_cap() {
        let headers: Vec<BlockHeader> =
            (0..MAX_HEADERS_PER_MSG as u32).map(sample_header).collect();
        let msg = Message::Headers(headers.clone());
        let decoded = roundtrip(msg);
        assert_eq!(decoded, Message::Headers(headers));
    }

    #[test]
    fn headers_over_cap_rejected() {
        let headers: Vec<BlockHeader> = (0..MAX_HEADERS_PER_MSG as u32 + 1)
            .map(sample_header)
            .collect();
        let payload = Message::Headers(headers).encode_payload();
        assert!(matches!(
            Message::decode("headers", &payload),
            Err(WireError::ContainerTooLarge { .. })
        ));
    }

    #[test]
    fn headers_with_txcount_byte_accepted() {
        let headers = vec![sample_header(1), sample_header(2)];
        let mut w = Writer::new();
        w.put_varint(2);
        for h in &headers {
            w.put_bytes(&h.encode());
            w.put_u8(0);
        }
        let decoded = Message::decode("headers", &w.into_vec()).unwrap();
        assert_eq!(decoded, Message::Headers(headers));
    }

    #[test]
    fn headers_with_nonzero_txcount_rejected() {
        let mut w = Writer::new();
        w.put_varint(1);
        w.put_bytes(&sample_header(1).encode());
        w.put_u8(3);
        assert!(Message::decode("headers", &w.into_vec()).is_err());
    }

    #[test]
    fn unknown_command_is_not_an_error() {
        let msg = Message::decode("wibble", &[1, 2, 3]).unwrap();
        assert_eq!(msg, Message::Unknown("wibble".into()));
    }

    #[test]
    fn inv_roundtrip() {
        let msg = Message::Inv(vec![InvItem {
            kind: INV_BLOCK,
            hash: Hash256([4; 32]),
        }]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn oversized_user_agent_rejected() {
        let mut v = sample_version();
        v.user_agent = "x".repeat(MAX_USER_AGENT_LEN + 1);
        let payload = Message::Version(v).encode_payload();
        assert!(Message::decode("version", &payload).is_err());
    }
}
