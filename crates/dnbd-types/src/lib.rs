#![forbid(unsafe_code)]
//! Shared constants and primitive types for the dnbd replication proxy.
//!
//! Everything here is protocol- or layout-level: block geometry, the
//! host address sum type with its wire tags, and the size arithmetic
//! used by the cache-map and CRC manifest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ── Block geometry ──────────────────────────────────────────────────────────

/// Smallest unit of cache-map tracking. Reads and cache writes are
/// aligned to this.
pub const BLOCK_SIZE: u64 = 4096;

/// Unit of CRC-32 coverage: 4096 blocks.
pub const HASH_BLOCK_SIZE: u64 = 1 << 24;

/// Blocks per hash-block.
pub const BLOCKS_PER_HASH_BLOCK: u64 = HASH_BLOCK_SIZE / BLOCK_SIZE;

/// Protocol magic, first two bytes of every packet (little-endian).
pub const PROTOCOL_MAGIC: u16 = 0x7372;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 3;

/// Oldest remote protocol version we will replicate from.
pub const MIN_SUPPORTED_SERVER: u16 = 2;

/// Round `real` up to the next block boundary. Reads between the real
/// and virtual size return zeros.
#[must_use]
pub const fn virtual_size(real: u64) -> u64 {
    (real + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

/// Number of bytes a cache-map for `virtual_size` bytes occupies
/// (one bit per block, eight blocks per byte).
#[must_use]
pub const fn map_bytes(virtual_size: u64) -> usize {
    (((virtual_size + (BLOCK_SIZE * 8) - 1) / (BLOCK_SIZE * 8)) as usize)
}

/// Number of hash-blocks covering `virtual_size` bytes.
#[must_use]
pub const fn hash_block_count(virtual_size: u64) -> usize {
    (((virtual_size + HASH_BLOCK_SIZE - 1) / HASH_BLOCK_SIZE) as usize)
}

// ── Image identity ──────────────────────────────────────────────────────────

/// Runtime-unique image identifier, assigned when an image enters the
/// registry. Never reused within one server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check a canonical image name: slash-separated relative path, no
/// empty or dot-prefixed components, printable ASCII only.
#[must_use]
pub fn is_valid_image_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 200 {
        return false;
    }
    if name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_graphic() && !matches!(b, b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|'))
    {
        return false;
    }
    name.split('/').all(|comp| !comp.is_empty() && !comp.starts_with('.'))
}

/// Valid revision ids are 1..=65535; 0 on the wire means "latest".
#[must_use]
pub const fn is_valid_rid(rid: u16) -> bool {
    rid != 0
}

// ── Host addresses ──────────────────────────────────────────────────────────

/// Wire tag for an IPv4 host.
pub const ADDR_TYPE_V4: u8 = 2;
/// Wire tag for an IPv6 host.
pub const ADDR_TYPE_V6: u8 = 10;

/// An upstream endpoint, IPv4 or IPv6, preserving the tagged 16-byte
/// wire encoding used by `GET_SERVERS` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Host {
    V4([u8; 4], u16),
    V6([u8; 16], u16),
}

impl Host {
    /// Wire address-family tag.
    #[must_use]
    pub const fn addr_type(&self) -> u8 {
        match self {
            Self::V4(..) => ADDR_TYPE_V4,
            Self::V6(..) => ADDR_TYPE_V6,
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::V4(_, port) | Self::V6(_, port) => *port,
        }
    }

    /// The 16-byte wire address buffer; IPv4 occupies the low 4 bytes.
    #[must_use]
    pub fn addr_bytes(&self) -> [u8; 16] {
        match self {
            Self::V4(addr, _) => {
                let mut buf = [0_u8; 16];
                buf[..4].copy_from_slice(addr);
                buf
            }
            Self::V6(addr, _) => *addr,
        }
    }

    /// Reconstruct from the wire triple. Returns `None` for an unknown
    /// address-family tag.
    #[must_use]
    pub fn from_wire(addr_type: u8, addr: [u8; 16], port: u16) -> Option<Self> {
        match addr_type {
            ADDR_TYPE_V4 => {
                let mut v4 = [0_u8; 4];
                v4.copy_from_slice(&addr[..4]);
                Some(Self::V4(v4, port))
            }
            ADDR_TYPE_V6 => Some(Self::V6(addr, port)),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self {
            Self::V4(addr, port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*addr)), *port),
            Self::V6(addr, port) => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*addr)), *port),
        }
    }

    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::V4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Self::V6(ip.octets(), addr.port()),
        }
    }

    /// Prefix closeness of two addresses, counted in matching nibbles
    /// from the left. Mismatched address families score -1.
    #[must_use]
    pub fn closeness(&self, other: &Self) -> i32 {
        let (a, b, len) = match (self, other) {
            (Self::V4(a, _), Self::V4(b, _)) => (&a[..], &b[..], 4),
            (Self::V6(a, _), Self::V6(b, _)) => (&a[..], &b[..], 16),
            _ => return -1,
        };
        let mut score = 0;
        for i in 0..len {
            if (a[i] & 0xf0) != (b[i] & 0xf0) {
                return score;
            }
            score += 1;
            if (a[i] & 0x0f) != (b[i] & 0x0f) {
                return score;
            }
            score += 1;
        }
        score
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr, port) => write!(f, "{}:{}", Ipv4Addr::from(*addr), port),
            Self::V6(addr, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*addr), port),
        }
    }
}

impl std::str::FromStr for Host {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self::from_socket_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_size_rounds_up_to_block() {
        assert_eq!(virtual_size(0), 0);
        assert_eq!(virtual_size(1), BLOCK_SIZE);
        assert_eq!(virtual_size(4096), 4096);
        assert_eq!(virtual_size(9000), 12288);
    }

    #[test]
    fn map_bytes_covers_tail() {
        assert_eq!(map_bytes(0), 0);
        assert_eq!(map_bytes(BLOCK_SIZE), 1);
        assert_eq!(map_bytes(BLOCK_SIZE * 8), 1);
        assert_eq!(map_bytes(BLOCK_SIZE * 9), 2);
        assert_eq!(map_bytes(5 * BLOCK_SIZE), 1);
    }

    #[test]
    fn hash_block_count_covers_tail() {
        assert_eq!(hash_block_count(HASH_BLOCK_SIZE), 1);
        assert_eq!(hash_block_count(HASH_BLOCK_SIZE + 1), 2);
        assert_eq!(hash_block_count(3 * HASH_BLOCK_SIZE), 3);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_image_name("ubuntu/jammy/default"));
        assert!(is_valid_image_name("win10"));
        assert!(!is_valid_image_name(""));
        assert!(!is_valid_image_name("/abs"));
        assert!(!is_valid_image_name("trailing/"));
        assert!(!is_valid_image_name("a//b"));
        assert!(!is_valid_image_name(".hidden"));
        assert!(!is_valid_image_name("a/../b"));
        assert!(!is_valid_image_name("has space"));
        assert!(!is_valid_image_name("back\\slash"));
    }

    #[test]
    fn host_wire_roundtrip() {
        let v4 = Host::V4([10, 0, 0, 1], 5003);
        let v6 = Host::V6([0xfe; 16], 5003);
        for host in [v4, v6] {
            let rebuilt = Host::from_wire(host.addr_type(), host.addr_bytes(), host.port());
            assert_eq!(rebuilt, Some(host));
        }
        assert_eq!(Host::from_wire(7, [0; 16], 1), None);
    }

    #[test]
    fn closeness_counts_nibbles() {
        let a = Host::V4([10, 1, 2, 3], 0);
        let b = Host::V4([10, 1, 2, 3], 9);
        assert_eq!(a.closeness(&b), 8);
        let c = Host::V4([10, 1, 0x0f, 3], 0);
        assert_eq!(a.closeness(&c), 5);
        let d = Host::V4([11, 1, 2, 3], 0);
        assert_eq!(a.closeness(&d), 1);
        let e = Host::V4([0xa0, 0, 0, 0], 0);
        let f = Host::V4([0x50, 0, 0, 0], 0);
        assert_eq!(e.closeness(&f), 0);
        let v6 = Host::V6([0; 16], 0);
        assert_eq!(a.closeness(&v6), -1);
    }
}
