#![forbid(unsafe_code)]
//! Wire protocol codec for the dnbd replication proxy.
//!
//! Fixed-layout packets: a 24-byte request (`magic cmd size offset
//! handle`, the offset's high byte doubling as a hop counter) and a
//! 16-byte reply (`magic cmd size handle`). All integers little-endian.
//!
//! The variable-length payloads (select-image exchange, server lists,
//! CRC lists) are encoded by the helpers in this module; the blocking
//! client-side exchanges built on top live in [`client`].

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use dnbd_error::{DnbdError, Result};
use dnbd_types::{Host, PROTOCOL_MAGIC};
use std::io::{Read, Write};

pub mod client;

/// Upper bound on any reply payload we are willing to receive.
/// Anything larger is treated as a protocol violation.
pub const MAX_PAYLOAD: u32 = 9_000_000;

/// Select-image flag: the requester is itself a server (replication).
pub const FLAG_SERVER: u8 = 1;

// ── Commands ────────────────────────────────────────────────────────────────

/// Protocol command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    GetBlock = 1,
    SelectImage = 2,
    GetServers = 3,
    Error = 4,
    Keepalive = 5,
    GetCrc32 = 8,
}

impl Command {
    #[must_use]
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::GetBlock),
            2 => Some(Self::SelectImage),
            3 => Some(Self::GetServers),
            4 => Some(Self::Error),
            5 => Some(Self::Keepalive),
            8 => Some(Self::GetCrc32),
            _ => None,
        }
    }
}

// ── Fixed-layout packets ────────────────────────────────────────────────────

/// A 24-byte request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    pub size: u32,
    pub offset: u64,
    pub hops: u8,
    pub handle: u64,
}

impl Request {
    pub const WIRE_LEN: usize = 24;

    #[must_use]
    pub fn new(cmd: Command, offset: u64, size: u32, handle: u64) -> Self {
        Self {
            cmd,
            size,
            offset,
            hops: 0,
            handle,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        debug_assert_eq!(self.offset >> 56, 0, "offset high byte reserved for hops");
        w.write_u16::<LittleEndian>(PROTOCOL_MAGIC)?;
        w.write_u16::<LittleEndian>(self.cmd as u16)?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u64::<LittleEndian>(self.offset | (u64::from(self.hops) << 56))?;
        w.write_u64::<LittleEndian>(self.handle)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = r.read_u16::<LittleEndian>()?;
        if magic != PROTOCOL_MAGIC {
            return Err(DnbdError::Protocol(format!("bad request magic {magic:#06x}")));
        }
        let raw_cmd = r.read_u16::<LittleEndian>()?;
        let cmd = Command::from_wire(raw_cmd)
            .ok_or_else(|| DnbdError::Protocol(format!("unknown command {raw_cmd}")))?;
        let size = r.read_u32::<LittleEndian>()?;
        let offset_hops = r.read_u64::<LittleEndian>()?;
        let handle = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            cmd,
            size,
            offset: offset_hops & 0x00ff_ffff_ffff_ffff,
            hops: (offset_hops >> 56) as u8,
            handle,
        })
    }
}

/// A 16-byte reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub cmd: Command,
    pub size: u32,
    pub handle: u64,
}

impl Reply {
    pub const WIRE_LEN: usize = 16;

    #[must_use]
    pub fn new(cmd: Command, size: u32, handle: u64) -> Self {
        Self { cmd, size, handle }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(PROTOCOL_MAGIC)?;
        w.write_u16::<LittleEndian>(self.cmd as u16)?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u64::<LittleEndian>(self.handle)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = r.read_u16::<LittleEndian>()?;
        if magic != PROTOCOL_MAGIC {
            return Err(DnbdError::Protocol(format!("bad reply magic {magic:#06x}")));
        }
        let raw_cmd = r.read_u16::<LittleEndian>()?;
        let cmd = Command::from_wire(raw_cmd)
            .ok_or_else(|| DnbdError::Protocol(format!("unknown reply command {raw_cmd}")))?;
        let size = r.read_u32::<LittleEndian>()?;
        let handle = r.read_u64::<LittleEndian>()?;
        if size > MAX_PAYLOAD {
            return Err(DnbdError::Protocol(format!("oversized payload ({size} bytes)")));
        }
        Ok(Self { cmd, size, handle })
    }
}

// ── Select-image payloads ───────────────────────────────────────────────────

/// What a server offers in response to `SELECT_IMAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOffer {
    pub protocol: u16,
    pub name: String,
    pub rid: u16,
    pub virtual_size: u64,
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| DnbdError::Protocol("string too long for wire".to_owned()))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn get_string<R: Read>(r: &mut R) -> Result<String> {
    let len = usize::from(r.read_u16::<LittleEndian>()?);
    let mut raw = vec![0_u8; len];
    r.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| DnbdError::Protocol("string is not utf-8".to_owned()))
}

/// Serialize the `SELECT_IMAGE` request payload: protocol version,
/// image name, requested rid (0 = latest), flags.
pub fn encode_select_image(name: &str, rid: u16, flags: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(name.len() + 8);
    buf.write_u16::<LittleEndian>(dnbd_types::PROTOCOL_VERSION)?;
    put_string(&mut buf, name)?;
    buf.write_u16::<LittleEndian>(rid)?;
    buf.push(flags);
    Ok(buf)
}

/// Parse the `SELECT_IMAGE` request payload on the server side.
/// Returns `(protocol, name, rid, flags)`.
pub fn decode_select_image(payload: &[u8]) -> Result<(u16, String, u16, u8)> {
    let mut r = payload;
    let protocol = r.read_u16::<LittleEndian>()?;
    let name = get_string(&mut r)?;
    let rid = r.read_u16::<LittleEndian>()?;
    let flags = r.read_u8()?;
    Ok((protocol, name, rid, flags))
}

/// Serialize the `SELECT_IMAGE` reply payload. The rid is always the
/// concrete revision being served, never 0.
pub fn encode_image_offer(offer: &ImageOffer) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(offer.name.len() + 16);
    buf.write_u16::<LittleEndian>(offer.protocol)?;
    put_string(&mut buf, &offer.name)?;
    buf.write_u16::<LittleEndian>(offer.rid)?;
    buf.write_u64::<LittleEndian>(offer.virtual_size)?;
    Ok(buf)
}

pub fn decode_image_offer(payload: &[u8]) -> Result<ImageOffer> {
    let mut r = payload;
    let protocol = r.read_u16::<LittleEndian>()?;
    let name = get_string(&mut r)?;
    let rid = r.read_u16::<LittleEndian>()?;
    let virtual_size = r.read_u64::<LittleEndian>()?;
    Ok(ImageOffer {
        protocol,
        name,
        rid,
        virtual_size,
    })
}

// ── Server lists ────────────────────────────────────────────────────────────

/// On-wire size of one server entry: 16-byte address, port in network
/// byte order, address-family tag.
pub const SERVER_ENTRY_LEN: usize = 19;

/// Serialize a `GET_SERVERS` reply payload.
pub fn encode_server_list(hosts: &[Host]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(hosts.len() * SERVER_ENTRY_LEN);
    for host in hosts {
        buf.extend_from_slice(&host.addr_bytes());
        buf.write_u16::<BigEndian>(host.port())?;
        buf.push(host.addr_type());
    }
    Ok(buf)
}

/// Parse a `GET_SERVERS` reply payload. Trailing bytes that do not
/// form a whole entry are discarded, as are entries with an unknown
/// address-family tag.
#[must_use]
pub fn decode_server_list(payload: &[u8]) -> Vec<Host> {
    payload
        .chunks_exact(SERVER_ENTRY_LEN)
        .filter_map(|entry| {
            let mut addr = [0_u8; 16];
            addr.copy_from_slice(&entry[..16]);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            Host::from_wire(entry[18], addr, port)
        })
        .collect()
}

// ── CRC list payload ────────────────────────────────────────────────────────

/// Serialize a `GET_CRC32` reply payload: master CRC followed by one
/// word per hash-block, little-endian.
pub fn encode_crc_list(master: u32, crcs: &[u32]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity((crcs.len() + 1) * 4);
    buf.write_u32::<LittleEndian>(master)?;
    for crc in crcs {
        buf.write_u32::<LittleEndian>(*crc)?;
    }
    Ok(buf)
}

/// Parse a `GET_CRC32` reply payload into `(master, words)`.
pub fn decode_crc_list(payload: &[u8]) -> Result<(u32, Vec<u32>)> {
    if payload.len() < 4 || payload.len() % 4 != 0 {
        return Err(DnbdError::Protocol(format!(
            "crc list payload has odd length {}",
            payload.len()
        )));
    }
    let mut r = payload;
    let master = r.read_u32::<LittleEndian>()?;
    let mut crcs = Vec::with_capacity(payload.len() / 4 - 1);
    while !r.is_empty() {
        crcs.push(r.read_u32::<LittleEndian>()?);
    }
    Ok((master, crcs))
}
