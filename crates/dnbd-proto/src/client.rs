//! Blocking client-side exchanges, used by the RTT probe, the remote
//! clone path, and the uplink worker.

use crate::{
    Command, ImageOffer, Reply, Request, decode_crc_list, decode_image_offer, decode_server_list,
    encode_select_image,
};
use dnbd_error::{DnbdError, Result};
use dnbd_types::{Host, MIN_SUPPORTED_SERVER};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::debug;

/// Connect to `host` with separate connect and I/O timeouts.
pub fn connect(host: &Host, connect_timeout: Duration, io_timeout: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&host.to_socket_addr(), connect_timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(stream)
}

/// Send `SELECT_IMAGE` and parse the offer from the reply. Validates
/// only the packet structure; name/rid/size checks are the caller's.
pub fn select_image(stream: &mut TcpStream, name: &str, rid: u16, flags: u8) -> Result<ImageOffer> {
    let payload = encode_select_image(name, rid, flags)?;
    let header = Request {
        cmd: Command::SelectImage,
        size: payload.len() as u32,
        offset: 0,
        hops: 0,
        handle: 0,
    };
    let mut packet = Vec::with_capacity(Request::WIRE_LEN + payload.len());
    header.write_to(&mut packet)?;
    packet.extend_from_slice(&payload);
    stream.write_all(&packet)?;

    let reply = Reply::read_from(stream)?;
    if reply.cmd == Command::Error {
        discard_payload(stream, reply.size)?;
        return Err(DnbdError::NotFound(name.to_owned()));
    }
    if reply.cmd != Command::SelectImage {
        return Err(DnbdError::Protocol(format!(
            "expected select-image reply, got {:?}",
            reply.cmd
        )));
    }
    let mut payload = vec![0_u8; reply.size as usize];
    stream.read_exact(&mut payload)?;
    let offer = decode_image_offer(&payload)?;
    if offer.protocol < MIN_SUPPORTED_SERVER {
        return Err(DnbdError::ProtocolVersion {
            got: offer.protocol,
            min: MIN_SUPPORTED_SERVER,
        });
    }
    Ok(offer)
}

/// Send a `GET_BLOCK` request. The reply arrives asynchronously and is
/// matched by handle.
pub fn request_block(
    stream: &mut TcpStream,
    offset: u64,
    size: u32,
    handle: u64,
    hops: u8,
) -> Result<()> {
    let mut buf = [0_u8; Request::WIRE_LEN];
    let mut w = &mut buf[..];
    Request {
        cmd: Command::GetBlock,
        size,
        offset,
        hops,
        handle,
    }
    .write_to(&mut w)?;
    stream.write_all(&buf)?;
    Ok(())
}

/// Send a zero-length keepalive.
pub fn send_keepalive(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0_u8; Request::WIRE_LEN];
    let mut w = &mut buf[..];
    Request::new(Command::Keepalive, 0, 0, 0).write_to(&mut w)?;
    stream.write_all(&buf)?;
    Ok(())
}

/// Read the next reply header.
pub fn read_reply(stream: &mut TcpStream) -> Result<Reply> {
    Reply::read_from(stream)
}

/// Read and throw away `size` payload bytes.
pub fn discard_payload(stream: &mut TcpStream, size: u32) -> Result<()> {
    let mut remaining = size as usize;
    let mut sink = [0_u8; 4096];
    while remaining > 0 {
        let n = remaining.min(sink.len());
        stream.read_exact(&mut sink[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Request the CRC-32 list for the currently selected image. Returns
/// `None` when the remote has no list for it.
pub fn fetch_crc_list(stream: &mut TcpStream) -> Result<Option<(u32, Vec<u32>)>> {
    let mut buf = [0_u8; Request::WIRE_LEN];
    let mut w = &mut buf[..];
    Request::new(Command::GetCrc32, 0, 0, 0).write_to(&mut w)?;
    stream.write_all(&buf)?;

    let reply = Reply::read_from(stream)?;
    if reply.cmd != Command::GetCrc32 {
        return Err(DnbdError::Protocol(format!(
            "expected crc32 reply, got {:?}",
            reply.cmd
        )));
    }
    if reply.size == 0 {
        debug!(target: "dnbd::proto", event = "no_crc_list");
        return Ok(None);
    }
    let mut payload = vec![0_u8; reply.size as usize];
    stream.read_exact(&mut payload)?;
    decode_crc_list(&payload).map(Some)
}

/// Request the remote's alt-server list.
pub fn fetch_server_list(stream: &mut TcpStream) -> Result<Vec<Host>> {
    let mut buf = [0_u8; Request::WIRE_LEN];
    let mut w = &mut buf[..];
    Request::new(Command::GetServers, 0, 0, 0).write_to(&mut w)?;
    stream.write_all(&buf)?;

    let reply = Reply::read_from(stream)?;
    if reply.cmd != Command::GetServers {
        return Err(DnbdError::Protocol(format!(
            "expected server list reply, got {:?}",
            reply.cmd
        )));
    }
    let mut payload = vec![0_u8; reply.size as usize];
    stream.read_exact(&mut payload)?;
    Ok(decode_server_list(&payload))
}
