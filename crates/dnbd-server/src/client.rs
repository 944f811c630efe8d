//! Client sessions: the select-image handshake and the read loop.
//!
//! Each session runs on a pool thread. Reads come straight from the
//! cache when the blocks are present; everything else goes through the
//! image's uplink, which calls back into [`ClientConn`] to deliver the
//! payload. The send half is guarded by a mutex because the uplink
//! worker and the session thread both write replies.

use crate::config::Config;
use dnbd_error::{DnbdError, Result};
use dnbd_image::{Image, Registry, ReplySink};
use dnbd_proto::{
    Command, ImageOffer, Reply, Request, decode_select_image, encode_crc_list, encode_image_offer,
    encode_server_list,
};
use dnbd_types::{Host, PROTOCOL_VERSION};
use dnbd_uplink::AltServerRegistry;
use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Alt-servers advertised per `GET_SERVERS` request.
const SERVERS_PER_REPLY: usize = 3;

/// The send half of a client connection, shared with uplink workers.
pub struct ClientConn {
    send: Mutex<TcpStream>,
    peer: Host,
}

impl ClientConn {
    fn send_reply(&self, cmd: Command, handle: u64, payload: &[u8]) -> Result<()> {
        let mut header = Vec::with_capacity(Reply::WIRE_LEN);
        Reply::new(cmd, payload.len() as u32, handle).write_to(&mut header)?;
        let mut stream = self.send.lock();
        stream.write_all(&header)?;
        if !payload.is_empty() {
            stream.write_all(payload)?;
        }
        Ok(())
    }

    fn send_error(&self, handle: u64) {
        if self.send_reply(Command::Error, handle, &[]).is_err() {
            debug!(
                target: "dnbd::client",
                event = "error_reply_failed",
                peer = %self.peer,
            );
        }
    }
}

impl ReplySink for ClientConn {
    fn deliver(&self, handle: u64, data: &[u8]) {
        if self.send_reply(Command::GetBlock, handle, data).is_err() {
            debug!(
                target: "dnbd::client",
                event = "deliver_failed",
                peer = %self.peer,
                handle,
            );
        }
    }

    fn fail(&self, handle: u64) {
        self.send_error(handle);
    }
}

/// Serve one client connection until it closes or errors.
pub fn handle_client(
    stream: TcpStream,
    registry: &Arc<Registry>,
    alts: &Arc<AltServerRegistry>,
    config: &Config,
) {
    let peer = match stream.peer_addr() {
        Ok(addr) => Host::from_socket_addr(addr),
        Err(_) => return,
    };
    if let Err(err) = session_loop(stream, peer, registry, alts, config) {
        debug!(
            target: "dnbd::client",
            event = "session_ended",
            peer = %peer,
            error = %err,
        );
    }
}

fn session_loop(
    stream: TcpStream,
    peer: Host,
    registry: &Arc<Registry>,
    alts: &Arc<AltServerRegistry>,
    config: &Config,
) -> Result<()> {
    stream.set_nodelay(true)?;
    // Writes must not stall forever on a dead client; reads block
    // until the client hangs up.
    stream.set_write_timeout(Some(config.client_timeout()))?;
    let conn = Arc::new(ClientConn {
        send: Mutex::new(stream.try_clone()?),
        peer,
    });
    let mut read = stream;
    let mut selected: Option<Arc<Image>> = None;

    let result = (|| -> Result<()> {
        loop {
            let request = match Request::read_from(&mut read) {
                Ok(request) => request,
                Err(DnbdError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            match request.cmd {
                Command::SelectImage => {
                    if request.size > 4096 {
                        return Err(DnbdError::Protocol(
                            "oversized select-image payload".to_owned(),
                        ));
                    }
                    let mut payload = vec![0_u8; request.size as usize];
                    std::io::Read::read_exact(&mut read, &mut payload)?;
                    let (_proto, name, rid, _flags) = decode_select_image(&payload)?;
                    match select_image(registry, &name, rid) {
                        Ok(image) => {
                            if let Some(previous) = selected.take() {
                                if let Some(uplink) = previous.uplink() {
                                    uplink.client_detached();
                                }
                            }
                            if let Some(uplink) = image.uplink() {
                                uplink.client_attached();
                            }
                            image.touch();
                            let offer = ImageOffer {
                                protocol: PROTOCOL_VERSION,
                                name: image.name().to_owned(),
                                rid: image.rid(),
                                virtual_size: image.virtual_size(),
                            };
                            conn.send_reply(
                                Command::SelectImage,
                                request.handle,
                                &encode_image_offer(&offer)?,
                            )?;
                            info!(
                                target: "dnbd::client",
                                event = "image_selected",
                                peer = %peer,
                                name = %image.name(),
                                rid = image.rid(),
                            );
                            selected = Some(image);
                        }
                        Err(err) => {
                            debug!(
                                target: "dnbd::client",
                                event = "select_rejected",
                                peer = %peer,
                                name = %name,
                                rid,
                                error = %err,
                            );
                            conn.send_error(request.handle);
                        }
                    }
                }
                Command::GetBlock => {
                    let Some(image) = selected.as_ref() else {
                        conn.send_error(request.handle);
                        return Err(DnbdError::Protocol(
                            "block request before select".to_owned(),
                        ));
                    };
                    serve_block(image, &conn, &request);
                }
                Command::GetServers => {
                    let list = alts.list_for_client(&peer, SERVERS_PER_REPLY);
                    conn.send_reply(
                        Command::GetServers,
                        request.handle,
                        &encode_server_list(&list)?,
                    )?;
                }
                Command::GetCrc32 => {
                    let payload = selected
                        .as_ref()
                        .and_then(|image| image.crc_manifest())
                        .map(|manifest| encode_crc_list(manifest.master(), manifest.crcs()))
                        .transpose()?
                        .unwrap_or_default();
                    conn.send_reply(Command::GetCrc32, request.handle, &payload)?;
                }
                Command::Keepalive | Command::Error => {}
            }
        }
    })();

    if let Some(image) = selected {
        if let Some(uplink) = image.uplink() {
            uplink.client_detached();
        }
    }
    result
}

fn select_image(registry: &Arc<Registry>, name: &str, rid: u16) -> Result<Arc<Image>> {
    let image = registry.get_or_load(name, rid)?;
    if !image.is_working() && !image.has_cache_map() {
        return Err(DnbdError::NotWorking {
            name: image.name().to_owned(),
            rid: image.rid(),
        });
    }
    Ok(image)
}

fn serve_block(image: &Arc<Image>, conn: &Arc<ClientConn>, request: &Request) {
    let offset = request.offset;
    let size = request.size;
    let Some(end) = offset.checked_add(u64::from(size)) else {
        conn.send_error(request.handle);
        return;
    };
    if size == 0 || size > dnbd_proto::MAX_PAYLOAD || end > image.virtual_size() {
        conn.send_error(request.handle);
        return;
    }
    image.touch();

    if image.is_range_cached(offset, end) {
        let mut buf = vec![0_u8; size as usize];
        match image.read_at(offset, &mut buf) {
            Ok(()) => conn.deliver(request.handle, &buf),
            Err(err) => {
                warn!(
                    target: "dnbd::client",
                    event = "cache_read_failed",
                    name = %image.name(),
                    rid = image.rid(),
                    offset,
                    error = %err,
                );
                image.set_working(false);
                conn.send_error(request.handle);
            }
        }
        return;
    }

    match image.uplink() {
        Some(uplink) => {
            if let Err(err) =
                uplink.request(conn.clone() as Arc<dyn ReplySink>, request.handle, offset, size)
            {
                debug!(
                    target: "dnbd::client",
                    event = "uplink_request_failed",
                    name = %image.name(),
                    offset,
                    error = %err,
                );
                conn.send_error(request.handle);
            }
        }
        None => conn.send_error(request.handle),
    }
}
