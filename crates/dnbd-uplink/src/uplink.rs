//! The per-image uplink worker.
//!
//! One thread per incomplete image multiplexes all client reads over a
//! single upstream connection. Client sessions enqueue requests and
//! transmit them directly under the send lock; the worker owns the
//! receive side, writes payloads into the cache and fans them back to
//! the waiting sinks. Only the worker ever installs or discards the
//! socket; the RTT prober hands over pre-connected sockets through the
//! verdict slot.
//!
//! Failure stance: an upstream error never fails a queued client
//! request. The socket is dropped, pending entries stay put, and the
//! next successful connection re-sends them unchanged. Clients only
//! see an error on queue overflow or worker shutdown.

use crate::altservers::AltServerRegistry;
use crate::queue::{InsertOutcome, RequestQueue};
use crate::rtt::{RTT_INTERVAL_INIT, RTT_INTERVAL_MAX, RttProber, RttVerdict};
use dnbd_error::{DnbdError, Result};
use dnbd_image::{Image, ReplySink, UplinkHandle, UplinkSeed, UplinkStarter};
use dnbd_proto::{Command, Reply, client};
use dnbd_types::Host;
use parking_lot::{Condvar, Mutex};
use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cache-map sidecar persistence interval while replicating.
const MAP_SAVE_INTERVAL: Duration = Duration::from_secs(90);
/// Largest synthesized background replication request.
const BGR_CHUNK: u32 = 512 * 1024;
/// How long the worker parks when it has no upstream socket.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Send/receive timeout towards the upstream.
    pub uplink_timeout: Duration,
    pub keepalive_interval: Duration,
    pub background_replication: bool,
    /// Background replication only runs while at least this many
    /// clients use the image.
    pub bgr_min_clients: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            uplink_timeout: Duration::from_millis(1250),
            keepalive_interval: Duration::from_secs(6),
            background_replication: true,
            bgr_min_clients: 0,
        }
    }
}

struct RttSlot {
    verdict: RttVerdict,
    current_server: Option<Host>,
    previous_server: Option<Host>,
    cycle_detected: bool,
    protocol: u16,
}

/// The uplink worker state shared between the worker thread, client
/// sessions and the RTT prober.
pub struct Uplink {
    image: Weak<Image>,
    name: String,
    rid: u16,
    queue: Mutex<RequestQueue>,
    send: Mutex<Option<TcpStream>>,
    rtt: Mutex<RttSlot>,
    has_socket: AtomicBool,
    stop: AtomicBool,
    idle: Mutex<()>,
    idle_signal: Condvar,
    bytes_received: AtomicU64,
    clients: AtomicUsize,
    replication_cursor: AtomicUsize,
    config: UplinkConfig,
    alts: Arc<AltServerRegistry>,
    prober: Arc<RttProber>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Uplink {
    /// Create the worker for `image` and start its thread. With a
    /// `seed`, the connection from the remote clone is adopted
    /// directly; otherwise the first probe round finds a server.
    pub fn spawn(
        image: &Arc<Image>,
        seed: Option<UplinkSeed>,
        alts: Arc<AltServerRegistry>,
        prober: Arc<RttProber>,
        config: UplinkConfig,
    ) -> Result<Arc<Self>> {
        let uplink = Arc::new(Self {
            image: Arc::downgrade(image),
            name: image.name().to_owned(),
            rid: image.rid(),
            queue: Mutex::new(RequestQueue::new()),
            send: Mutex::new(None),
            rtt: Mutex::new(RttSlot {
                verdict: RttVerdict::Idle,
                current_server: None,
                previous_server: None,
                cycle_detected: false,
                protocol: 0,
            }),
            has_socket: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            idle: Mutex::new(()),
            idle_signal: Condvar::new(),
            bytes_received: AtomicU64::new(0),
            clients: AtomicUsize::new(0),
            replication_cursor: AtomicUsize::new(0),
            config,
            alts,
            prober,
            join: Mutex::new(None),
        });

        let read_sock = match seed {
            Some(seed) => {
                let read = uplink.install_socket(seed.stream, seed.server, seed.protocol)?;
                image.set_working(true);
                Some(read)
            }
            None => None,
        };

        let worker = Arc::clone(&uplink);
        let join = std::thread::Builder::new()
            .name(format!("dnbd-uplink-{}", image.id()))
            .spawn(move || worker.run(read_sock))?;
        *uplink.join.lock() = Some(join);
        Ok(uplink)
    }

    // ── Accessors for the prober ────────────────────────────────────

    pub(crate) fn image(&self) -> Option<Arc<Image>> {
        self.image.upgrade()
    }

    pub(crate) fn has_socket(&self) -> bool {
        self.has_socket.load(Ordering::Acquire)
    }

    pub(crate) fn current_server(&self) -> Option<Host> {
        self.rtt.lock().current_server
    }

    pub(crate) fn cycle_detected(&self) -> bool {
        self.rtt.lock().cycle_detected
    }

    pub(crate) fn clear_cycle_detected(&self) {
        self.rtt.lock().cycle_detected = false;
    }

    /// Move the verdict to `InProgress` if no probe is outstanding.
    pub(crate) fn begin_probe(&self) -> bool {
        let mut slot = self.rtt.lock();
        match slot.verdict {
            RttVerdict::InProgress | RttVerdict::DoChange { .. } => false,
            _ => {
                slot.verdict = RttVerdict::InProgress;
                true
            }
        }
    }

    pub(crate) fn set_verdict(&self, verdict: RttVerdict) {
        self.rtt.lock().verdict = verdict;
        self.idle_signal.notify_one();
    }

    fn take_verdict(&self) -> Option<RttVerdict> {
        let mut slot = self.rtt.lock();
        if matches!(slot.verdict, RttVerdict::Idle | RttVerdict::InProgress) {
            return None;
        }
        Some(std::mem::replace(&mut slot.verdict, RttVerdict::Idle))
    }

    // ── Socket management (worker + clone path only) ────────────────

    fn install_socket(&self, stream: TcpStream, server: Host, protocol: u16) -> Result<TcpStream> {
        stream.set_read_timeout(Some(self.config.uplink_timeout))?;
        stream.set_write_timeout(Some(self.config.uplink_timeout))?;
        let read_half = stream.try_clone()?;
        {
            let mut send = self.send.lock();
            if let Some(old) = send.take() {
                let _ = old.shutdown(Shutdown::Both);
            }
            *send = Some(stream);
        }
        self.has_socket.store(true, Ordering::Release);
        let mut slot = self.rtt.lock();
        // A switch back to the server we just left is the A-B-A cycle
        // the prober penalizes on its next pass.
        slot.cycle_detected =
            slot.current_server.is_some() && slot.previous_server == Some(server);
        slot.previous_server = slot.current_server;
        slot.current_server = Some(server);
        slot.protocol = protocol;
        drop(slot);
        info!(
            target: "dnbd::uplink",
            event = "connected",
            image = %self.name,
            rid = self.rid,
            server = %server,
        );
        Ok(read_half)
    }

    fn kill_socket(&self) {
        if let Some(stream) = self.send.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.has_socket.store(false, Ordering::Release);
    }

    /// Transmit queued requests: only New entries in normal operation,
    /// everything in flight after a connection switch.
    fn send_requests(&self, new_only: bool) {
        let batch = self.queue.lock().take_sendable(new_only);
        if batch.is_empty() {
            return;
        }
        let mut guard = self.send.lock();
        let Some(stream) = guard.as_mut() else {
            // No connection; the entries stay Pending and are re-sent
            // wholesale once one exists.
            return;
        };
        for (offset, size) in batch {
            // The reply only echoes the handle, so the offset doubles
            // as the upstream handle.
            if let Err(err) = client::request_block(stream, offset, size, offset, 0) {
                debug!(
                    target: "dnbd::uplink",
                    event = "send_failed",
                    image = %self.name,
                    error = %err,
                );
                if let Some(stream) = guard.take() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                self.has_socket.store(false, Ordering::Release);
                break;
            }
        }
    }

    fn send_keepalive_packet(&self) -> Result<()> {
        let mut guard = self.send.lock();
        match guard.as_mut() {
            Some(stream) => client::send_keepalive(stream),
            None => Ok(()),
        }
    }

    // ── Worker main loop ────────────────────────────────────────────

    fn run(self: Arc<Self>, mut read_sock: Option<TcpStream>) {
        let mut alt_interval = RTT_INTERVAL_INIT;
        let mut next_alt_check = Instant::now();
        let mut next_keepalive = Instant::now() + self.config.keepalive_interval;
        let mut next_map_save = Instant::now() + MAP_SAVE_INTERVAL;

        while !self.stop.load(Ordering::Acquire) {
            match self.take_verdict() {
                Some(RttVerdict::DoChange {
                    stream,
                    server,
                    protocol,
                    rtt,
                }) => {
                    match self.install_socket(stream, server, protocol) {
                        Ok(read) => {
                            read_sock = Some(read);
                            if let Some(image) = self.image() {
                                image.set_working(true);
                            }
                            debug!(
                                target: "dnbd::uplink",
                                event = "switched",
                                image = %self.name,
                                server = %server,
                                rtt,
                            );
                            // Everything in flight is repeated on the
                            // new connection, handles unchanged.
                            self.send_requests(false);
                            next_keepalive = Instant::now() + self.config.keepalive_interval;
                        }
                        Err(err) => {
                            warn!(
                                target: "dnbd::uplink",
                                event = "switch_failed",
                                image = %self.name,
                                error = %err,
                            );
                            self.kill_socket();
                            read_sock = None;
                        }
                    }
                    next_alt_check = Instant::now() + alt_interval;
                }
                Some(RttVerdict::NotReachable) => {
                    warn!(
                        target: "dnbd::uplink",
                        event = "no_server_reachable",
                        image = %self.name,
                        rid = self.rid,
                    );
                    if let Some(image) = self.image() {
                        image.set_working(false);
                    }
                    // Keep retrying briskly while disconnected; the
                    // interval only stretches with a standing
                    // connection.
                    next_alt_check = Instant::now() + 2 * IDLE_WAIT;
                }
                Some(RttVerdict::DontChange) => {
                    if read_sock.is_some() {
                        if let Some(image) = self.image() {
                            image.set_working(true);
                        }
                    }
                }
                _ => {}
            }

            let Some(image) = self.image() else {
                break;
            };

            if let Some(sock) = read_sock.as_mut() {
                match self.receive_pass(sock, &image) {
                    Ok(()) => {}
                    Err(err) => {
                        info!(
                            target: "dnbd::uplink",
                            event = "connection_lost",
                            image = %self.name,
                            error = %err,
                        );
                        if let Some(server) = self.current_server() {
                            self.alts.report_failure(&server);
                        }
                        self.kill_socket();
                        read_sock = None;
                        next_alt_check = Instant::now();
                    }
                }
                if !self.has_socket() {
                    // A failed direct send from a client session also
                    // invalidates our read half.
                    read_sock = None;
                }
            } else {
                drop(image);
                let mut idle = self.idle.lock();
                self.idle_signal.wait_for(&mut idle, IDLE_WAIT);
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let Some(image) = self.image() else {
                break;
            };

            let now = Instant::now();
            if read_sock.is_some() && now >= next_keepalive {
                if let Err(err) = self.send_keepalive_packet() {
                    debug!(
                        target: "dnbd::uplink",
                        event = "keepalive_failed",
                        image = %self.name,
                        error = %err,
                    );
                    self.kill_socket();
                    read_sock = None;
                    next_alt_check = now;
                }
                next_keepalive = now + self.config.keepalive_interval;
            }

            if now >= next_alt_check {
                if image.finalize_if_complete() {
                    info!(
                        target: "dnbd::uplink",
                        event = "replication_finished",
                        image = %self.name,
                        rid = self.rid,
                    );
                    break;
                }
                self.prober.request_probe(&self);
                alt_interval = (alt_interval + Duration::from_secs(1)).min(RTT_INTERVAL_MAX);
                next_alt_check = now + alt_interval;
            }

            if now >= next_map_save {
                if let Err(err) = image.save_cache_map() {
                    warn!(
                        target: "dnbd::uplink",
                        event = "map_save_failed",
                        image = %self.name,
                        error = %err,
                    );
                }
                next_map_save = now + MAP_SAVE_INTERVAL;
            }

            if self.config.background_replication && read_sock.is_some() {
                self.maybe_replicate(&image);
            }
        }

        // Wind down: nothing queued survives the worker.
        self.stop.store(true, Ordering::Release);
        self.kill_socket();
        let failed = self.queue.lock().fail_all();
        for (handle, sink) in failed {
            sink.fail(handle);
        }
        if let Some(image) = self.image() {
            let _ = image.save_cache_map();
            image.clear_uplink();
        }
        self.prober.forget(&self);
        info!(
            target: "dnbd::uplink",
            event = "worker_exited",
            image = %self.name,
            rid = self.rid,
        );
    }

    /// Receive at most one reply; a quiet socket simply times out.
    fn receive_pass(&self, sock: &mut TcpStream, image: &Arc<Image>) -> Result<()> {
        let mut probe = [0_u8; 1];
        match sock.peek(&mut probe) {
            Ok(0) => {
                return Err(DnbdError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "remote closed connection",
                )));
            }
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let reply = Reply::read_from(sock)?;
        let mut payload = vec![0_u8; reply.size as usize];
        sock.read_exact(&mut payload)?;
        if reply.cmd != Command::GetBlock {
            // Keepalive echoes and other chatter are not interesting.
            return Ok(());
        }
        self.handle_block_reply(image, reply.handle, &payload);
        Ok(())
    }

    fn handle_block_reply(&self, image: &Arc<Image>, start: u64, payload: &[u8]) {
        let end = start + payload.len() as u64;
        if end > image.virtual_size() {
            warn!(
                target: "dnbd::uplink",
                event = "reply_out_of_range",
                image = %self.name,
                start,
                len = payload.len(),
            );
            return;
        }
        self.bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        // Persist before answering anyone; the cache-map bit must not
        // precede the bytes.
        if let Err(err) = image.write_cache(start, payload) {
            warn!(
                target: "dnbd::uplink",
                event = "cache_write_failed",
                image = %self.name,
                offset = start,
                error = %err,
            );
        }

        let mut queue = self.queue.lock();
        let in_flight_age = queue.match_reply(start, end);
        if let (Some(age), Some(server)) = (in_flight_age, self.current_server()) {
            let sample = age.as_micros().min(u128::from(u64::MAX)) as u64;
            self.alts.update_live_rtt(&server, sample);
        }
        // Answer in reverse slot order so the tail can shrink as its
        // entries free up.
        let mut idx = queue.len();
        while idx > 0 {
            idx -= 1;
            if queue.status(idx) != crate::queue::SlotStatus::Processing {
                continue;
            }
            let (handle, from, to, sink) = queue.take_for_dispatch(idx);
            if let Some(sink) = sink {
                // The per-sink send lock ranks below the queue lock;
                // release ours for the copy-out.
                drop(queue);
                sink.deliver(handle, &payload[(from - start) as usize..(to - start) as usize]);
                queue = self.queue.lock();
            }
            queue.shrink_tail(idx);
        }
    }

    /// Synthesize a replication request when no client traffic is
    /// waiting and enough clients justify the bandwidth.
    fn maybe_replicate(&self, image: &Arc<Image>) {
        {
            let queue = self.queue.lock();
            if queue.active_client_entries() > 0 || queue.has_background_entry() {
                return;
            }
        }
        if self.clients.load(Ordering::Relaxed) < self.config.bgr_min_clients {
            return;
        }
        let cursor = self.replication_cursor.load(Ordering::Relaxed);
        let target = image.with_cache_map(|map| {
            map.and_then(|m| {
                let block = m.missing_hash_block_after(cursor)?;
                let (start, len) = m.missing_range_in_hash_block(block, BGR_CHUNK)?;
                Some((block, start, len))
            })
        });
        let Some((block, start, len)) = target else {
            return;
        };
        self.replication_cursor.store(block, Ordering::Relaxed);
        match self.queue.lock().insert(None, start, start, len) {
            Ok(InsertOutcome::Fresh) => self.send_requests(true),
            Ok(InsertOutcome::Attached) => {}
            Err(_) => {}
        }
    }
}

impl UplinkHandle for Uplink {
    fn request(
        &self,
        sink: Arc<dyn ReplySink>,
        handle: u64,
        offset: u64,
        length: u32,
    ) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(DnbdError::Cancelled);
        }
        let image = self.image.upgrade().ok_or(DnbdError::Cancelled)?;
        if length == 0
            || offset
                .checked_add(u64::from(length))
                .is_none_or(|end| end > image.virtual_size())
        {
            return Err(DnbdError::OutOfRange);
        }
        let outcome = self
            .queue
            .lock()
            .insert(Some(sink), handle, offset, length)?;
        if outcome == InsertOutcome::Fresh {
            self.send_requests(true);
            self.idle_signal.notify_one();
        }
        Ok(())
    }

    fn signal_shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.kill_socket();
        self.idle_signal.notify_one();
    }

    fn is_shut_down(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn current_server(&self) -> Option<Host> {
        if self.has_socket() {
            self.rtt.lock().current_server
        } else {
            None
        }
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn client_attached(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    fn client_detached(&self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── Factory ─────────────────────────────────────────────────────────────────

/// Wires new uplink workers to the shared alt-server pool and prober.
pub struct UplinkFactory {
    alts: Arc<AltServerRegistry>,
    prober: Arc<RttProber>,
    config: UplinkConfig,
}

impl UplinkFactory {
    #[must_use]
    pub fn new(
        alts: Arc<AltServerRegistry>,
        prober: Arc<RttProber>,
        config: UplinkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            alts,
            prober,
            config,
        })
    }
}

impl UplinkStarter for UplinkFactory {
    fn start(
        &self,
        image: &Arc<Image>,
        seed: Option<UplinkSeed>,
    ) -> Result<Arc<dyn UplinkHandle>> {
        if !image.has_cache_map() {
            return Err(DnbdError::Protocol(format!(
                "uplink requested for complete image {}:{}",
                image.name(),
                image.rid()
            )));
        }
        let uplink = Uplink::spawn(
            image,
            seed,
            Arc::clone(&self.alts),
            Arc::clone(&self.prober),
            self.config.clone(),
        )?;
        Ok(uplink)
    }
}
