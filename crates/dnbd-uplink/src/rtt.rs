//! RTT probing and the server-switch decision.
//!
//! One background thread serves probe requests from all uplinks. A
//! probe connects to up to four candidates, performs the select-image
//! handshake, fetches block 0 and times the whole exchange. The
//! verdict is handed back through the uplink's state; only the uplink
//! worker itself ever touches its socket.

use crate::altservers::{AltServerRegistry, RTT_UNREACHABLE};
use crate::uplink::Uplink;
use dnbd_error::{DnbdError, Result};
use dnbd_image::Image;
use dnbd_proto::{Command, client};
use dnbd_types::{BLOCK_SIZE, Host};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Probe scheduling starts at this interval and stretches to the
/// maximum while a connection stays put.
pub const RTT_INTERVAL_INIT: Duration = Duration::from_secs(5);
pub const RTT_INTERVAL_MAX: Duration = Duration::from_secs(45);

/// Absolute RTT margin beyond which a switch always happens.
const RTT_ABSOLUTE_THRESHOLD: u64 = 80_000;
/// Relative rule: switch when two thirds of the current RTT still
/// beats the best candidate by a millisecond.
const fn rtt_threshold_factor(us: u64) -> u64 {
    us * 2 / 3
}
/// Samples slower than this are never switched to.
const RTT_SANITY_LIMIT: u64 = 10_000_000;
/// Penalty applied to the current server's sample when the previous
/// pass detected an A-B-A cycle.
const CYCLE_PENALTY_US: u64 = 1_000_000;
/// Best-count level that arms the probabilistic switch.
const BEST_COUNT_ARM: i32 = 12;
/// Minimum best-count lead over the current server for that switch.
const BEST_COUNT_LEAD: i32 = 8;

const MAX_PROBE_CANDIDATES: usize = 4;

/// The switch decision for a connected uplink, `roll` being a fresh
/// sample from `0..50`.
///
/// The best-count hysteresis may force a switch inside the RTT
/// thresholds, but only with a clear lead over the current server, so
/// two servers alternating as best cannot make the connection flap.
#[must_use]
pub(crate) fn switch_wanted(
    best_count: i32,
    current_count: i32,
    best_rtt: u64,
    current_rtt: u64,
    roll: i32,
) -> bool {
    let mut switch = best_count > BEST_COUNT_ARM && best_rtt < current_rtt && roll < best_count;
    if switch && best_count - current_count < BEST_COUNT_LEAD {
        switch = false;
    }
    if !switch {
        switch = current_rtt > best_rtt + RTT_ABSOLUTE_THRESHOLD
            || rtt_threshold_factor(current_rtt) > best_rtt + 1000;
    }
    switch && best_rtt < RTT_SANITY_LIMIT
}

// ── Verdict ─────────────────────────────────────────────────────────────────

/// Outcome of one probe round, consumed by the uplink worker.
pub enum RttVerdict {
    Idle,
    InProgress,
    /// Switch to this already-connected, image-selected socket.
    DoChange {
        stream: TcpStream,
        server: Host,
        protocol: u16,
        rtt: u64,
    },
    DontChange,
    NotReachable,
}

impl std::fmt::Debug for RttVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::InProgress => write!(f, "InProgress"),
            Self::DoChange { server, rtt, .. } => {
                write!(f, "DoChange({server}, {rtt}us)")
            }
            Self::DontChange => write!(f, "DontChange"),
            Self::NotReachable => write!(f, "NotReachable"),
        }
    }
}

// ── Prober ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(750),
            io_timeout: Duration::from_millis(1250),
        }
    }
}

/// The probe thread and its work queue.
pub struct RttProber {
    alts: Arc<AltServerRegistry>,
    config: ProbeConfig,
    pending: Mutex<Vec<Arc<Uplink>>>,
    signal: Condvar,
    stop: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RttProber {
    pub fn start(alts: Arc<AltServerRegistry>, config: ProbeConfig) -> Result<Arc<Self>> {
        let prober = Arc::new(Self {
            alts,
            config,
            pending: Mutex::new(Vec::new()),
            signal: Condvar::new(),
            stop: AtomicBool::new(false),
            join: Mutex::new(None),
        });
        let worker = Arc::clone(&prober);
        let join = std::thread::Builder::new()
            .name("dnbd-rtt".to_owned())
            .spawn(move || worker.run())?;
        *prober.join.lock() = Some(join);
        Ok(prober)
    }

    /// Queue `uplink` for a probe round unless one is already pending
    /// or in progress for it.
    pub fn request_probe(&self, uplink: &Arc<Uplink>) {
        let mut pending = self.pending.lock();
        if pending.iter().any(|u| Arc::ptr_eq(u, uplink)) {
            return;
        }
        if !uplink.begin_probe() {
            return;
        }
        pending.push(Arc::clone(uplink));
        self.signal.notify_one();
    }

    /// The uplink is going away; drop any queued probe for it.
    pub fn forget(&self, uplink: &Arc<Uplink>) {
        self.pending.lock().retain(|u| !Arc::ptr_eq(u, uplink));
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.signal.notify_one();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }

    fn run(&self) {
        let mut pending = self.pending.lock();
        while !self.stop.load(Ordering::Acquire) {
            if pending.is_empty() {
                self.signal
                    .wait_for(&mut pending, Duration::from_secs(5));
                continue;
            }
            let batch = std::mem::take(&mut *pending);
            drop(pending);
            for uplink in batch {
                if self.stop.load(Ordering::Acquire) {
                    uplink.set_verdict(RttVerdict::NotReachable);
                    continue;
                }
                self.probe_one(&uplink);
            }
            pending = self.pending.lock();
        }
    }

    fn probe_one(&self, uplink: &Arc<Uplink>) {
        let Some(image) = uplink.image() else {
            uplink.set_verdict(RttVerdict::NotReachable);
            return;
        };
        let has_live_socket = uplink.has_socket();
        let last_server = uplink.current_server();
        let connected = if has_live_socket { last_server } else { None };
        let cycle_detected = uplink.cycle_detected();

        let mut candidates = self
            .alts
            .candidates_for_uplink(MAX_PROBE_CANDIDATES, connected.is_none());
        if let Some(current) = connected {
            if !candidates.contains(&current) {
                candidates.push(current);
            }
        }
        if candidates.is_empty() {
            uplink.set_verdict(RttVerdict::NotReachable);
            return;
        }

        let mut best: Option<(Host, u64, TcpStream, u16)> = None;
        let mut current_rtt: Option<u64> = None;
        for host in candidates {
            // Give the network a moment between measurements.
            std::thread::sleep(Duration::from_millis(1));
            let is_last = last_server == Some(host);
            match self.measure(&host, &image) {
                Ok((stream, protocol, mut sample)) => {
                    if is_last && cycle_detected {
                        sample += CYCLE_PENALTY_US;
                    }
                    let mut avg = self.alts.update_rtt(&host, sample);
                    // A cycling or freshly dead current server gets an
                    // extra handicap for this round's comparison.
                    if is_last && (cycle_detected || !has_live_socket) {
                        avg = avg * 2 + 50_000;
                    }
                    if is_last && has_live_socket {
                        current_rtt = Some(avg);
                    } else if best.as_ref().is_none_or(|(_, rtt, ..)| avg < *rtt) {
                        best = Some((host, avg, stream, protocol));
                        continue;
                    }
                    drop(stream);
                }
                Err(err) => {
                    debug!(
                        target: "dnbd::rtt",
                        event = "probe_failed",
                        host = %host,
                        error = %err,
                    );
                    self.alts.update_rtt(&host, RTT_UNREACHABLE);
                    if is_last {
                        current_rtt = None;
                    }
                }
            }
        }

        let verdict = self.decide(uplink, connected, current_rtt, best);
        uplink.set_verdict(verdict);
    }

    fn decide(
        &self,
        uplink: &Arc<Uplink>,
        connected: Option<Host>,
        current_rtt: Option<u64>,
        best: Option<(Host, u64, TcpStream, u16)>,
    ) -> RttVerdict {
        let Some((host, rtt, stream, protocol)) = best else {
            return if connected.is_some() && current_rtt.is_some() {
                uplink.clear_cycle_detected();
                RttVerdict::DontChange
            } else {
                RttVerdict::NotReachable
            };
        };

        let switch = match connected {
            None => true,
            Some(current) => {
                let cur = current_rtt.unwrap_or(RTT_UNREACHABLE);
                if cur <= rtt {
                    // The standing connection won the round outright.
                    self.alts.bump_best_counts(&current, Some(&current));
                    false
                } else {
                    let (best_count, current_count) =
                        self.alts.bump_best_counts(&host, Some(&current));
                    let roll = rand::thread_rng().gen_range(0..50);
                    switch_wanted(best_count, current_count, rtt, cur, roll)
                }
            }
        };

        if switch {
            info!(
                target: "dnbd::rtt",
                event = "switch_decided",
                server = %host,
                rtt,
                current = current_rtt.unwrap_or(0),
            );
            self.alts.reset_best_counts_except(&host);
            RttVerdict::DoChange {
                stream,
                server: host,
                protocol,
                rtt,
            }
        } else {
            uplink.clear_cycle_detected();
            RttVerdict::DontChange
        }
    }

    /// One timed probe: connect, select the image, fetch block 0.
    /// Mismatching identity or protocol counts as a hard failure.
    fn measure(&self, host: &Host, image: &Arc<Image>) -> Result<(TcpStream, u16, u64)> {
        let started = Instant::now();
        let mut stream = client::connect(host, self.config.connect_timeout, self.config.io_timeout)
            .inspect_err(|_| self.alts.report_failure(host))?;

        let offer = match client::select_image(
            &mut stream,
            image.name(),
            image.rid(),
            dnbd_proto::FLAG_SERVER,
        ) {
            Ok(offer) => offer,
            Err(err @ DnbdError::ProtocolVersion { .. }) => {
                self.alts.report_hard_failure(host);
                return Err(err);
            }
            Err(err) => {
                self.alts.report_failure(host);
                return Err(err);
            }
        };
        if offer.name != image.name()
            || offer.rid != image.rid()
            || offer.virtual_size != image.virtual_size()
        {
            warn!(
                target: "dnbd::rtt",
                event = "offer_mismatch",
                host = %host,
                offered_name = %offer.name,
                offered_rid = offer.rid,
                offered_size = offer.virtual_size,
            );
            self.alts.report_hard_failure(host);
            return Err(DnbdError::Protocol("image offer mismatch".to_owned()));
        }

        let probe = (|| -> Result<()> {
            client::request_block(&mut stream, 0, BLOCK_SIZE as u32, 0, 0)?;
            let reply = client::read_reply(&mut stream)?;
            if reply.cmd != Command::GetBlock || reply.size != BLOCK_SIZE as u32 {
                return Err(DnbdError::Protocol(format!(
                    "unexpected probe reply: {:?} with {} bytes",
                    reply.cmd, reply.size
                )));
            }
            client::discard_payload(&mut stream, reply.size)
        })();
        if let Err(err) = probe {
            self.alts.report_failure(host);
            return Err(err);
        }

        let elapsed = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        Ok((stream, offer.protocol, elapsed))
    }
}
