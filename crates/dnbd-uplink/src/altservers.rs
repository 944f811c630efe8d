//! The alt-server pool: candidate upstreams with RTT history and
//! failure bookkeeping.
//!
//! One coarse lock guards the table. All RTT/failure updates are
//! funneled through the probe thread and the uplink workers, so the
//! counters never see concurrent writers for the same concern.

use dnbd_types::Host;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum pool size.
pub const MAX_ALTS: usize = 16;

/// RTT ring length per server.
pub const RTT_PROBES: usize = 5;

/// Sentinel stored for failed probes. Chosen so a ring full of them
/// still sums without overflow.
pub const RTT_UNREACHABLE: u64 = 0x07ff_ffff;

/// Fail-count step for ordinary upstream failures.
const FAIL_INCREASE: u32 = 5;
/// Fail-count step for protocol or revision mismatches.
const FAIL_INCREASE_HARD: u32 = 10;
/// Consecutive-failure count above which a server is skipped while
/// its last failure is recent.
const BAD_UPLINK_THRESHOLD: u32 = 10;
/// How long a failing server is skipped after its last failure.
const BAD_UPLINK_IGNORE: Duration = Duration::from_secs(180);
/// Failures within this window of the previous one do not bump the
/// counter again; many uplinks sharing one upstream would otherwise
/// disable it on a single network hiccup.
const FAIL_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Highest value the best-count hysteresis accumulates to.
const BEST_COUNT_CAP: i32 = 50;

#[derive(Debug, Clone)]
struct AltServer {
    host: Host,
    comment: String,
    private: bool,
    client_only: bool,
    rtts: [u64; RTT_PROBES],
    rtt_index: usize,
    rtt: u64,
    live_rtt: u64,
    best_count: i32,
    fails: u32,
    last_fail: Option<Instant>,
}

impl AltServer {
    fn new(host: Host, comment: String, private: bool, client_only: bool) -> Self {
        Self {
            host,
            comment,
            private,
            client_only,
            rtts: [RTT_UNREACHABLE; RTT_PROBES],
            rtt_index: 0,
            rtt: RTT_UNREACHABLE,
            live_rtt: 0,
            best_count: 0,
            fails: 0,
            last_fail: None,
        }
    }
}

/// Status snapshot of one pool entry.
#[derive(Debug, Clone)]
pub struct AltServerInfo {
    pub host: Host,
    pub comment: String,
    pub private: bool,
    pub client_only: bool,
    pub rtt: u64,
    pub live_rtt: u64,
    pub best_count: i32,
    pub fails: u32,
}

/// The pool itself.
pub struct AltServerRegistry {
    servers: Mutex<Vec<AltServer>>,
    /// Restrict replication to servers flagged private.
    private_only: bool,
}

impl AltServerRegistry {
    #[must_use]
    pub fn new(private_only: bool) -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            private_only,
        }
    }

    /// Add a server; duplicates (same host and port) are rejected.
    pub fn add(&self, host: Host, comment: &str, private: bool, client_only: bool) -> bool {
        let mut servers = self.servers.lock();
        if servers.iter().any(|s| s.host == host) {
            return false;
        }
        if servers.len() >= MAX_ALTS {
            warn!(
                target: "dnbd::altservers",
                event = "pool_full",
                max = MAX_ALTS,
            );
            return false;
        }
        servers.push(AltServer::new(host, comment.to_owned(), private, client_only));
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    /// Servers to advertise to a client, best network closeness first.
    /// Private servers are never advertised.
    #[must_use]
    pub fn list_for_client(&self, client: &Host, max: usize) -> Vec<Host> {
        let servers = self.servers.lock();
        let mut scored: Vec<(i32, Host)> = servers
            .iter()
            .filter(|s| !s.private)
            .map(|s| {
                let score = if client.addr_type() == s.host.addr_type() {
                    s.host.closeness(client) - s.fails as i32
                } else {
                    // Wrong address family: heavily penalized but
                    // still listed when nothing better exists.
                    -(s.fails as i32 + 128)
                };
                (score, s.host)
            })
            .collect();
        scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
        scored.into_iter().take(max).map(|(_, host)| host).collect()
    }

    /// Replication candidates. First pass takes servers with a clean
    /// record; the second considers failing ones but skips those whose
    /// failure streak is long and recent, unless `emergency`. The
    /// first slot is swapped with a random one per call to break ties
    /// among equals.
    #[must_use]
    pub fn candidates_for_uplink(&self, max: usize, emergency: bool) -> Vec<Host> {
        let mut servers = self.servers.lock();
        let len = servers.len();
        if len == 0 || max == 0 {
            return Vec::new();
        }
        if len > 1 {
            let other = rand::thread_rng().gen_range(1..len);
            servers.swap(0, other);
        }
        let now = Instant::now();
        let mut out = Vec::with_capacity(max.min(len));
        for pass in 0..2 {
            for srv in servers.iter_mut() {
                if out.len() >= max {
                    break;
                }
                if self.private_only && !srv.private {
                    continue;
                }
                if srv.client_only {
                    continue;
                }
                if pass == 0 {
                    if srv.fails > 0 {
                        continue;
                    }
                } else {
                    if srv.fails == 0 {
                        continue;
                    }
                    let recent = srv
                        .last_fail
                        .is_some_and(|at| now.duration_since(at) < BAD_UPLINK_IGNORE);
                    if !emergency && srv.fails > BAD_UPLINK_THRESHOLD && recent {
                        continue;
                    }
                    if !emergency {
                        srv.fails -= 1;
                    }
                }
                out.push(srv.host);
            }
            if out.len() >= max {
                break;
            }
        }
        out
    }

    /// Record an upstream failure during normal operation.
    pub fn report_failure(&self, host: &Host) {
        self.fail(host, FAIL_INCREASE);
    }

    /// Record a protocol-level mismatch (wrong rid, bad version).
    pub fn report_hard_failure(&self, host: &Host) {
        self.fail(host, FAIL_INCREASE_HARD);
    }

    fn fail(&self, host: &Host, step: u32) {
        let mut servers = self.servers.lock();
        let Some(srv) = servers.iter_mut().find(|s| s.host == *host) else {
            return;
        };
        let now = Instant::now();
        if srv
            .last_fail
            .is_some_and(|at| now.duration_since(at) < FAIL_DEDUP_WINDOW)
        {
            return;
        }
        srv.fails = srv.fails.saturating_add(step);
        srv.last_fail = Some(now);
        debug!(
            target: "dnbd::altservers",
            event = "server_failed",
            host = %srv.host,
            fails = srv.fails,
        );
    }

    /// Push a probe sample into the ring and return the new average,
    /// blended with the production-path EWMA when one exists. A
    /// successful sample also pays down the failure counter.
    pub fn update_rtt(&self, host: &Host, sample: u64) -> u64 {
        let mut servers = self.servers.lock();
        let Some(srv) = servers.iter_mut().find(|s| s.host == *host) else {
            return sample;
        };
        srv.rtt_index = (srv.rtt_index + 1) % RTT_PROBES;
        srv.rtts[srv.rtt_index] = sample;
        let sum: u64 = srv.rtts.iter().sum();
        srv.rtt = if srv.live_rtt != 0 {
            (sum + srv.live_rtt) / (RTT_PROBES as u64 + 1)
        } else {
            sum / RTT_PROBES as u64
        };
        if sample < RTT_UNREACHABLE {
            if srv.fails > 0 {
                srv.fails -= 1;
            }
        } else {
            srv.fails = srv.fails.saturating_add(1);
            srv.last_fail = Some(Instant::now());
        }
        srv.rtt
    }

    /// Fold a production-path reply time into the live EWMA.
    pub fn update_live_rtt(&self, host: &Host, observed: u64) {
        let mut servers = self.servers.lock();
        let Some(srv) = servers.iter_mut().find(|s| s.host == *host) else {
            return;
        };
        srv.live_rtt = if srv.live_rtt == 0 {
            observed
        } else {
            (3 * srv.live_rtt + observed) / 4
        };
    }

    /// Best-count bookkeeping after a probe round: the round's best
    /// server accumulates, everyone else decays. Returns
    /// `(best_count(best), best_count(current))`.
    pub fn bump_best_counts(&self, best: &Host, current: Option<&Host>) -> (i32, i32) {
        let mut servers = self.servers.lock();
        let mut best_count = 0;
        let mut current_count = 0;
        for srv in servers.iter_mut() {
            if srv.host == *best {
                if srv.best_count < BEST_COUNT_CAP {
                    srv.best_count += 2;
                }
                best_count = srv.best_count;
            } else if srv.best_count > 0 {
                srv.best_count -= 1;
            }
            if current.is_some_and(|c| srv.host == *c) {
                current_count = srv.best_count;
            }
        }
        (best_count, current_count)
    }

    /// A switch happened: everyone but the new server starts over.
    pub fn reset_best_counts_except(&self, keep: &Host) {
        let mut servers = self.servers.lock();
        for srv in servers.iter_mut() {
            if srv.host != *keep {
                srv.best_count = 0;
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<AltServerInfo> {
        self.servers
            .lock()
            .iter()
            .map(|s| AltServerInfo {
                host: s.host,
                comment: s.comment.clone(),
                private: s.private,
                client_only: s.client_only,
                rtt: s.rtt,
                live_rtt: s.live_rtt,
                best_count: s.best_count,
                fails: s.fails,
            })
            .collect()
    }
}
