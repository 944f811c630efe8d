#![forbid(unsafe_code)]
//! Uplink subsystem: per-image replication workers, the alt-server
//! pool, and RTT-driven server selection.
//!
//! An uplink exists for every incomplete image a client has touched.
//! It multiplexes all reads for that image over one upstream TCP
//! connection, persists replies into the cache, and answers the
//! waiting clients. The [`rtt::RttProber`] periodically measures the
//! candidate pool and tells workers when a better server is worth the
//! churn of a switch.

pub mod altservers;
pub mod queue;
pub mod rtt;
pub mod uplink;

pub use altservers::{AltServerInfo, AltServerRegistry, MAX_ALTS, RTT_PROBES, RTT_UNREACHABLE};
pub use queue::{InsertOutcome, QUEUE_CAPACITY, RequestQueue, SlotStatus};
pub use rtt::{ProbeConfig, RTT_INTERVAL_INIT, RTT_INTERVAL_MAX, RttProber, RttVerdict};
pub use uplink::{Uplink, UplinkConfig, UplinkFactory};
