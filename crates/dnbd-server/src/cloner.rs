//! Remote clone backend for proxy mode: asks the alt-server pool for
//! an image we do not have and hands the connected socket over to the
//! registry, which sets up the files and the uplink.

use dnbd_image::{RemoteClone, RemoteCloner, UplinkSeed};
use dnbd_image::CrcManifest;
use dnbd_proto::client;
use dnbd_types::{BLOCK_SIZE, Host, MIN_SUPPORTED_SERVER};
use dnbd_uplink::AltServerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many candidates a clone attempt walks through.
const CLONE_CANDIDATES: usize = 8;
const CLONE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct AltServerCloner {
    alts: Arc<AltServerRegistry>,
    io_timeout: Duration,
}

impl AltServerCloner {
    #[must_use]
    pub fn new(alts: Arc<AltServerRegistry>, io_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { alts, io_timeout })
    }

    fn try_host(
        &self,
        host: Host,
        name: &str,
        rid: u16,
        local_highest: Option<u16>,
    ) -> Option<RemoteClone> {
        let mut stream = match client::connect(&host, CLONE_CONNECT_TIMEOUT, self.io_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(
                    target: "dnbd::clone",
                    event = "connect_failed",
                    host = %host,
                    error = %err,
                );
                self.alts.report_failure(&host);
                return None;
            }
        };
        let offer = match client::select_image(&mut stream, name, rid, dnbd_proto::FLAG_SERVER) {
            Ok(offer) => offer,
            Err(err) => {
                debug!(
                    target: "dnbd::clone",
                    event = "select_failed",
                    host = %host,
                    name,
                    error = %err,
                );
                return None;
            }
        };
        if offer.protocol < MIN_SUPPORTED_SERVER || offer.rid == 0 || offer.name != name {
            self.alts.report_hard_failure(&host);
            return None;
        }
        if rid != 0 && offer.rid != rid {
            self.alts.report_hard_failure(&host);
            return None;
        }
        if rid == 0 && local_highest.is_some_and(|local| local >= offer.rid) {
            // Not a failure: the remote just has nothing newer.
            return None;
        }
        if offer.virtual_size < BLOCK_SIZE {
            self.alts.report_hard_failure(&host);
            return None;
        }

        let crc = match client::fetch_crc_list(&mut stream) {
            Ok(Some((master, crcs))) => match CrcManifest::from_parts(master, crcs) {
                Ok(manifest) => Some(manifest),
                Err(_) => {
                    warn!(
                        target: "dnbd::clone",
                        event = "crc_list_corrupt",
                        host = %host,
                        name,
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                debug!(
                    target: "dnbd::clone",
                    event = "crc_fetch_failed",
                    host = %host,
                    error = %err,
                );
                self.alts.report_failure(&host);
                return None;
            }
        };

        info!(
            target: "dnbd::clone",
            event = "clone_started",
            host = %host,
            name,
            rid = offer.rid,
            size = offer.virtual_size,
        );
        Some(RemoteClone {
            rid: offer.rid,
            virtual_size: offer.virtual_size,
            crc,
            seed: UplinkSeed {
                stream,
                server: host,
                protocol: offer.protocol,
            },
        })
    }
}

impl RemoteCloner for AltServerCloner {
    fn offer(&self, name: &str, rid: u16, local_highest: Option<u16>) -> Option<RemoteClone> {
        let candidates = self.alts.candidates_for_uplink(CLONE_CANDIDATES, false);
        for host in candidates {
            if let Some(clone) = self.try_host(host, name, rid, local_highest) {
                return Some(clone);
            }
        }
        None
    }
}
