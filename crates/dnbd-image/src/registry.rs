//! The image registry: bounded slot table, lookup with reference
//! hand-out, directory scanning, remote cloning, and the disk-space
//! reaper.
//!
//! References are `Arc<Image>`: each slot holds one, every `get` hands
//! out another. Removing an image clears its slot; users that still
//! hold a reference keep it alive until the last drop. Reload, clone
//! and reap are mutually exclusive through one top-level lock that is
//! always taken before any slot access.

use crate::cache_map::CacheMap;
use crate::crc::CrcManifest;
use crate::image::{
    Image, UplinkSeed, UplinkStarter, is_forbidden_extension, map_path, parse_rid_suffix,
};
use crate::integrity::IntegrityChecker;
use dnbd_error::{DnbdError, Result};
use dnbd_types::{Host, ImageId, is_valid_image_name, map_bytes};
use fs2::FileExt as _;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// How long a failed working-state probe suppresses the next one.
const NONWORKING_RECHECK: Duration = Duration::from_secs(60);
/// TTL of the per-(name, rid) remote lookup suppression cache.
const RECENT_QUERY_TTL: Duration = Duration::from_secs(30);
/// Slots in the remote lookup suppression cache.
const RECENT_QUERY_SLOTS: usize = 16;
/// Random complete hash-blocks verified when loading an image.
const QUICK_CHECK_BLOCKS: usize = 4;
/// Eviction rounds per reaper invocation.
const REAPER_MAX_ROUNDS: usize = 20;
/// Images touched more recently than this are never evicted outside
/// sparse mode.
const REAPER_MIN_IDLE: Duration = Duration::from_secs(24 * 3600);
/// The reaper refuses to evict during the first hours of uptime, when
/// access times are still dominated by the startup estimate.
const REAPER_UPTIME_GUARD: Duration = Duration::from_secs(10 * 3600);
/// Disk space reserved on top of a clone for sidecars.
const CLONE_EXTRA_SPACE: u64 = 10 * 1024 * 1024;
/// Space to ensure per clone when sparse files are enabled.
const SPARSE_CLONE_SPACE: u64 = 2 * 1024 * 1024 * 1024;

// ── Remote clone seam ───────────────────────────────────────────────────────

/// Everything needed to adopt an image offered by an upstream: the
/// concrete revision, its size, the optional CRC list (already
/// validated against its master CRC) and the connected socket for the
/// new uplink.
pub struct RemoteClone {
    pub rid: u16,
    pub virtual_size: u64,
    pub crc: Option<CrcManifest>,
    pub seed: UplinkSeed,
}

/// Asks the alt-server pool for an image. Implemented by the
/// composition root; `local_highest` lets the rid-0 case skip clones
/// that would not improve on what is already on disk.
pub trait RemoteCloner: Send + Sync {
    fn offer(&self, name: &str, rid: u16, local_highest: Option<u16>) -> Option<RemoteClone>;
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_path: PathBuf,
    pub max_images: usize,
    pub is_proxy: bool,
    pub sparse_files: bool,
    pub remove_missing: bool,
    pub max_replication_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            max_images: 1024,
            is_proxy: false,
            sparse_files: false,
            remove_missing: false,
            max_replication_size: u64::MAX,
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RecentQuery {
    name: String,
    rid: u16,
    until: Instant,
}

/// Status snapshot of one registry entry.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: ImageId,
    pub name: String,
    pub rid: u16,
    pub users: usize,
    pub completeness: u8,
    pub idle: Duration,
    pub virtual_size: u64,
    pub uplink_server: Option<Host>,
    pub bytes_received: u64,
}

pub struct Registry {
    config: RegistryConfig,
    slots: Mutex<Vec<Option<Arc<Image>>>>,
    next_id: AtomicU64,
    /// Serializes reload, remote clone and reap.
    global_op: Mutex<()>,
    recent: Mutex<Vec<RecentQuery>>,
    integrity: Arc<IntegrityChecker>,
    uplink_starter: RwLock<Option<Arc<dyn UplinkStarter>>>,
    cloner: RwLock<Option<Arc<dyn RemoteCloner>>>,
    started_at: Instant,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            global_op: Mutex::new(()),
            recent: Mutex::new(Vec::with_capacity(RECENT_QUERY_SLOTS)),
            integrity: IntegrityChecker::start()?,
            uplink_starter: RwLock::new(None),
            cloner: RwLock::new(None),
            started_at: Instant::now(),
        }))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn integrity(&self) -> &Arc<IntegrityChecker> {
        &self.integrity
    }

    /// Wire in the uplink factory. Must happen before images that need
    /// replication are served.
    pub fn set_uplink_starter(&self, starter: Arc<dyn UplinkStarter>) {
        *self.uplink_starter.write() = Some(starter);
    }

    /// Wire in the remote clone backend (proxy mode).
    pub fn set_cloner(&self, cloner: Arc<dyn RemoteCloner>) {
        *self.cloner.write() = Some(cloner);
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Get a counted reference to `name:rid`; rid 0 selects the highest
    /// known revision. With `check_working`, a stale image is probed
    /// (at most once a minute) and flipped to not-working on failure.
    pub fn get(self: &Arc<Self>, name: &str, rid: u16, check_working: bool) -> Option<Arc<Image>> {
        if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
            return None;
        }
        let candidate = self.lookup(name, rid)?;

        if candidate.is_working() || check_working {
            if candidate.ensure_open().is_err() {
                if self.config.remove_missing {
                    self.remove(&candidate);
                }
                return Some(candidate);
            }
        }
        if !check_working {
            return Some(candidate);
        }

        if !candidate.recheck_working(NONWORKING_RECHECK) {
            if self.config.remove_missing {
                self.remove(&candidate);
            } else if let Some(_guard) = self.global_op.try_lock() {
                // Reconcile from disk right away so the next lookup can
                // recover; the stale entry is replaced if anything
                // changed. Skipped when a scan or clone is running.
                let path = candidate.path().to_owned();
                let _ = self.load_one(&path, true);
            }
        }

        // Incomplete image referenced by a client: make sure an uplink
        // worker exists.
        if candidate.has_cache_map() {
            self.ensure_uplink(&candidate, None);
        }
        Some(candidate)
    }

    fn lookup(&self, name: &str, rid: u16) -> Option<Arc<Image>> {
        let slots = self.slots.lock();
        let mut candidate: Option<&Arc<Image>> = None;
        for image in slots.iter().flatten() {
            if image.name() != name {
                continue;
            }
            if rid != 0 {
                if image.rid() == rid {
                    return Some(Arc::clone(image));
                }
            } else if candidate.is_none_or(|c| c.rid() < image.rid()) {
                candidate = Some(image);
            }
        }
        candidate.cloned()
    }

    /// Highest known revision of `name`.
    #[must_use]
    pub fn highest_rid(&self, name: &str) -> Option<u16> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .filter(|image| image.name() == name)
            .map(|image| image.rid())
            .max()
    }

    /// Like [`Self::get`], but fall through to disk (and, in proxy
    /// mode, to an upstream clone) when the image is unknown or a
    /// higher revision might exist remotely.
    pub fn get_or_load(self: &Arc<Self>, name: &str, rid: u16) -> Result<Arc<Image>> {
        if rid != 0 {
            if let Some(image) = self.get(name, rid, true) {
                return Ok(image);
            }
        }
        if !is_valid_image_name(name) {
            return Err(DnbdError::InvalidName(name.to_owned()));
        }
        if self.config.is_proxy {
            self.load_proxy(name, rid)
        } else {
            self.load_local(name, rid)
        }
    }

    // ── Local loading ───────────────────────────────────────────────

    fn load_local(self: &Arc<Self>, name: &str, rid: u16) -> Result<Arc<Image>> {
        let (path, rid) = if rid != 0 {
            (self.config.base_path.join(format!("{name}.r{rid}")), rid)
        } else {
            match self.scan_highest_rid(name) {
                Some(found) => found,
                None => {
                    return self
                        .get(name, rid, true)
                        .ok_or_else(|| DnbdError::NotFound(name.to_owned()));
                }
            }
        };
        {
            let _guard = self.global_op.lock();
            if let Some(image) = self.get(name, rid, true) {
                return Ok(image);
            }
            self.load_one(&path, true)?;
        }
        self.get(name, rid, true)
            .ok_or_else(|| DnbdError::NotFound(name.to_owned()))
    }

    /// Find the highest readable `<name>.r<rid>` on disk.
    fn scan_highest_rid(&self, name: &str) -> Option<(PathBuf, u16)> {
        let full = self.config.base_path.join(name);
        let dir = full.parent()?;
        let stem = full.file_name()?.to_str()?;
        let mut best: Option<(PathBuf, u16)> = None;
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            let file_name = entry.file_name();
            let Some(file_str) = file_name.to_str() else {
                continue;
            };
            let Some((base, rid)) = parse_rid_suffix(file_str) else {
                continue;
            };
            if base != stem {
                continue;
            }
            if best.as_ref().is_none_or(|(_, b)| *b < rid) {
                best = Some((entry.path(), rid));
            }
        }
        best
    }

    // ── Proxy cloning ───────────────────────────────────────────────

    fn load_proxy(self: &Arc<Self>, name: &str, rid: u16) -> Result<Arc<Image>> {
        let local = if rid == 0 { self.get(name, 0, true) } else { None };

        // Suppress lookup storms: one remote query per (name, rid) per
        // TTL window.
        let now = Instant::now();
        {
            let mut recent = self.recent.lock();
            if let Some(entry) = recent
                .iter()
                .find(|e| e.rid == rid && e.name == name)
            {
                if now < entry.until {
                    return local.ok_or_else(|| DnbdError::NotFound(name.to_owned()));
                }
            }
            // Re-check under no lock races: another session may have
            // cloned while we were deciding.
            if rid != 0 {
                drop(recent);
                if let Some(image) = self.get(name, rid, true) {
                    return Ok(image);
                }
                recent = self.recent.lock();
            }
            let deadline = now + RECENT_QUERY_TTL;
            if let Some(entry) = recent
                .iter_mut()
                .find(|e| e.rid == rid && e.name == name)
            {
                entry.until = deadline;
            } else if recent.len() < RECENT_QUERY_SLOTS {
                recent.push(RecentQuery {
                    name: name.to_owned(),
                    rid,
                    until: deadline,
                });
            } else if let Some(oldest) = recent.iter_mut().min_by_key(|e| e.until) {
                oldest.name = name.to_owned();
                oldest.rid = rid;
                oldest.until = deadline;
            }
        }

        let cloner = self.cloner.read().clone();
        let Some(cloner) = cloner else {
            return local.ok_or_else(|| DnbdError::NotFound(name.to_owned()));
        };
        let local_highest = local.as_ref().map(|image| image.rid());
        let Some(clone) = cloner.offer(name, rid, local_highest) else {
            return local.ok_or_else(|| DnbdError::NotFound(name.to_owned()));
        };
        if clone.virtual_size > self.config.max_replication_size {
            info!(
                target: "dnbd::registry",
                event = "clone_too_large",
                name,
                rid = clone.rid,
                size = clone.virtual_size,
            );
            return local.ok_or_else(|| DnbdError::NotFound(name.to_owned()));
        }

        let path = {
            let _guard = self.global_op.lock();
            let wanted = if self.config.sparse_files {
                SPARSE_CLONE_SPACE
            } else {
                clone.virtual_size.saturating_add(CLONE_EXTRA_SPACE)
            };
            if !self.reap_locked(wanted, false) {
                return Err(DnbdError::NoSpace);
            }
            let path = self.create_clone_files(name, clone.rid, clone.virtual_size)?;
            if let Some(manifest) = &clone.crc {
                manifest.save(&path)?;
            }
            // The already-connected socket seeds the uplink below.
            self.load_one(&path, false)?;
            path
        };
        debug!(target: "dnbd::registry", event = "cloned", path = %path.display());

        let image = self
            .get(name, clone.rid, false)
            .ok_or_else(|| DnbdError::NotFound(name.to_owned()))?;
        self.ensure_uplink(&image, Some(clone.seed));
        Ok(image)
    }

    /// Allocate the backing file and its zeroed cache map.
    fn create_clone_files(&self, name: &str, rid: u16, vsize: u64) -> Result<PathBuf> {
        let path = self.config.base_path.join(format!("{name}.r{rid}"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        if self.config.sparse_files {
            file.set_len(vsize)?;
        } else if file.allocate(vsize).is_err() {
            // Preallocation unsupported on this filesystem; fall back
            // to a plain length set.
            file.set_len(vsize)?;
        }
        std::fs::write(map_path(&path), vec![0_u8; map_bytes(vsize)])?;
        Ok(path)
    }

    // ── Load & reconcile ────────────────────────────────────────────

    /// Load one image file, reconciling with an already registered
    /// object of the same name and revision. Caller holds `global_op`.
    fn load_one(self: &Arc<Self>, path: &Path, with_uplink: bool) -> Result<()> {
        let id = ImageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let image = Image::load_from_disk(&self.config.base_path, path, id)?;

        if let Some(existing) = self.lookup(image.name(), image.rid()) {
            if existing.real_size() == image.real_size() {
                let new_crc = image.crc_manifest();
                let old_crc = existing.crc_manifest();
                match (old_crc, new_crc) {
                    (Some(old), Some(new)) if old.crcs() != new.crcs() => {
                        warn!(
                            target: "dnbd::registry",
                            event = "crc_list_changed",
                            name = %existing.name(),
                            rid = existing.rid(),
                        );
                        warn!(
                            target: "dnbd::registry",
                            "replacing a published revision in place is unsupported; use a new rid"
                        );
                        // Replaced below.
                    }
                    (None, Some(new)) => {
                        info!(
                            target: "dnbd::registry",
                            event = "crc_list_attached",
                            name = %existing.name(),
                            rid = existing.rid(),
                        );
                        existing.attach_crc_manifest(new);
                        return Ok(());
                    }
                    _ => return Ok(()),
                }
            } else {
                warn!(
                    target: "dnbd::registry",
                    event = "size_changed",
                    name = %existing.name(),
                    rid = existing.rid(),
                    old = existing.real_size(),
                    new = image.real_size(),
                );
            }
            self.remove(&existing);
        }

        let image = Arc::new(image);
        image.set_integrity(Arc::clone(&self.integrity));
        let needs_full_check = !self.quick_check(&image);
        self.insert(Arc::clone(&image))?;
        if needs_full_check {
            warn!(
                target: "dnbd::registry",
                event = "quick_check_failed",
                name = %image.name(),
                rid = image.rid(),
            );
            self.integrity.enqueue_full(&image);
        }
        if image.has_cache_map() {
            image.set_working(false);
            if with_uplink {
                self.ensure_uplink(&image, None);
            }
        }
        info!(
            target: "dnbd::registry",
            event = "image_loaded",
            name = %image.name(),
            rid = image.rid(),
            complete = !image.has_cache_map(),
        );
        Ok(())
    }

    /// Verify up to four complete hash-blocks, always including block 0
    /// if it is complete. Sloppy on purpose: this catches gross
    /// corruption, the full check runs in the background.
    fn quick_check(&self, image: &Arc<Image>) -> bool {
        let Some(manifest) = image.crc_manifest() else {
            return true;
        };
        let blocks: Vec<usize> = image.with_cache_map(|map| {
            let complete =
                |b: usize| map.map_or(true, |m: &CacheMap| m.is_hash_block_complete(b));
            let count = manifest.len();
            let mut picked = Vec::with_capacity(QUICK_CHECK_BLOCKS);
            if count > 0 && complete(0) {
                picked.push(0);
            }
            let mut rng = rand::thread_rng();
            let mut tries = QUICK_CHECK_BLOCKS * 5;
            while picked.len() < QUICK_CHECK_BLOCKS && tries > 0 {
                tries -= 1;
                let block = rng.gen_range(0..count.max(1));
                if !picked.contains(&block) && complete(block) {
                    picked.push(block);
                }
            }
            picked
        });
        let Ok(file) = image.ensure_open() else {
            return false;
        };
        blocks.iter().all(|&block| {
            manifest
                .check_block(&file, block, image.real_size())
                .unwrap_or(false)
        })
    }

    fn insert(&self, image: Arc<Image>) -> Result<()> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(image);
            return Ok(());
        }
        if slots.len() >= self.config.max_images {
            return Err(DnbdError::RegistryFull);
        }
        slots.push(Some(image));
        Ok(())
    }

    /// Drop the registry's reference; in-flight users keep the image
    /// alive until they release theirs.
    pub fn remove(&self, image: &Arc<Image>) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.id() == image.id()) {
                *slot = None;
            }
        }
        while slots.last().is_some_and(Option::is_none) {
            slots.pop();
        }
    }

    fn ensure_uplink(&self, image: &Arc<Image>, seed: Option<UplinkSeed>) {
        if image.uplink().is_some_and(|u| !u.is_shut_down()) {
            return;
        }
        let starter = self.uplink_starter.read().clone();
        let Some(starter) = starter else {
            return;
        };
        match starter.start(image, seed) {
            Ok(handle) => {
                if image.set_uplink(handle.clone()).is_err() {
                    handle.signal_shutdown();
                }
            }
            Err(err) => {
                warn!(
                    target: "dnbd::registry",
                    event = "uplink_start_failed",
                    name = %image.name(),
                    rid = image.rid(),
                    error = %err,
                );
            }
        }
    }

    // ── Reload scan ─────────────────────────────────────────────────

    /// Rescan the base directory (or a subtree): drop vanished images
    /// when configured, load new ones, reconcile changed ones.
    pub fn reload(self: &Arc<Self>, subtree: Option<&Path>) -> Result<()> {
        let _guard = self.global_op.lock();
        if self.config.remove_missing {
            let snapshot: Vec<Arc<Image>> = self.slots.lock().iter().flatten().cloned().collect();
            for image in snapshot {
                if !image.path().is_file() {
                    info!(
                        target: "dnbd::registry",
                        event = "image_vanished",
                        name = %image.name(),
                        rid = image.rid(),
                    );
                    self.remove(&image);
                }
            }
        }
        let root = subtree.unwrap_or(&self.config.base_path).to_owned();
        info!(target: "dnbd::registry", event = "scan_started", path = %root.display());
        self.scan_dir(&root)?;
        info!(target: "dnbd::registry", event = "scan_finished", path = %root.display());
        Ok(())
    }

    fn scan_dir(self: &Arc<Self>, dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.scan_dir(&path)?;
            } else if !is_forbidden_extension(&path) {
                let Some(file_str) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if parse_rid_suffix(file_str).is_none() {
                    continue;
                }
                if let Err(err) = self.load_one(&path, true) {
                    warn!(
                        target: "dnbd::registry",
                        event = "load_failed",
                        path = %path.display(),
                        error = %err,
                    );
                }
            }
        }
        Ok(())
    }

    // ── Disk-space reaper ───────────────────────────────────────────

    /// Make sure `size` bytes are available under the base path,
    /// evicting least-recently-used idle images if necessary.
    pub fn ensure_disk_space(self: &Arc<Self>, size: u64, force: bool) -> bool {
        let _guard = self.global_op.lock();
        self.reap_locked(size, force)
    }

    fn reap_locked(self: &Arc<Self>, size: u64, force: bool) -> bool {
        for _ in 0..REAPER_MAX_ROUNDS {
            let available = match fs2::available_space(&self.config.base_path) {
                Ok(avail) => avail,
                Err(err) => {
                    warn!(
                        target: "dnbd::registry",
                        event = "statvfs_failed",
                        error = %err,
                    );
                    return true;
                }
            };
            if available > size {
                return true;
            }
            if !force && self.started_at.elapsed() < REAPER_UPTIME_GUARD {
                info!(
                    target: "dnbd::registry",
                    event = "reap_skipped_uptime",
                    available,
                    requested = size,
                );
                return false;
            }
            let Some(victim) = self.pick_reap_victim() else {
                info!(
                    target: "dnbd::registry",
                    event = "nothing_to_reap",
                    available,
                    requested = size,
                );
                return false;
            };
            info!(
                target: "dnbd::registry",
                event = "image_evicted",
                name = %victim.name(),
                rid = victim.rid(),
            );
            let base = victim.path().to_owned();
            self.remove(&victim);
            victim.shutdown_uplink();
            drop(victim);
            let _ = std::fs::remove_file(&base);
            for ext in [".map", ".crc", ".meta"] {
                let mut os = base.as_os_str().to_owned();
                os.push(ext);
                let _ = std::fs::remove_file(PathBuf::from(os));
            }
        }
        false
    }

    /// Oldest-atime image that only the registry itself references and
    /// that has been idle long enough (relaxed in sparse mode).
    fn pick_reap_victim(&self) -> Option<Arc<Image>> {
        let slots = self.slots.lock();
        let mut oldest: Option<&Arc<Image>> = None;
        for image in slots.iter().flatten() {
            if Arc::strong_count(image) != 1 {
                continue;
            }
            if oldest.is_none_or(|o| image.atime() < o.atime()) {
                oldest = Some(image);
            }
        }
        let victim = oldest.cloned()?;
        if !self.config.sparse_files {
            let idle = SystemTime::now()
                .duration_since(victim.atime())
                .unwrap_or(Duration::ZERO);
            if idle < REAPER_MIN_IDLE {
                return None;
            }
        }
        Some(victim)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Close read fds of images idle for `idle_for`.
    pub fn close_unused_fds(&self, idle_for: Duration) {
        let snapshot: Vec<Arc<Image>> = self.slots.lock().iter().flatten().cloned().collect();
        for image in snapshot {
            image.close_unused_fd(idle_for);
        }
    }

    /// Snapshot of all registered images.
    #[must_use]
    pub fn images(&self) -> Vec<Arc<Image>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    /// Status summary for every registered image.
    #[must_use]
    pub fn list(&self) -> Vec<ImageSummary> {
        self.images()
            .into_iter()
            .map(|image| {
                let uplink = image.uplink();
                ImageSummary {
                    id: image.id(),
                    name: image.name().to_owned(),
                    rid: image.rid(),
                    // The slot and this snapshot each hold one.
                    users: Arc::strong_count(&image).saturating_sub(2),
                    completeness: image.completeness_estimate(),
                    idle: SystemTime::now()
                        .duration_since(image.atime())
                        .unwrap_or(Duration::ZERO),
                    virtual_size: image.virtual_size(),
                    uplink_server: uplink.as_ref().and_then(|u| u.current_server()),
                    bytes_received: uplink.as_ref().map_or(0, |u| u.bytes_received()),
                }
            })
            .collect()
    }

    /// Stop all uplinks and the integrity thread.
    pub fn shutdown(&self) {
        for image in self.images() {
            let _ = image.save_cache_map();
            image.shutdown_uplink();
        }
        self.integrity.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry(dir: &Path) -> Arc<Registry> {
        Registry::new(RegistryConfig {
            base_path: dir.to_owned(),
            ..RegistryConfig::default()
        })
        .unwrap()
    }

    fn put_image(dir: &Path, rel: &str, len: usize) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![9_u8; len]).unwrap();
        path
    }

    #[test]
    fn scan_loads_images_and_skips_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        put_image(dir.path(), "a/one.r1", 4096);
        put_image(dir.path(), "a/one.r2", 4096);
        put_image(dir.path(), "b/two.r7", 8192);
        put_image(dir.path(), "b/two.r7.crc", 8); // short, ignored
        put_image(dir.path(), "b/notanimage", 4096);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        let mut names: Vec<(String, u16)> = reg
            .list()
            .into_iter()
            .map(|s| (s.name, s.rid))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("a/one".to_owned(), 1),
                ("a/one".to_owned(), 2),
                ("b/two".to_owned(), 7),
            ]
        );
        reg.shutdown();
    }

    #[test]
    fn rid_zero_selects_highest() {
        let dir = tempfile::tempdir().unwrap();
        put_image(dir.path(), "img.r1", 4096);
        put_image(dir.path(), "img.r3", 4096);
        put_image(dir.path(), "img.r2", 4096);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        assert_eq!(reg.get("img", 0, false).unwrap().rid(), 3);
        assert_eq!(reg.get("img", 2, false).unwrap().rid(), 2);
        assert!(reg.get("img", 9, false).is_none());
        reg.shutdown();
    }

    #[test]
    fn get_or_load_finds_unscanned_image() {
        let dir = tempfile::tempdir().unwrap();
        put_image(dir.path(), "late.r4", 4096);
        let reg = registry(dir.path());
        let image = reg.get_or_load("late", 0).unwrap();
        assert_eq!(image.rid(), 4);
        assert!(reg.get_or_load("missing", 0).is_err());
        reg.shutdown();
    }

    #[test]
    fn removal_keeps_inflight_references_alive() {
        let dir = tempfile::tempdir().unwrap();
        put_image(dir.path(), "img.r1", 4096);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        let image = reg.get("img", 1, false).unwrap();
        reg.remove(&image);
        assert!(reg.get("img", 1, false).is_none());
        assert_eq!(image.rid(), 1);
        assert_eq!(image.real_size(), 4096);
        reg.shutdown();
    }

    #[test]
    fn reload_attaches_new_crc_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = put_image(dir.path(), "img.r1", 8192);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        let image = reg.get("img", 1, false).unwrap();
        assert!(image.crc_manifest().is_none());

        let file = std::fs::File::open(&path).unwrap();
        let manifest = crate::crc::generate_manifest(&file, 8192, || false).unwrap();
        manifest.save(&path).unwrap();
        reg.reload(None).unwrap();
        // Same object, now carrying the manifest.
        assert!(image.crc_manifest().is_some());
        reg.shutdown();
    }

    #[test]
    fn reload_replaces_resized_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = put_image(dir.path(), "img.r1", 4096);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        let old = reg.get("img", 1, false).unwrap();

        std::fs::File::options()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[0_u8; 4096])
            .unwrap();
        reg.reload(None).unwrap();
        let new = reg.get("img", 1, false).unwrap();
        assert_ne!(old.id(), new.id());
        assert_eq!(new.real_size(), 8192);
        reg.shutdown();
    }

    #[test]
    fn reap_refuses_recent_images() {
        let dir = tempfile::tempdir().unwrap();
        put_image(dir.path(), "img.r1", 4096);
        let reg = registry(dir.path());
        reg.reload(None).unwrap();
        let image = reg.get("img", 1, false).unwrap();
        image.touch();
        drop(image);
        // Freshly touched: no victim available.
        assert!(reg.pick_reap_victim().is_none());
        reg.shutdown();
    }

    #[test]
    fn vanished_images_removed_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = put_image(dir.path(), "img.r1", 4096);
        let reg = Registry::new(RegistryConfig {
            base_path: dir.path().to_owned(),
            remove_missing: true,
            ..RegistryConfig::default()
        })
        .unwrap();
        reg.reload(None).unwrap();
        assert!(reg.get("img", 1, false).is_some());
        std::fs::remove_file(&path).unwrap();
        reg.reload(None).unwrap();
        assert!(reg.get("img", 1, false).is_none());
        reg.shutdown();
    }
}
