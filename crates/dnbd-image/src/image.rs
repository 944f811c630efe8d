//! Image objects: one immutable revision of a named disk image plus
//! its sidecars and runtime state.
//!
//! Lifetime model: the registry hands out `Arc<Image>` references; the
//! slot in the registry holds one of them. Removal from the registry
//! drops the slot's reference while in-flight users keep the image
//! alive; the last drop closes the backing file and signals the uplink
//! worker to wind down. Nothing here unlinks files except the cache-map
//! sidecar on the one-way transition to complete.

use crate::cache_map::CacheMap;
use crate::crc::{CrcManifest, crc_path};
use crate::integrity::IntegrityChecker;
use dnbd_error::{DnbdError, Result};
use dnbd_types::{BLOCK_SIZE, HASH_BLOCK_SIZE, Host, ImageId, map_bytes, virtual_size};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::net::TcpStream;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

// ── Uplink seam ─────────────────────────────────────────────────────────────

/// Where a completed block reply is fanned out to. Implemented by the
/// client session (socket write under its send mutex) and by test
/// recorders.
pub trait ReplySink: Send + Sync {
    /// Deliver payload bytes for the request identified by `handle`.
    fn deliver(&self, handle: u64, data: &[u8]);
    /// The request cannot be satisfied (shutdown or queue overflow).
    fn fail(&self, handle: u64);
}

/// Handle to a running uplink worker, owned by its image.
pub trait UplinkHandle: Send + Sync {
    /// Enqueue a client read for `offset..offset + length`.
    fn request(&self, sink: Arc<dyn ReplySink>, handle: u64, offset: u64, length: u32)
        -> Result<()>;
    /// Ask the worker to exit. Does not block.
    fn signal_shutdown(&self);
    fn is_shut_down(&self) -> bool;
    fn current_server(&self) -> Option<Host>;
    fn bytes_received(&self) -> u64;
    /// A client session started using this image. Gates background
    /// replication.
    fn client_attached(&self) {}
    /// A client session using this image went away.
    fn client_detached(&self) {}
}

/// An already connected and image-selected upstream socket, handed to
/// a fresh uplink after a remote clone.
pub struct UplinkSeed {
    pub stream: TcpStream,
    pub server: Host,
    pub protocol: u16,
}

/// Factory for uplink workers; wired in by the composition root so the
/// image layer stays free of socket plumbing.
pub trait UplinkStarter: Send + Sync {
    fn start(&self, image: &Arc<Image>, seed: Option<UplinkSeed>) -> Result<Arc<dyn UplinkHandle>>;
}

// ── Path helpers ────────────────────────────────────────────────────────────

/// Split `<base>.r<rid>` into name part and revision.
#[must_use]
pub fn parse_rid_suffix(file_name: &str) -> Option<(&str, u16)> {
    let (name, rid) = file_name.rsplit_once(".r")?;
    if name.is_empty() || rid.is_empty() || !rid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rid: u32 = rid.parse().ok()?;
    if rid == 0 || rid > u32::from(u16::MAX) {
        return None;
    }
    Some((name, rid as u16))
}

/// Sidecar extensions that must never be loaded as images.
#[must_use]
pub fn is_forbidden_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("crc" | "map" | "meta")
    )
}

/// Cache-map sidecar path for an image backing file.
#[must_use]
pub fn map_path(image_path: &Path) -> PathBuf {
    let mut os = image_path.as_os_str().to_owned();
    os.push(".map");
    PathBuf::from(os)
}

// ── Image ───────────────────────────────────────────────────────────────────

/// Completeness-estimate cache window: 8 s plus up to 32 s of jitter.
const ESTIMATE_CACHE_BASE_SECS: u64 = 8;
const ESTIMATE_CACHE_JITTER_SECS: u64 = 32;

#[derive(Debug)]
struct ImageState {
    cache_map: Option<CacheMap>,
    working: bool,
    atime: SystemTime,
    last_work_check: Option<Instant>,
    estimate: Option<(u8, Instant)>,
}

/// One immutable revision of a named disk image.
pub struct Image {
    id: ImageId,
    name: String,
    rid: u16,
    path: PathBuf,
    real_size: u64,
    virtual_size: u64,
    crc: RwLock<Option<Arc<CrcManifest>>>,
    state: Mutex<ImageState>,
    read_file: RwLock<Option<Arc<File>>>,
    cache_file: Mutex<Option<Arc<File>>>,
    uplink: Mutex<Option<Arc<dyn UplinkHandle>>>,
    integrity: Mutex<Option<Arc<IntegrityChecker>>>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rid", &self.rid)
            .field("real_size", &self.real_size)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Load an image from `path` (already known to carry a `.r<rid>`
    /// suffix). Reads the cache-map and CRC sidecars if present; a
    /// complete map is collapsed right away.
    pub fn load_from_disk(base: &Path, path: &Path, id: ImageId) -> Result<Self> {
        let rel = path
            .strip_prefix(base)
            .map_err(|_| DnbdError::InvalidName(path.display().to_string()))?;
        let rel_str = rel
            .to_str()
            .ok_or_else(|| DnbdError::InvalidName(path.display().to_string()))?;
        let (name, rid) = parse_rid_suffix(rel_str)
            .ok_or_else(|| DnbdError::InvalidName(rel_str.to_owned()))?;
        if !dnbd_types::is_valid_image_name(name) {
            return Err(DnbdError::InvalidName(name.to_owned()));
        }

        let file = File::open(path)?;
        let real_size = file.metadata()?.len();
        if real_size == 0 {
            return Err(DnbdError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty image file",
            )));
        }
        let vsize = virtual_size(real_size);

        let cache_map = match std::fs::read(map_path(path)) {
            Ok(bytes) => {
                if bytes.len() < map_bytes(vsize) {
                    warn!(
                        target: "dnbd::image",
                        event = "cache_map_short",
                        path = %path.display(),
                        got = bytes.len(),
                        expected = map_bytes(vsize),
                    );
                }
                Some(CacheMap::from_bytes(bytes, vsize))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let crc = CrcManifest::load(path, real_size)?;
        if let Some(manifest) = &crc {
            if manifest.len() != dnbd_types::hash_block_count(vsize) {
                return Err(DnbdError::Protocol(format!(
                    "crc list length {} does not match image size",
                    manifest.len()
                )));
            }
        }

        let mtime_age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);

        let working = cache_map.is_none();
        let image = Self {
            id,
            name: name.to_owned(),
            rid,
            path: path.to_owned(),
            real_size,
            virtual_size: vsize,
            crc: RwLock::new(crc.map(Arc::new)),
            state: Mutex::new(ImageState {
                cache_map,
                working,
                // Offset atime into the past by the file's age so a
                // restart does not shield everything from eviction.
                atime: SystemTime::now() - mtime_age,
                last_work_check: None,
                estimate: None,
            }),
            read_file: RwLock::new(Some(Arc::new(file))),
            cache_file: Mutex::new(None),
            uplink: Mutex::new(None),
            integrity: Mutex::new(None),
        };
        image.finalize_if_complete();
        Ok(image)
    }

    // ── Identity & metadata ─────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> ImageId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn rid(&self) -> u16 {
        self.rid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn real_size(&self) -> u64 {
        self.real_size
    }

    #[must_use]
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    #[must_use]
    pub fn crc_manifest(&self) -> Option<Arc<CrcManifest>> {
        self.crc.read().clone()
    }

    /// Attach a manifest that appeared on disk after the image was
    /// loaded. Refused when one is already present.
    pub fn attach_crc_manifest(&self, manifest: Arc<CrcManifest>) -> bool {
        let mut slot = self.crc.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(manifest);
        true
    }

    #[must_use]
    pub fn is_working(&self) -> bool {
        self.state.lock().working
    }

    pub fn set_working(&self, working: bool) {
        let mut state = self.state.lock();
        if state.working != working {
            state.working = working;
            info!(
                target: "dnbd::image",
                event = "working_changed",
                name = %self.name,
                rid = self.rid,
                working,
            );
        }
    }

    #[must_use]
    pub fn atime(&self) -> SystemTime {
        self.state.lock().atime
    }

    /// Record a client access.
    pub fn touch(&self) {
        self.state.lock().atime = SystemTime::now();
    }

    /// Attach the integrity checker that newly completed hash-blocks
    /// are reported to.
    pub fn set_integrity(&self, checker: Arc<IntegrityChecker>) {
        *self.integrity.lock() = Some(checker);
    }

    // ── Backing file ────────────────────────────────────────────────

    /// Make sure the read fd is open (it may have been closed by the
    /// idle-fd pass), re-validating the file size on reopen. A failure
    /// flips the image to not-working.
    pub fn ensure_open(&self) -> Result<Arc<File>> {
        if let Some(file) = self.read_file.read().clone() {
            return Ok(file);
        }
        let opened = File::open(&self.path).and_then(|file| {
            let len = file.metadata()?.len();
            if len != self.real_size {
                warn!(
                    target: "dnbd::image",
                    event = "size_changed_on_reopen",
                    path = %self.path.display(),
                    expected = self.real_size,
                    found = len,
                );
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "image size changed",
                ));
            }
            Ok(file)
        });
        match opened {
            Ok(file) => {
                let mut slot = self.read_file.write();
                if let Some(existing) = slot.clone() {
                    // Lost a reopen race; keep the winner.
                    return Ok(existing);
                }
                let file = Arc::new(file);
                *slot = Some(Arc::clone(&file));
                Ok(file)
            }
            Err(err) => {
                self.set_working(false);
                Err(err.into())
            }
        }
    }

    /// Drop the read fd if the image is idle. Returns true if closed.
    pub fn close_unused_fd(&self, idle_for: Duration) -> bool {
        let state = self.state.lock();
        let idle = state
            .atime
            .elapsed()
            .map_or(false, |elapsed| elapsed >= idle_for);
        drop(state);
        if !idle || self.uplink.lock().is_some() {
            return false;
        }
        let mut slot = self.read_file.write();
        if slot.is_none() {
            return false;
        }
        *slot = None;
        debug!(
            target: "dnbd::image",
            event = "idle_fd_closed",
            name = %self.name,
            rid = self.rid,
        );
        true
    }

    /// Read into `buf` at `offset`, serving the zero-filled virtual
    /// tail past the real file size.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&e| e <= self.virtual_size)
            .ok_or(DnbdError::OutOfRange)?;
        let file = self.ensure_open()?;
        let from_file = self.real_size.saturating_sub(offset).min(end - offset) as usize;
        if from_file > 0 {
            file.read_exact_at(&mut buf[..from_file], offset)?;
        }
        buf[from_file..].fill(0);
        Ok(())
    }

    fn cache_file(&self) -> Result<Arc<File>> {
        let mut slot = self.cache_file.lock();
        if let Some(file) = slot.clone() {
            return Ok(file);
        }
        let file = Arc::new(OpenOptions::new().write(true).open(&self.path)?);
        *slot = Some(Arc::clone(&file));
        Ok(file)
    }

    /// Write replicated bytes into the backing file and mark the fully
    /// covered blocks present. The cache-map update happens only after
    /// the write returned success.
    pub fn write_cache(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&e| e <= self.virtual_size)
            .ok_or(DnbdError::OutOfRange)?;
        // Don't write the padding past the real size.
        let writable = self.real_size.saturating_sub(offset).min(data.len() as u64) as usize;
        if writable > 0 {
            self.cache_file()?.write_all_at(&data[..writable], offset)?;
        }
        self.mark_range_present(offset, end);
        Ok(())
    }

    // ── Cache-map ───────────────────────────────────────────────────

    #[must_use]
    pub fn has_cache_map(&self) -> bool {
        self.state.lock().cache_map.is_some()
    }

    /// True iff the given byte range is locally present.
    #[must_use]
    pub fn is_range_cached(&self, start: u64, end: u64) -> bool {
        let state = self.state.lock();
        state
            .cache_map
            .as_ref()
            .map_or(true, |map| map.is_range_present(start, end))
    }

    /// Mark `start..end` present (contracted inward). Hash-blocks the
    /// range touches that are now fully present are queued for an
    /// integrity check, provided a manifest exists.
    pub fn mark_range_present(self: &Arc<Self>, start: u64, end: u64) {
        let mut state = self.state.lock();
        let Some(map) = state.cache_map.as_mut() else {
            debug!(
                target: "dnbd::image",
                event = "cache_write_on_complete_image",
                name = %self.name,
                rid = self.rid,
            );
            return;
        };
        if !map.set_range(start, end) {
            return;
        }
        let mut complete_blocks = Vec::new();
        if self.crc.read().is_some() {
            let first = (start / HASH_BLOCK_SIZE) as usize;
            let last = (end.saturating_sub(1) / HASH_BLOCK_SIZE) as usize;
            for block in first..=last {
                if map.is_hash_block_complete(block) {
                    complete_blocks.push(block);
                }
            }
        }
        drop(state);
        if !complete_blocks.is_empty() {
            if let Some(checker) = self.integrity.lock().clone() {
                for block in complete_blocks {
                    checker.enqueue_block(self, block);
                }
            }
        }
    }

    /// Mark `start..end` absent (expanded outward). Invalidating a
    /// block of a complete image resurrects a full cache-map first.
    pub fn mark_range_absent(self: &Arc<Self>, start: u64, end: u64) {
        let mut state = self.state.lock();
        let map = state
            .cache_map
            .get_or_insert_with(|| CacheMap::new_full(self.virtual_size));
        map.clear_range(start, end);
        state.estimate = None;
        state.working = false;
        drop(state);
    }

    /// Collapse the cache-map and unlink the sidecar once every bit is
    /// set. The transition to complete is permanent. Returns the
    /// complete status.
    pub fn finalize_if_complete(&self) -> bool {
        let mut state = self.state.lock();
        match &state.cache_map {
            None => return true,
            Some(map) if !map.is_complete() => return false,
            Some(_) => {}
        }
        state.cache_map = None;
        state.estimate = None;
        drop(state);
        let sidecar = map_path(&self.path);
        if let Err(err) = std::fs::remove_file(&sidecar) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "dnbd::image",
                    event = "map_unlink_failed",
                    path = %sidecar.display(),
                    error = %err,
                );
            }
        }
        info!(
            target: "dnbd::image",
            event = "replication_complete",
            name = %self.name,
            rid = self.rid,
        );
        true
    }

    /// Rough fill percentage for status output, cached with jitter so
    /// frequent pollers don't rescan the map.
    #[must_use]
    pub fn completeness_estimate(&self) -> u8 {
        let mut state = self.state.lock();
        if state.cache_map.is_none() {
            return if state.working { 100 } else { 0 };
        }
        let now = Instant::now();
        if let Some((cached, until)) = state.estimate {
            if now < until {
                return cached;
            }
        }
        let percent = state
            .cache_map
            .as_ref()
            .map_or(0, CacheMap::completeness_estimate);
        let jitter = rand::thread_rng().gen_range(0..ESTIMATE_CACHE_JITTER_SECS);
        state.estimate = Some((
            percent,
            now + Duration::from_secs(ESTIMATE_CACHE_BASE_SECS + jitter),
        ));
        percent
    }

    /// Run `f` with the cache-map, if any.
    pub fn with_cache_map<T>(&self, f: impl FnOnce(Option<&CacheMap>) -> T) -> T {
        let state = self.state.lock();
        f(state.cache_map.as_ref())
    }

    /// Persist the cache-map sidecar. A no-op on complete images.
    pub fn save_cache_map(&self) -> Result<()> {
        let bytes = {
            let state = self.state.lock();
            match &state.cache_map {
                Some(map) => map.as_bytes().to_vec(),
                None => return Ok(()),
            }
        };
        std::fs::write(map_path(&self.path), bytes)?;
        Ok(())
    }

    // ── Working-state probe ─────────────────────────────────────────

    /// Time-bounded working re-check: seek to end and read a few bytes
    /// at the start, at most once per minute. Returns false when the
    /// image should be scheduled for reload.
    pub fn recheck_working(&self, min_interval: Duration) -> bool {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if state
                .last_work_check
                .is_some_and(|at| now.duration_since(at) < min_interval)
            {
                return true;
            }
            state.last_work_check = Some(now);
        }
        let file = match self.ensure_open() {
            Ok(file) => file,
            Err(_) => return false,
        };
        let probe = file.metadata().map(|m| m.len()).and_then(|len| {
            if len != self.real_size {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "size changed at runtime",
                ));
            }
            let mut buf = [0_u8; 100];
            let want = buf.len().min(self.real_size as usize);
            file.read_exact_at(&mut buf[..want], 0)?;
            Ok(())
        });
        match probe {
            Ok(()) => {
                if !self.is_working() && self.has_cache_map() {
                    // Incomplete images become working again once the
                    // uplink reconnects, not here.
                    return true;
                }
                self.set_working(true);
                true
            }
            Err(err) => {
                warn!(
                    target: "dnbd::image",
                    event = "work_check_failed",
                    name = %self.name,
                    rid = self.rid,
                    error = %err,
                );
                self.set_working(false);
                false
            }
        }
    }

    // ── Uplink wiring ───────────────────────────────────────────────

    #[must_use]
    pub fn uplink(&self) -> Option<Arc<dyn UplinkHandle>> {
        self.uplink.lock().clone()
    }

    /// Install an uplink handle; exactly one per image at a time.
    pub fn set_uplink(&self, handle: Arc<dyn UplinkHandle>) -> Result<()> {
        let mut slot = self.uplink.lock();
        if slot.as_ref().is_some_and(|h| !h.is_shut_down()) {
            return Err(DnbdError::Protocol("uplink already running".to_owned()));
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Detach the uplink handle, typically called by the worker itself
    /// when replication finished or the image went away.
    pub fn clear_uplink(&self) {
        *self.uplink.lock() = None;
    }

    /// Signal the uplink worker to exit, if any.
    pub fn shutdown_uplink(&self) {
        if let Some(handle) = self.uplink.lock().take() {
            handle.signal_shutdown();
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(handle) = self.uplink.get_mut().take() {
            handle.signal_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_image(dir: &Path, rel: &str, len: usize) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0x42_u8; len]).unwrap();
        path
    }

    #[test]
    fn rid_suffix_parsing() {
        assert_eq!(parse_rid_suffix("ubuntu.r7"), Some(("ubuntu", 7)));
        assert_eq!(parse_rid_suffix("a/b.r12345"), Some(("a/b", 12345)));
        assert_eq!(parse_rid_suffix("noext"), None);
        assert_eq!(parse_rid_suffix("zero.r0"), None);
        assert_eq!(parse_rid_suffix("big.r70000"), None);
        assert_eq!(parse_rid_suffix("pad.r1x"), None);
        assert_eq!(parse_rid_suffix(".r5"), None);
    }

    #[test]
    fn forbidden_extensions() {
        assert!(is_forbidden_extension(Path::new("a.r1.crc")));
        assert!(is_forbidden_extension(Path::new("a.r1.map")));
        assert!(is_forbidden_extension(Path::new("a.r1.meta")));
        assert!(!is_forbidden_extension(Path::new("a.r1")));
    }

    #[test]
    fn load_complete_image_without_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "pool/test.r3", 9000);
        let image = Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap();
        assert_eq!(image.name(), "pool/test");
        assert_eq!(image.rid(), 3);
        assert_eq!(image.real_size(), 9000);
        assert_eq!(image.virtual_size(), 12288);
        assert!(!image.has_cache_map());
        assert!(image.is_working());
    }

    #[test]
    fn virtual_tail_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", 9000);
        let image = Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap();
        let mut buf = vec![0xff_u8; 4096];
        image.read_at(8192, &mut buf).unwrap();
        assert!(buf[..808].iter().all(|&b| b == 0x42));
        assert!(buf[808..].iter().all(|&b| b == 0));
        assert!(image.read_at(12288, &mut [0; 1]).is_err());
    }

    #[test]
    fn incomplete_image_finalizes_and_unlinks_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", 5 * BLOCK_SIZE as usize);
        let sidecar = map_path(&path);
        std::fs::write(&sidecar, [0x0f_u8]).unwrap();
        let image = Arc::new(Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap());
        assert!(image.has_cache_map());
        assert!(!image.is_working());
        assert!(!image.finalize_if_complete());

        image.mark_range_present(4 * BLOCK_SIZE, 5 * BLOCK_SIZE);
        assert!(image.finalize_if_complete());
        assert!(!image.has_cache_map());
        assert!(!sidecar.exists());
        // Transition is permanent as long as nothing is invalidated.
        assert!(image.finalize_if_complete());
    }

    #[test]
    fn sub_block_cache_write_not_marked() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", 9000);
        std::fs::write(map_path(&path), [0_u8]).unwrap();
        let image = Arc::new(Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap());
        image.write_cache(0, &vec![1_u8; 3072]).unwrap();
        assert!(!image.is_range_cached(0, 1));
        image.write_cache(0, &vec![1_u8; 4096]).unwrap();
        assert!(image.is_range_cached(0, 4096));
    }

    #[test]
    fn invalidation_resurrects_cache_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", 8192);
        let image = Arc::new(Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap());
        assert!(!image.has_cache_map());
        image.mark_range_absent(0, 4096);
        assert!(image.has_cache_map());
        assert!(!image.is_range_cached(0, 4096));
        assert!(image.is_range_cached(4096, 8192));
    }

    #[test]
    fn estimate_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", 64 * BLOCK_SIZE as usize);
        std::fs::write(map_path(&path), vec![0_u8; 8]).unwrap();
        let image = Arc::new(Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap());
        assert_eq!(image.completeness_estimate(), 0);
        image.mark_range_present(0, 32 * BLOCK_SIZE);
        // Still the cached value from before the write.
        assert_eq!(image.completeness_estimate(), 0);
    }
}
