//! Background CRC verification of completed hash-blocks.
//!
//! A single worker thread drains a bounded, deduplicated queue of
//! `(image, hash-block)` pairs. A mismatch clears the hash-block's
//! cache-map bits so the uplink fetches it again; the queue holds weak
//! image references so a pending check never keeps a dead image alive.

use crate::image::Image;
use dnbd_error::Result;
use dnbd_types::HASH_BLOCK_SIZE;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

const CHECK_QUEUE_SIZE: usize = 100;

#[derive(Clone)]
struct CheckEntry {
    image: Weak<Image>,
    image_id: dnbd_types::ImageId,
    /// `None` requests a full sweep over all complete hash-blocks.
    block: Option<usize>,
}

struct CheckQueue {
    entries: Vec<CheckEntry>,
}

/// Handle to the integrity checker thread.
pub struct IntegrityChecker {
    queue: Mutex<CheckQueue>,
    signal: Condvar,
    stop: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl IntegrityChecker {
    /// Start the checker thread.
    pub fn start() -> Result<Arc<Self>> {
        let checker = Arc::new(Self {
            queue: Mutex::new(CheckQueue {
                entries: Vec::with_capacity(CHECK_QUEUE_SIZE),
            }),
            signal: Condvar::new(),
            stop: AtomicBool::new(false),
            join: Mutex::new(None),
        });
        let worker = Arc::clone(&checker);
        let join = std::thread::Builder::new()
            .name("dnbd-integrity".to_owned())
            .spawn(move || worker.run())?;
        *checker.join.lock() = Some(join);
        Ok(checker)
    }

    /// Queue one hash-block of `image` for verification. Duplicates
    /// and overflow are silently dropped.
    pub fn enqueue_block(&self, image: &Arc<Image>, block: usize) {
        self.enqueue(image, Some(block));
    }

    /// Queue a full check of every complete hash-block of `image`.
    pub fn enqueue_full(&self, image: &Arc<Image>) {
        self.enqueue(image, None);
    }

    fn enqueue(&self, image: &Arc<Image>, block: Option<usize>) {
        let mut queue = self.queue.lock();
        if queue
            .entries
            .iter()
            .any(|e| e.image_id == image.id() && e.block == block)
        {
            return;
        }
        if queue.entries.len() >= CHECK_QUEUE_SIZE {
            debug!(target: "dnbd::integrity", event = "queue_full");
            return;
        }
        queue.entries.push(CheckEntry {
            image: Arc::downgrade(image),
            image_id: image.id(),
            block,
        });
        self.signal.notify_one();
    }

    /// Ask the worker to drain and exit, then join it.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.signal.notify_one();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }

    fn run(&self) {
        let mut queue = self.queue.lock();
        while !self.stop.load(Ordering::Acquire) {
            if let Some(entry) = queue.entries.pop() {
                drop(queue);
                self.process(&entry);
                queue = self.queue.lock();
            } else {
                self.signal.wait(&mut queue);
            }
        }
        drop(queue);
        info!(target: "dnbd::integrity", event = "checker_stopped");
    }

    fn process(&self, entry: &CheckEntry) {
        let Some(image) = entry.image.upgrade() else {
            return;
        };
        let Some(manifest) = image.crc_manifest() else {
            return;
        };
        match entry.block {
            Some(block) => self.check_one(&image, &manifest, block),
            None => {
                for block in 0..manifest.len() {
                    if self.stop.load(Ordering::Acquire) {
                        return;
                    }
                    let complete =
                        image.with_cache_map(|map| map.map_or(true, |m| m.is_hash_block_complete(block)));
                    if complete {
                        self.check_one(&image, &manifest, block);
                    }
                }
            }
        }
    }

    fn check_one(&self, image: &Arc<Image>, manifest: &crate::crc::CrcManifest, block: usize) {
        let file = match image.ensure_open() {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    target: "dnbd::integrity",
                    event = "open_failed",
                    name = %image.name(),
                    rid = image.rid(),
                    error = %err,
                );
                return;
            }
        };
        match manifest.check_block(&file, block, image.real_size()) {
            Ok(true) => {
                debug!(
                    target: "dnbd::integrity",
                    event = "hash_block_ok",
                    name = %image.name(),
                    rid = image.rid(),
                    block,
                );
            }
            Ok(false) => {
                warn!(
                    target: "dnbd::integrity",
                    event = "hash_block_invalidated",
                    name = %image.name(),
                    rid = image.rid(),
                    block,
                );
                let start = block as u64 * HASH_BLOCK_SIZE;
                let end = (start + HASH_BLOCK_SIZE).min(image.virtual_size());
                image.mark_range_absent(start, end);
            }
            Err(err) => {
                warn!(
                    target: "dnbd::integrity",
                    event = "check_failed",
                    name = %image.name(),
                    rid = image.rid(),
                    block,
                    error = %err,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::generate_manifest;
    use dnbd_types::{BLOCK_SIZE, ImageId};
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use std::time::Duration;

    fn loaded_image(dir: &std::path::Path, len: usize) -> Arc<Image> {
        let path = dir.join("t.r1");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0x33_u8; len]).unwrap();
        let file = File::open(&path).unwrap();
        let manifest = generate_manifest(&file, len as u64, || false).unwrap();
        manifest.save(&path).unwrap();
        Arc::new(Image::load_from_disk(dir, &path, ImageId(1)).unwrap())
    }

    #[test]
    fn mismatch_clears_hash_block_bits() {
        let dir = tempfile::tempdir().unwrap();
        let len = 8 * BLOCK_SIZE as usize;
        let image = loaded_image(dir.path(), len);
        assert!(!image.has_cache_map());

        // Corrupt the backing file behind the manifest's back.
        let rw = std::fs::OpenOptions::new()
            .write(true)
            .open(image.path())
            .unwrap();
        rw.write_all_at(&[0xee], 10).unwrap();

        let checker = IntegrityChecker::start().unwrap();
        checker.enqueue_block(&image, 0);
        // The worker picks the entry up quickly; poll until the bits
        // are gone.
        for _ in 0..100 {
            if image.has_cache_map() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        checker.shutdown();
        assert!(image.has_cache_map());
        assert!(!image.is_range_cached(0, BLOCK_SIZE));
        assert!(!image.is_range_cached(7 * BLOCK_SIZE, 8 * BLOCK_SIZE));
    }

    #[test]
    fn intact_block_passes() {
        let dir = tempfile::tempdir().unwrap();
        let image = loaded_image(dir.path(), 2 * BLOCK_SIZE as usize);
        let checker = IntegrityChecker::start().unwrap();
        checker.enqueue_full(&image);
        std::thread::sleep(Duration::from_millis(100));
        checker.shutdown();
        assert!(!image.has_cache_map());
    }

    #[test]
    fn duplicate_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let image = loaded_image(dir.path(), BLOCK_SIZE as usize);
        let checker = IntegrityChecker::start().unwrap();
        // Stop the worker from draining while we inspect the queue.
        let guard = checker.queue.lock();
        drop(guard);
        checker.shutdown();
        checker.enqueue_block(&image, 0);
        checker.enqueue_block(&image, 0);
        assert_eq!(checker.queue.lock().entries.len(), 1);
    }
}
