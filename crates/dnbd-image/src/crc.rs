//! CRC-32 manifest handling.
//!
//! The `.crc` sidecar holds one little-endian CRC-32 word per 16 MiB
//! hash-block, preceded by a master CRC computed over the list itself.
//! A bad master CRC discards the manifest but not the image. Per-block
//! verification reads the backing file at its real length and extends
//! with zeros up to the virtual length, so the checksums are stable no
//! matter how much of the 4 KiB tail padding exists on disk.

use crc32fast::Hasher;
use dnbd_error::{DnbdError, Result};
use dnbd_types::{BLOCK_SIZE, HASH_BLOCK_SIZE, hash_block_count, virtual_size};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Read chunk for checksum computation.
const CRC_BUFFER_SIZE: usize = 256 * 1024;

/// Sidecar path for an image backing file.
#[must_use]
pub fn crc_path(image_path: &Path) -> PathBuf {
    let mut os = image_path.as_os_str().to_owned();
    os.push(".crc");
    PathBuf::from(os)
}

/// A validated CRC-32 manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcManifest {
    master: u32,
    crcs: Vec<u32>,
}

impl CrcManifest {
    /// Build a manifest from per-block words, computing the master CRC.
    #[must_use]
    pub fn new(crcs: Vec<u32>) -> Self {
        let master = Self::master_of(&crcs);
        Self { master, crcs }
    }

    /// Adopt `(master, words)` as received over the wire, validating
    /// the master CRC.
    pub fn from_parts(master: u32, crcs: Vec<u32>) -> Result<Self> {
        let computed = Self::master_of(&crcs);
        if computed != master {
            return Err(DnbdError::Corruption {
                hash_block: usize::MAX,
                expected: master,
                actual: computed,
            });
        }
        Ok(Self { master, crcs })
    }

    /// CRC-32 over the little-endian byte representation of the list.
    #[must_use]
    pub fn master_of(crcs: &[u32]) -> u32 {
        let mut hasher = Hasher::new();
        for crc in crcs {
            hasher.update(&crc.to_le_bytes());
        }
        hasher.finalize()
    }

    #[must_use]
    pub fn master(&self) -> u32 {
        self.master
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.crcs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.crcs.is_empty()
    }

    #[must_use]
    pub fn crc(&self, block: usize) -> Option<u32> {
        self.crcs.get(block).copied()
    }

    #[must_use]
    pub fn crcs(&self) -> &[u32] {
        &self.crcs
    }

    /// Load the sidecar next to `image_path`. Returns `Ok(None)` when
    /// there is no usable manifest: missing file, short file, or master
    /// CRC mismatch (the latter two log a warning).
    pub fn load(image_path: &Path, real_size: u64) -> Result<Option<Self>> {
        let path = crc_path(image_path);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let blocks = hash_block_count(virtual_size(real_size));
        let expected = (blocks + 1) * 4;
        let mut raw = Vec::with_capacity(expected);
        file.read_to_end(&mut raw)?;
        if raw.len() < expected {
            warn!(
                target: "dnbd::image::crc",
                event = "crc_list_short",
                path = %path.display(),
                got = raw.len(),
                expected,
            );
            return Ok(None);
        }
        let master = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let crcs: Vec<u32> = raw[4..expected]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        match Self::from_parts(master, crcs) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(_) => {
                warn!(
                    target: "dnbd::image::crc",
                    event = "crc_master_mismatch",
                    path = %path.display(),
                );
                Ok(None)
            }
        }
    }

    /// Persist the manifest as the `.crc` sidecar of `image_path`.
    pub fn save(&self, image_path: &Path) -> Result<()> {
        let mut raw = Vec::with_capacity((self.crcs.len() + 1) * 4);
        raw.extend_from_slice(&self.master.to_le_bytes());
        for crc in &self.crcs {
            raw.extend_from_slice(&crc.to_le_bytes());
        }
        std::fs::write(crc_path(image_path), raw)?;
        Ok(())
    }

    /// Verify one hash-block of `file` against the manifest.
    pub fn check_block(&self, file: &File, block: usize, real_size: u64) -> Result<bool> {
        let expected = self
            .crc(block)
            .ok_or_else(|| DnbdError::Protocol(format!("hash block {block} out of range")))?;
        let actual = compute_block_crc(file, block, real_size)?;
        if actual != expected {
            warn!(
                target: "dnbd::image::crc",
                event = "hash_block_mismatch",
                block,
                expected = format_args!("{expected:#010x}"),
                actual = format_args!("{actual:#010x}"),
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// CRC-32 of one hash-block: real bytes from the file, zero-extended
/// to the virtual length.
pub fn compute_block_crc(file: &File, block: usize, real_size: u64) -> Result<u32> {
    let start = block as u64 * HASH_BLOCK_SIZE;
    let from_file = HASH_BLOCK_SIZE.min(real_size.saturating_sub(start));
    let virtual_span = HASH_BLOCK_SIZE.min(virtual_size(real_size).saturating_sub(start));
    let mut hasher = Hasher::new();
    let mut buffer = vec![0_u8; CRC_BUFFER_SIZE];
    let mut done = 0_u64;
    while done < from_file {
        let want = CRC_BUFFER_SIZE.min((from_file - done) as usize);
        let got = file.read_at(&mut buffer[..want], start + done)?;
        if got == 0 {
            return Err(DnbdError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backing file shorter than expected",
            )));
        }
        hasher.update(&buffer[..got]);
        done += got as u64;
    }
    if from_file < virtual_span {
        buffer.iter_mut().for_each(|b| *b = 0);
        let mut pad = virtual_span - from_file;
        while pad > 0 {
            let n = (CRC_BUFFER_SIZE as u64).min(pad) as usize;
            hasher.update(&buffer[..n]);
            pad -= n as u64;
        }
    }
    Ok(hasher.finalize())
}

/// Compute a full manifest for an image file, e.g. from the CLI.
/// Interrupts between hash-blocks when `cancel` returns true.
pub fn generate_manifest<F: Fn() -> bool>(
    file: &File,
    real_size: u64,
    cancel: F,
) -> Result<CrcManifest> {
    let blocks = hash_block_count(virtual_size(real_size));
    let mut crcs = Vec::with_capacity(blocks);
    for block in 0..blocks {
        if cancel() {
            return Err(DnbdError::Cancelled);
        }
        crcs.push(compute_block_crc(file, block, real_size)?);
    }
    Ok(CrcManifest::new(crcs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(len: usize, fill: u8) -> (tempfile::TempDir, std::path::PathBuf, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![fill; len]).unwrap();
        let f = File::open(&path).unwrap();
        (dir, path, f)
    }

    #[test]
    fn block_crc_zero_fills_virtual_tail() {
        // 9000 real bytes; CRC must equal that of 12288 bytes with the
        // tail zeroed.
        let (_dir, _path, file) = scratch_file(9000, 0xab);
        let crc = compute_block_crc(&file, 0, 9000).unwrap();
        let mut reference = vec![0xab_u8; 9000];
        reference.resize(12288, 0);
        assert_eq!(crc, crc32fast::hash(&reference));
    }

    #[test]
    fn manifest_roundtrips_through_sidecar() {
        let (_dir, path, file) = scratch_file(5 * BLOCK_SIZE as usize, 0x5a);
        let manifest = generate_manifest(&file, 5 * BLOCK_SIZE, || false).unwrap();
        assert_eq!(manifest.len(), 1);
        manifest.save(&path).unwrap();
        let loaded = CrcManifest::load(&path, 5 * BLOCK_SIZE).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn corrupt_master_discards_manifest() {
        let (_dir, path, file) = scratch_file(4096, 1);
        let manifest = generate_manifest(&file, 4096, || false).unwrap();
        manifest.save(&path).unwrap();
        let sidecar = crc_path(&path);
        let mut raw = std::fs::read(&sidecar).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&sidecar, raw).unwrap();
        assert_eq!(CrcManifest::load(&path, 4096).unwrap(), None);
    }

    #[test]
    fn short_sidecar_is_ignored() {
        let (_dir, path, _file) = scratch_file(4096, 1);
        std::fs::write(crc_path(&path), [1, 2, 3]).unwrap();
        assert_eq!(CrcManifest::load(&path, 4096).unwrap(), None);
    }

    #[test]
    fn check_block_detects_mismatch() {
        let (_dir, path, file) = scratch_file(8192, 7);
        let manifest = generate_manifest(&file, 8192, || false).unwrap();
        assert!(manifest.check_block(&file, 0, 8192).unwrap());

        // Flip a byte on disk.
        let rw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        rw.write_all_at(&[0xee], 100).unwrap();
        let file = File::open(&path).unwrap();
        assert!(!manifest.check_block(&file, 0, 8192).unwrap());
    }

    #[test]
    fn wire_parts_validated() {
        let manifest = CrcManifest::new(vec![10, 20, 30]);
        assert!(CrcManifest::from_parts(manifest.master(), vec![10, 20, 30]).is_ok());
        assert!(CrcManifest::from_parts(manifest.master() ^ 1, vec![10, 20, 30]).is_err());
    }
}
