#![forbid(unsafe_code)]
//! Image cache-and-replication engine.
//!
//! On-disk layout per image revision:
//!
//! - `<name>.r<rid>` — the backing file, `real_size` bytes; reads past
//!   it up to the 4 KiB-rounded virtual size return zeros.
//! - `<name>.r<rid>.map` — the cache bitmap, one bit per 4 KiB block.
//! - `<name>.r<rid>.crc` — master CRC plus one CRC-32 word per 16 MiB
//!   hash-block, little-endian.
//!
//! The [`registry::Registry`] owns image lifetimes; [`image::Image`]
//! carries per-revision state; [`integrity::IntegrityChecker`]
//! re-verifies hash-blocks in the background.

pub mod cache_map;
pub mod crc;
pub mod image;
pub mod integrity;
pub mod registry;

pub use cache_map::CacheMap;
pub use crc::{CrcManifest, compute_block_crc, crc_path, generate_manifest};
pub use image::{
    Image, ReplySink, UplinkHandle, UplinkSeed, UplinkStarter, is_forbidden_extension, map_path,
    parse_rid_suffix,
};
pub use integrity::IntegrityChecker;
pub use registry::{ImageSummary, Registry, RegistryConfig, RemoteClone, RemoteCloner};
