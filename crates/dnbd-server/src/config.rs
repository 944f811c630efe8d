//! Server configuration: the TOML config file and the `alt-servers`
//! list.
//!
//! All values are process-wide constants once the server is up; the
//! loaded struct is shared immutably with every subsystem.

use dnbd_error::{DnbdError, Result};
use dnbd_types::Host;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the image files and their sidecars.
    pub base_path: PathBuf,
    /// Address the server listens on.
    pub listen: String,
    /// Clone unknown images from alt-servers on demand.
    pub is_proxy: bool,
    /// Replicate missing blocks even without client interest.
    pub background_replication: bool,
    /// Background replication needs at least this many clients.
    pub bgr_min_clients: usize,
    /// Don't preallocate clone files.
    pub sparse_files: bool,
    /// Upstream socket timeout, milliseconds.
    pub uplink_timeout: u64,
    /// Client socket timeout, milliseconds.
    pub client_timeout: u64,
    /// Periodically close read fds of idle images.
    pub close_unused_fd: bool,
    /// Drop registry entries whose backing file vanished.
    pub remove_missing_images: bool,
    pub max_images: usize,
    /// Refuse to clone images larger than this.
    pub max_replication_size: u64,
    /// In proxy mode, ask upstreams about images we do not know.
    pub lookup_missing_for_proxy: bool,
    /// Only replicate from alt-servers flagged private.
    pub proxy_private_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/srv/dnbd"),
            listen: "0.0.0.0:5003".to_owned(),
            is_proxy: false,
            background_replication: true,
            bgr_min_clients: 0,
            sparse_files: false,
            uplink_timeout: 1250,
            client_timeout: 15_000,
            close_unused_fd: false,
            remove_missing_images: false,
            max_images: 1024,
            max_replication_size: u64::MAX,
            lookup_missing_for_proxy: true,
            proxy_private_only: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| DnbdError::Config(err.to_string()))
    }

    #[must_use]
    pub fn uplink_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink_timeout)
    }

    #[must_use]
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout)
    }
}

/// One entry of the `alt-servers` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltServerEntry {
    pub host: Host,
    pub comment: String,
    /// `-` prefix: replication only, never advertised to clients.
    pub private: bool,
    /// `+` prefix: advertised only, never used for replication.
    pub client_only: bool,
}

/// Parse the `alt-servers` file: one `host:port` per line, optionally
/// prefixed with `-` or `+`, optionally followed by a comment.
/// Unparsable lines are skipped with a warning.
pub fn parse_alt_servers(raw: &str) -> Vec<AltServerEntry> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut private = false;
        let mut client_only = false;
        let mut rest = line;
        loop {
            if let Some(stripped) = rest.strip_prefix('-') {
                private = true;
                rest = stripped.trim_start();
            } else if let Some(stripped) = rest.strip_prefix('+') {
                client_only = true;
                rest = stripped.trim_start();
            } else {
                break;
            }
        }
        let (addr, comment) = match rest.split_once(char::is_whitespace) {
            Some((addr, comment)) => (addr, comment.trim()),
            None => (rest, ""),
        };
        match addr.parse::<Host>() {
            Ok(host) => entries.push(AltServerEntry {
                host,
                comment: comment.to_owned(),
                private,
                client_only,
            }),
            Err(_) => {
                warn!(
                    target: "dnbd::config",
                    event = "bad_alt_server_line",
                    line,
                );
            }
        }
    }
    entries
}

/// Load `alt-servers` next to the config file, if present.
pub fn load_alt_servers(config_dir: &Path) -> Result<Vec<AltServerEntry>> {
    let path = config_dir.join("alt-servers");
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(parse_alt_servers(&raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}
