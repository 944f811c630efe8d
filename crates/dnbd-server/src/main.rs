#![forbid(unsafe_code)]
//! `dnbdd` — replicating read-only block image proxy.

use clap::{Parser, Subcommand};
use dnbd_error::{DnbdError, Result};
use dnbd_image::{Registry, RegistryConfig, generate_manifest};
use dnbd_server::cloner::AltServerCloner;
use dnbd_server::config::{self, Config};
use dnbd_server::threadpool::ThreadPool;
use dnbd_server::client;
use dnbd_uplink::{AltServerRegistry, ProbeConfig, RttProber, UplinkConfig, UplinkFactory};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Idle client-session workers kept around.
const MAX_IDLE_WORKERS: usize = 8;
/// Interval of the idle-fd closing pass.
const FD_CLOSE_INTERVAL: Duration = Duration::from_secs(900);
/// An image must be idle this long before its fd is closed.
const FD_CLOSE_IDLE: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "dnbdd", about = "Replicating read-only block image proxy")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the server.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "/etc/dnbd/server.toml")]
        config: PathBuf,
    },
    /// Scan a base directory and print the images found.
    List {
        /// Image base directory.
        base: PathBuf,
    },
    /// Generate the `.crc` sidecar for an image file.
    GenerateCrc {
        /// Path to the `<name>.r<rid>` backing file.
        image: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        CliCommand::Serve { config } => serve(&config),
        CliCommand::List { base } => list(base),
        CliCommand::GenerateCrc { image } => generate_crc(&image),
    };
    if let Err(err) = result {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn serve(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load(config_path)?;
    info!(
        base_path = %config.base_path.display(),
        listen = %config.listen,
        proxy = config.is_proxy,
        "starting"
    );

    let alts = Arc::new(AltServerRegistry::new(config.proxy_private_only));
    let alt_dir = config_path.parent().unwrap_or(std::path::Path::new("."));
    for entry in config::load_alt_servers(alt_dir)? {
        if alts.add(entry.host, &entry.comment, entry.private, entry.client_only) {
            info!(host = %entry.host, comment = %entry.comment, "alt-server");
        }
    }
    if config.is_proxy && alts.is_empty() {
        warn!("proxy mode without alt-servers; nothing can be cloned");
    }

    let registry = Registry::new(RegistryConfig {
        base_path: config.base_path.clone(),
        max_images: config.max_images,
        is_proxy: config.is_proxy,
        sparse_files: config.sparse_files,
        remove_missing: config.remove_missing_images,
        max_replication_size: config.max_replication_size,
    })?;

    let prober = RttProber::start(
        Arc::clone(&alts),
        ProbeConfig {
            io_timeout: config.uplink_timeout(),
            ..ProbeConfig::default()
        },
    )?;
    let factory = UplinkFactory::new(
        Arc::clone(&alts),
        Arc::clone(&prober),
        UplinkConfig {
            uplink_timeout: config.uplink_timeout(),
            background_replication: config.background_replication,
            bgr_min_clients: config.bgr_min_clients,
            ..UplinkConfig::default()
        },
    );
    registry.set_uplink_starter(factory);
    if config.is_proxy && config.lookup_missing_for_proxy {
        registry.set_cloner(AltServerCloner::new(
            Arc::clone(&alts),
            config.uplink_timeout(),
        ));
    }

    registry.reload(None)?;

    if config.close_unused_fd {
        let registry = Arc::clone(&registry);
        std::thread::Builder::new()
            .name("dnbd-fdclose".to_owned())
            .spawn(move || loop {
                std::thread::sleep(FD_CLOSE_INTERVAL);
                registry.close_unused_fds(FD_CLOSE_IDLE);
            })?;
    }

    let listener = TcpListener::bind(&config.listen)?;
    info!(listen = %config.listen, "accepting clients");
    let pool = ThreadPool::new(MAX_IDLE_WORKERS);
    let shared_config = Arc::new(config);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let registry = Arc::clone(&registry);
        let alts = Arc::clone(&alts);
        let config = Arc::clone(&shared_config);
        pool.run(move || client::handle_client(stream, &registry, &alts, &config))?;
    }
    registry.shutdown();
    prober.shutdown();
    pool.shutdown();
    Ok(())
}

fn list(base: PathBuf) -> Result<()> {
    let registry = Registry::new(RegistryConfig {
        base_path: base,
        ..RegistryConfig::default()
    })?;
    registry.reload(None)?;
    let mut images = registry.list();
    images.sort_by(|a, b| (&a.name, a.rid).cmp(&(&b.name, b.rid)));
    println!("{:<40} {:>5} {:>9} {:>10}", "name", "rid", "complete", "size");
    for image in &images {
        println!(
            "{:<40} {:>5} {:>8}% {:>10}",
            image.name, image.rid, image.completeness, image.virtual_size
        );
    }
    registry.shutdown();
    Ok(())
}

fn generate_crc(image: &std::path::Path) -> Result<()> {
    let crc_path = dnbd_image::crc_path(image);
    if crc_path.exists() {
        return Err(DnbdError::Config(format!(
            "{} already exists; delete it first to regenerate",
            crc_path.display()
        )));
    }
    let file = std::fs::File::open(image)?;
    let real_size = file.metadata()?.len();
    if real_size == 0 {
        return Err(DnbdError::Config("image file is empty".to_owned()));
    }
    info!(image = %image.display(), size = real_size, "computing crc list");
    let manifest = generate_manifest(&file, real_size, || false)?;
    manifest.save(image)?;
    info!(
        crc_file = %crc_path.display(),
        blocks = manifest.len(),
        master = format_args!("{:#010x}", manifest.master()),
        "crc list written"
    );
    Ok(())
}
