#![forbid(unsafe_code)]
//! Full-stack tests: a real server on a loopback socket, spoken to
//! with the wire protocol; and a proxy instance cloning an image from
//! an origin instance on demand.

use dnbd_image::{Registry, RegistryConfig, crc_path, generate_manifest, map_path};
use dnbd_proto::{Command, Reply, client as proto_client};
use dnbd_server::client::handle_client;
use dnbd_server::cloner::AltServerCloner;
use dnbd_server::config::Config;
use dnbd_types::{BLOCK_SIZE, Host};
use dnbd_uplink::{AltServerRegistry, ProbeConfig, RttProber, UplinkConfig, UplinkFactory};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Stack {
    registry: Arc<Registry>,
    prober: Arc<RttProber>,
    host: Host,
}

fn boot(base: &Path, is_proxy: bool, upstreams: &[Host]) -> Stack {
    let config = Arc::new(Config {
        base_path: base.to_owned(),
        is_proxy,
        background_replication: true,
        ..Config::default()
    });
    let alts = Arc::new(AltServerRegistry::new(false));
    for upstream in upstreams {
        alts.add(*upstream, "origin", false, false);
    }
    let registry = Registry::new(RegistryConfig {
        base_path: base.to_owned(),
        is_proxy,
        ..RegistryConfig::default()
    })
    .unwrap();
    let prober = RttProber::start(Arc::clone(&alts), ProbeConfig::default()).unwrap();
    registry.set_uplink_starter(UplinkFactory::new(
        Arc::clone(&alts),
        Arc::clone(&prober),
        UplinkConfig::default(),
    ));
    if is_proxy {
        registry.set_cloner(AltServerCloner::new(
            Arc::clone(&alts),
            Duration::from_millis(1250),
        ));
    }
    registry.reload(None).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let host = Host::from_socket_addr(listener.local_addr().unwrap());
    {
        let registry = Arc::clone(&registry);
        let alts = Arc::clone(&alts);
        let config = Arc::clone(&config);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let registry = Arc::clone(&registry);
                let alts = Arc::clone(&alts);
                let config = Arc::clone(&config);
                std::thread::spawn(move || handle_client(stream, &registry, &alts, &config));
            }
        });
    }
    Stack {
        registry,
        prober,
        host,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn put_origin_image(base: &Path, rel: &str, content: &[u8]) {
    let path = base.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    generate_manifest(&file, content.len() as u64, || false)
        .unwrap()
        .save(&path)
        .unwrap();
}

fn fetch_block(stream: &mut TcpStream, offset: u64, size: u32, handle: u64) -> Vec<u8> {
    proto_client::request_block(stream, offset, size, handle, 0).unwrap();
    loop {
        let reply = Reply::read_from(stream).unwrap();
        let mut payload = vec![0_u8; reply.size as usize];
        stream.read_exact(&mut payload).unwrap();
        if reply.cmd == Command::GetBlock && reply.handle == handle {
            return payload;
        }
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn serves_complete_image_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let content = pattern(8 * BLOCK_SIZE as usize);
    put_origin_image(dir.path(), "vm/alpine.r2", &content);
    let stack = boot(dir.path(), false, &[]);

    let mut stream = proto_client::connect(
        &stack.host,
        Duration::from_secs(1),
        Duration::from_secs(5),
    )
    .unwrap();
    // rid 0 resolves to the highest (only) revision.
    let offer = proto_client::select_image(&mut stream, "vm/alpine", 0, 0).unwrap();
    assert_eq!(offer.rid, 2);
    assert_eq!(offer.virtual_size, content.len() as u64);

    let payload = fetch_block(&mut stream, 8192, BLOCK_SIZE as u32, 77);
    assert_eq!(payload, content[8192..8192 + BLOCK_SIZE as usize]);

    // The CRC list travels over the wire intact.
    let (master, crcs) = proto_client::fetch_crc_list(&mut stream).unwrap().unwrap();
    let manifest = dnbd_image::CrcManifest::load(
        &dir.path().join("vm/alpine.r2"),
        content.len() as u64,
    )
    .unwrap()
    .unwrap();
    assert_eq!(master, manifest.master());
    assert_eq!(crcs, manifest.crcs());

    // No alt-servers configured: empty list.
    assert!(proto_client::fetch_server_list(&mut stream).unwrap().is_empty());

    stack.registry.shutdown();
    stack.prober.shutdown();
}

#[test]
fn unknown_image_yields_error_reply() {
    let dir = tempfile::tempdir().unwrap();
    let stack = boot(dir.path(), false, &[]);
    let mut stream = proto_client::connect(
        &stack.host,
        Duration::from_secs(1),
        Duration::from_secs(5),
    )
    .unwrap();
    assert!(proto_client::select_image(&mut stream, "no/such", 1, 0).is_err());
    stack.registry.shutdown();
    stack.prober.shutdown();
}

#[test]
fn proxy_clones_and_serves_via_uplink() {
    let origin_dir = tempfile::tempdir().unwrap();
    let proxy_dir = tempfile::tempdir().unwrap();
    let content = pattern(16 * BLOCK_SIZE as usize);
    put_origin_image(origin_dir.path(), "vm/alpine.r2", &content);

    let origin = boot(origin_dir.path(), false, &[]);
    let proxy = boot(proxy_dir.path(), true, &[origin.host]);

    let mut stream = proto_client::connect(
        &proxy.host,
        Duration::from_secs(1),
        Duration::from_secs(10),
    )
    .unwrap();
    let offer = proto_client::select_image(&mut stream, "vm/alpine", 0, 0).unwrap();
    assert_eq!(offer.rid, 2);
    assert_eq!(offer.virtual_size, content.len() as u64);

    // The clone set up backing file, cache map and crc sidecar.
    let cloned = proxy_dir.path().join("vm/alpine.r2");
    assert!(cloned.is_file());
    assert!(map_path(&cloned).is_file());
    assert!(crc_path(&cloned).is_file());

    // A read of uncached data is satisfied through the uplink.
    let payload = fetch_block(&mut stream, 4 * BLOCK_SIZE, BLOCK_SIZE as u32, 5);
    assert_eq!(
        payload,
        content[4 * BLOCK_SIZE as usize..5 * BLOCK_SIZE as usize]
    );

    // Background replication finishes the rest without further reads.
    let image = proxy.registry.get("vm/alpine", 2, false).unwrap();
    assert!(wait_until(Duration::from_secs(20), || {
        image.is_range_cached(0, content.len() as u64)
    }));
    assert_eq!(std::fs::read(&cloned).unwrap(), content);

    // A second read now comes from the local cache.
    let payload = fetch_block(&mut stream, 12 * BLOCK_SIZE, BLOCK_SIZE as u32, 6);
    assert_eq!(
        payload,
        content[12 * BLOCK_SIZE as usize..13 * BLOCK_SIZE as usize]
    );

    proxy.registry.shutdown();
    proxy.prober.shutdown();
    origin.registry.shutdown();
    origin.prober.shutdown();
}
