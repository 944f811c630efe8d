#![forbid(unsafe_code)]
//! End-to-end uplink tests against an in-process upstream speaking the
//! real wire protocol over localhost.

use dnbd_image::{Image, ReplySink, UplinkHandle, map_path};
use dnbd_proto::{Command, ImageOffer, Reply, Request, encode_image_offer};
use dnbd_types::{BLOCK_SIZE, Host, ImageId, map_bytes, virtual_size};
use dnbd_uplink::{AltServerRegistry, ProbeConfig, RttProber, UplinkConfig, UplinkFactory};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dnbd_image::UplinkStarter;

// ── Miniature upstream ──────────────────────────────────────────────────────

struct Upstream {
    host: Host,
    /// GET_BLOCK requests seen, by payload size.
    block_requests: Arc<Mutex<Vec<u32>>>,
}

fn serve_connection(
    mut stream: TcpStream,
    name: String,
    rid: u16,
    content: Arc<Vec<u8>>,
    block_requests: Arc<Mutex<Vec<u32>>>,
    reply_delay: Duration,
) {
    stream.set_nodelay(true).unwrap();
    loop {
        let request = match Request::read_from(&mut stream) {
            Ok(req) => req,
            Err(_) => return,
        };
        match request.cmd {
            Command::SelectImage => {
                let mut payload = vec![0_u8; request.size as usize];
                if stream.read_exact(&mut payload).is_err() {
                    return;
                }
                let offer = encode_image_offer(&ImageOffer {
                    protocol: 3,
                    name: name.clone(),
                    rid,
                    virtual_size: content.len() as u64,
                })
                .unwrap();
                let mut out = Vec::new();
                Reply::new(Command::SelectImage, offer.len() as u32, 0)
                    .write_to(&mut out)
                    .unwrap();
                out.extend_from_slice(&offer);
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
            Command::GetBlock => {
                block_requests.lock().push(request.size);
                std::thread::sleep(reply_delay);
                let start = request.offset as usize;
                let end = start + request.size as usize;
                let mut out = Vec::new();
                Reply::new(Command::GetBlock, request.size, request.handle)
                    .write_to(&mut out)
                    .unwrap();
                out.extend_from_slice(&content[start..end]);
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
            Command::GetCrc32 => {
                let mut out = Vec::new();
                Reply::new(Command::GetCrc32, 0, 0).write_to(&mut out).unwrap();
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

fn spawn_upstream(name: &str, rid: u16, content: Arc<Vec<u8>>, reply_delay: Duration) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let host = Host::from_socket_addr(listener.local_addr().unwrap());
    let block_requests = Arc::new(Mutex::new(Vec::new()));
    let requests = Arc::clone(&block_requests);
    let name = name.to_owned();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            let name = name.clone();
            let content = Arc::clone(&content);
            let requests = Arc::clone(&requests);
            std::thread::spawn(move || {
                serve_connection(stream, name, rid, content, requests, reply_delay);
            });
        }
    });
    Upstream {
        host,
        block_requests,
    }
}

// ── Client-side recorder ────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<(u64, Vec<u8>)>>,
    failed: Mutex<Vec<u64>>,
    fail_count: AtomicUsize,
}

impl ReplySink for Recorder {
    fn deliver(&self, handle: u64, data: &[u8]) {
        self.delivered.lock().push((handle, data.to_vec()));
    }
    fn fail(&self, handle: u64) {
        self.failed.lock().push(handle);
        self.fail_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

// ── Fixtures ────────────────────────────────────────────────────────────────

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

fn incomplete_image(dir: &Path, name: &str, rid: u16, real_size: u64) -> (Arc<Image>, PathBuf) {
    let path = dir.join(format!("{name}.r{rid}"));
    std::fs::write(&path, vec![0_u8; real_size as usize]).unwrap();
    std::fs::write(map_path(&path), vec![0_u8; map_bytes(virtual_size(real_size))]).unwrap();
    let image = Arc::new(Image::load_from_disk(dir, &path, ImageId(1)).unwrap());
    (image, path)
}

struct Rig {
    alts: Arc<AltServerRegistry>,
    prober: Arc<RttProber>,
    factory: Arc<UplinkFactory>,
}

fn rig(config: UplinkConfig) -> Rig {
    let alts = Arc::new(AltServerRegistry::new(false));
    let prober = RttProber::start(Arc::clone(&alts), ProbeConfig::default()).unwrap();
    let factory = UplinkFactory::new(Arc::clone(&alts), Arc::clone(&prober), config);
    Rig {
        alts,
        prober,
        factory,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn requests_are_served_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let real_size = 16 * BLOCK_SIZE;
    let content = Arc::new(pattern(real_size as usize));
    let upstream = spawn_upstream("img", 1, Arc::clone(&content), Duration::ZERO);

    let rig = rig(UplinkConfig {
        background_replication: false,
        ..UplinkConfig::default()
    });
    rig.alts.add(upstream.host, "test", false, false);

    let (image, path) = incomplete_image(dir.path(), "img", 1, real_size);
    let uplink = rig.factory.start(&image, None).unwrap();
    let sink = Arc::new(Recorder::default());

    uplink
        .request(sink.clone(), 7, 4096, 2 * BLOCK_SIZE as u32)
        .unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        !sink.delivered.lock().is_empty()
    }));

    let delivered = sink.delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, 7);
    assert_eq!(delivered[0].1, content[4096..4096 + 2 * BLOCK_SIZE as usize]);
    drop(delivered);

    // The payload is durable in the cache before the client saw it.
    assert!(image.is_range_cached(4096, 4096 + 2 * BLOCK_SIZE));
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(
        &on_disk[4096..4096 + 2 * BLOCK_SIZE as usize],
        &content[4096..4096 + 2 * BLOCK_SIZE as usize]
    );
    assert!(uplink.bytes_received() >= 2 * BLOCK_SIZE);

    uplink.signal_shutdown();
    rig.prober.shutdown();
}

#[test]
fn covered_request_coalesces_into_one_upstream_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let real_size = 32 * BLOCK_SIZE;
    let content = Arc::new(pattern(real_size as usize));
    // Delay replies so the second request queues while the first is
    // still in flight (or both before the first connect).
    let upstream = spawn_upstream("img", 1, Arc::clone(&content), Duration::from_millis(200));

    let rig = rig(UplinkConfig {
        background_replication: false,
        ..UplinkConfig::default()
    });
    rig.alts.add(upstream.host, "test", false, false);

    let (image, _path) = incomplete_image(dir.path(), "img", 1, real_size);
    let uplink = rig.factory.start(&image, None).unwrap();
    let big = Arc::new(Recorder::default());
    let small = Arc::new(Recorder::default());

    uplink.request(big.clone(), 1, 0, 16 * BLOCK_SIZE as u32).unwrap();
    uplink.request(small.clone(), 2, 4096, BLOCK_SIZE as u32).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        !big.delivered.lock().is_empty() && !small.delivered.lock().is_empty()
    }));

    let big_reply = &big.delivered.lock()[0];
    assert_eq!(big_reply.0, 1);
    assert_eq!(big_reply.1.len(), 16 * BLOCK_SIZE as usize);
    let small_reply = &small.delivered.lock()[0];
    assert_eq!(small_reply.0, 2);
    assert_eq!(small_reply.1, content[4096..4096 + BLOCK_SIZE as usize]);

    // One big fetch upstream; the probe's block-0 fetch is smaller.
    let sizes = upstream.block_requests.lock();
    let big_fetches = sizes.iter().filter(|&&s| s == 16 * BLOCK_SIZE as u32).count();
    assert_eq!(big_fetches, 1);

    uplink.signal_shutdown();
    rig.prober.shutdown();
}

#[test]
fn queued_requests_survive_until_first_connect() {
    let dir = tempfile::tempdir().unwrap();
    let real_size = 64 * BLOCK_SIZE;
    let content = Arc::new(pattern(real_size as usize));
    let upstream = spawn_upstream("img", 1, Arc::clone(&content), Duration::ZERO);

    let rig = rig(UplinkConfig {
        background_replication: false,
        ..UplinkConfig::default()
    });
    rig.alts.add(upstream.host, "test", false, false);

    let (image, _path) = incomplete_image(dir.path(), "img", 1, real_size);
    let uplink = rig.factory.start(&image, None).unwrap();
    let sink = Arc::new(Recorder::default());

    // Five disjoint requests, queued before any connection exists.
    // They all go out on the first established connection and come
    // back exactly once each, original handles intact.
    for i in 0..5_u64 {
        uplink
            .request(sink.clone(), 100 + i, i * 8 * BLOCK_SIZE, BLOCK_SIZE as u32)
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        sink.delivered.lock().len() == 5
    }));
    std::thread::sleep(Duration::from_millis(300));

    let delivered = sink.delivered.lock();
    assert_eq!(delivered.len(), 5, "every request answered exactly once");
    let mut handles: Vec<u64> = delivered.iter().map(|(h, _)| *h).collect();
    handles.sort_unstable();
    assert_eq!(handles, vec![100, 101, 102, 103, 104]);
    for (handle, data) in delivered.iter() {
        let offset = ((handle - 100) * 8 * BLOCK_SIZE) as usize;
        assert_eq!(data, &content[offset..offset + BLOCK_SIZE as usize]);
    }
    assert!(sink.failed.lock().is_empty());

    uplink.signal_shutdown();
    rig.prober.shutdown();
}

#[test]
fn background_replication_fills_idle_image() {
    let dir = tempfile::tempdir().unwrap();
    let real_size = 16 * BLOCK_SIZE;
    let content = Arc::new(pattern(real_size as usize));
    let upstream = spawn_upstream("img", 1, Arc::clone(&content), Duration::ZERO);

    let rig = rig(UplinkConfig {
        background_replication: true,
        bgr_min_clients: 0,
        ..UplinkConfig::default()
    });
    rig.alts.add(upstream.host, "test", false, false);

    let (image, path) = incomplete_image(dir.path(), "img", 1, real_size);
    let uplink = rig.factory.start(&image, None).unwrap();

    assert!(wait_until(Duration::from_secs(15), || {
        image.is_range_cached(0, real_size)
    }));
    assert_eq!(std::fs::read(&path).unwrap(), *content);

    uplink.signal_shutdown();
    rig.prober.shutdown();
}

#[test]
fn shutdown_fails_undeliverable_requests() {
    let dir = tempfile::tempdir().unwrap();
    // No upstream at all.
    let rig = rig(UplinkConfig {
        background_replication: false,
        ..UplinkConfig::default()
    });
    let (image, _path) = incomplete_image(dir.path(), "img", 1, 8 * BLOCK_SIZE);
    let uplink = rig.factory.start(&image, None).unwrap();
    let sink = Arc::new(Recorder::default());

    uplink.request(sink.clone(), 9, 0, BLOCK_SIZE as u32).unwrap();
    uplink.signal_shutdown();
    assert!(wait_until(Duration::from_secs(5), || {
        !sink.failed.lock().is_empty()
    }));
    assert_eq!(*sink.failed.lock(), vec![9]);
    assert!(sink.delivered.lock().is_empty());
    rig.prober.shutdown();
}

#[test]
fn starting_an_uplink_for_a_complete_image_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("done.r1");
    std::fs::write(&path, vec![1_u8; BLOCK_SIZE as usize]).unwrap();
    let image = Arc::new(Image::load_from_disk(dir.path(), &path, ImageId(1)).unwrap());
    let rig = rig(UplinkConfig::default());
    assert!(rig.factory.start(&image, None).is_err());
    rig.prober.shutdown();
}
