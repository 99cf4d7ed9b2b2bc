//! Transfers through a lossy datagram relay.
//!
//! The relay sits between client and server, forwarding datagrams in both
//! directions and dropping a seeded fraction of them. Every completed
//! transfer must still deliver the exact bytes, whatever the loss pattern;
//! only the retransmission count is allowed to grow.

use std::fs;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferry_transfer::client;
use ferry_transfer::protocol::{Kind, Packet, Protocol};
use ferry_transfer::FileServer;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct TestServer {
    addr: SocketAddr,
    storage: PathBuf,
    root: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(tag: &str) -> TestServer {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("ferry_transfer=info")
            .try_init();
        let root = std::env::temp_dir().join(format!("ferry_lossy_{tag}"));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();

        let storage = root.join("storage");
        let server = FileServer::new("127.0.0.1:0".parse().unwrap(), &storage).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_flag();
        let handle = thread::spawn(move || server.run().unwrap());

        TestServer {
            addr,
            storage,
            root,
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// A one-client NAT-style relay with seeded random loss.
///
/// The client talks to the relay as if it were the server. SYNs are routed
/// to the server's listening port; everything else follows the session
/// socket, learned from the source of the server's replies.
struct LossyRelay {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl LossyRelay {
    fn start(listening: SocketAddr, loss: f64, seed: u64) -> LossyRelay {
        let client_side = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_side = UdpSocket::bind("127.0.0.1:0").unwrap();
        for socket in [&client_side, &server_side] {
            socket
                .set_read_timeout(Some(Duration::from_millis(50)))
                .unwrap();
        }
        let addr = client_side.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let session_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        // Client to server.
        let c2s = {
            let client_side = client_side.try_clone().unwrap();
            let server_side = server_side.try_clone().unwrap();
            let shutdown = shutdown.clone();
            let client_addr = client_addr.clone();
            let session_addr = session_addr.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut buf = [0u8; 2048];
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok((len, src)) = client_side.recv_from(&mut buf) else {
                        continue;
                    };
                    *client_addr.lock().unwrap() = Some(src);
                    if rng.gen::<f64>() < loss {
                        continue;
                    }
                    let is_syn = Packet::decode(&buf[..len])
                        .map(|p| p.kind == Kind::Syn)
                        .unwrap_or(false);
                    let target = if is_syn {
                        listening
                    } else {
                        (*session_addr.lock().unwrap()).unwrap_or(listening)
                    };
                    let _ = server_side.send_to(&buf[..len], target);
                }
            })
        };

        // Server to client.
        let s2c = {
            let shutdown = shutdown.clone();
            let client_addr = client_addr.clone();
            let session_addr = session_addr.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
                let mut buf = [0u8; 2048];
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok((len, src)) = server_side.recv_from(&mut buf) else {
                        continue;
                    };
                    if src != listening {
                        *session_addr.lock().unwrap() = Some(src);
                    }
                    if rng.gen::<f64>() < loss {
                        continue;
                    }
                    let target = *client_addr.lock().unwrap();
                    if let Some(target) = target {
                        let _ = client_side.send_to(&buf[..len], target);
                    }
                }
            })
        };

        LossyRelay {
            addr,
            shutdown,
            handles: vec![c2s, s2c],
        }
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[test]
fn upload_survives_loss_stop_and_wait() {
    let server = TestServer::start("sw_upload");
    let relay = LossyRelay::start(server.addr, 0.2, 7);

    let data = patterned(4 * 1024);
    let src = server.root.join("lossy_sw.bin");
    fs::write(&src, &data).unwrap();

    let report = client::upload(relay.addr, &src, None, Protocol::StopAndWait).unwrap();
    assert_eq!(report.bytes, data.len() as u64);

    for _ in 0..50 {
        if fs::read(server.storage.join("lossy_sw.bin"))
            .map(|d| d == data)
            .unwrap_or(false)
        {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("upload did not land intact");
}

#[test]
fn upload_survives_loss_go_back_n() {
    let server = TestServer::start("gbn_upload");
    let relay = LossyRelay::start(server.addr, 0.25, 21);

    let data = patterned(16 * 1024);
    let src = server.root.join("lossy_gbn.bin");
    fs::write(&src, &data).unwrap();

    let report = client::upload(relay.addr, &src, None, Protocol::GoBackN).unwrap();
    assert_eq!(report.bytes, data.len() as u64);

    for _ in 0..50 {
        if fs::read(server.storage.join("lossy_gbn.bin"))
            .map(|d| d == data)
            .unwrap_or(false)
        {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("upload did not land intact");
}

#[test]
fn download_survives_loss_go_back_n() {
    let server = TestServer::start("gbn_download");
    let relay = LossyRelay::start(server.addr, 0.2, 42);

    let data = patterned(12 * 1024);
    fs::create_dir_all(&server.storage).unwrap();
    fs::write(server.storage.join("served.bin"), &data).unwrap();

    let dest_dir = server.root.join("downloads");
    let report = client::download(relay.addr, "served.bin", &dest_dir, Protocol::GoBackN).unwrap();
    assert_eq!(report.bytes, data.len() as u64);
    assert_eq!(fs::read(dest_dir.join("served.bin")).unwrap(), data);
}
