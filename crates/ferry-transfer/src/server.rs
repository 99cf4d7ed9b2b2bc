//! The server dispatcher.
//!
//! One thread owns the well-known listening socket and the session table.
//! Each accepted handshake gets its own ephemeral socket and worker thread;
//! from then on all traffic for that client flows between the client's
//! socket and the session's socket, and the listening port only ever sees
//! fresh (or duplicated) SYNs. Workers report completion over a channel so
//! the dispatcher never blocks on them and the table mutex is never held
//! across I/O.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::handshake::{self, SynRequest};
use crate::protocol::{Kind, Operation, Packet};
use crate::session::Session;
use crate::socket::Endpoint;
use crate::storage::{self, Storage};

/// How long the dispatcher blocks in receive before checking for finished
/// workers and the shutdown flag.
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// A session the dispatcher is tracking.
struct SessionEntry {
    /// Clone of the session's socket, used to answer duplicate SYNs from the
    /// address the client already knows.
    endpoint: Arc<Endpoint>,
    /// The SYN-ACK originally sent, re-sent verbatim on a duplicate SYN.
    syn_ack: Packet,
    worker: Option<JoinHandle<()>>,
}

/// The file stream a worker will drive.
enum ServerStream {
    /// Upload: we receive into a fresh file; the path is kept so a failed
    /// session can clean up after itself.
    Receive { file: File, path: PathBuf },
    /// Download: we send from an existing file.
    Send { file: File },
}

/// A running file server: listening socket, storage directory, session table.
pub struct FileServer {
    endpoint: Endpoint,
    storage: Storage,
    sessions: Mutex<HashMap<SocketAddr, SessionEntry>>,
    shutdown: Arc<AtomicBool>,
}

impl FileServer {
    /// Bind the well-known socket and open the storage directory.
    pub fn new(bind: SocketAddr, storage_dir: impl Into<PathBuf>) -> Result<FileServer> {
        let endpoint = Endpoint::bind(bind)?;
        let storage = Storage::open(storage_dir)?;
        Ok(FileServer {
            endpoint,
            storage,
            sessions: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Flag that requests a graceful stop: no new sessions are accepted, and
    /// `run` returns once the running ones finish.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Serve until shut down. Blocks the calling thread.
    pub fn run(&self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "listening");
        let (done_tx, done_rx) = unbounded();

        loop {
            self.reap_finished(&done_rx);
            if self.shutdown.load(Ordering::Relaxed) && self.sessions.lock().is_empty() {
                break;
            }
            match self.endpoint.recv(ACCEPT_TICK) {
                Ok((packet, peer)) => self.handle_datagram(packet, peer, &done_tx),
                Err(TransferError::Timeout) => {}
                Err(TransferError::Malformed(reason)) => {
                    debug!(reason, "malformed datagram on the listening socket")
                }
                Err(e) => return Err(e),
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn reap_finished(&self, done_rx: &Receiver<SocketAddr>) {
        while let Ok(peer) = done_rx.try_recv() {
            let entry = self.sessions.lock().remove(&peer);
            if let Some(mut entry) = entry {
                if let Some(worker) = entry.worker.take() {
                    let _ = worker.join();
                }
                debug!(%peer, active = self.sessions.lock().len(), "session reaped");
            }
        }
    }

    fn handle_datagram(&self, packet: Packet, peer: SocketAddr, done_tx: &Sender<SocketAddr>) {
        if packet.kind != Kind::Syn {
            // Data-phase traffic belongs on the session's own socket; seeing
            // it here means a stale peer or a reordered datagram.
            debug!(%peer, kind = ?packet.kind, "non-SYN on the listening socket dropped");
            return;
        }

        // A retried SYN gets the original answer, never a second session.
        // The table lock is released before touching the socket.
        let existing = {
            let sessions = self.sessions.lock();
            sessions
                .get(&peer)
                .map(|entry| (entry.endpoint.clone(), entry.syn_ack.clone()))
        };
        if let Some((endpoint, syn_ack)) = existing {
            debug!(%peer, "duplicate SYN, re-sending SYN-ACK");
            let _ = endpoint.send(&syn_ack, peer);
            return;
        }

        if self.shutdown.load(Ordering::Relaxed) {
            debug!(%peer, "shutting down, SYN ignored");
            return;
        }

        match self.accept(&packet, peer, done_tx) {
            Ok(()) => {}
            Err(
                err @ (TransferError::FileNotFound(_)
                | TransferError::FileExists(_)
                | TransferError::FileIo(_)),
            ) => {
                // The one failure class reported straight back to the peer,
                // from the listening socket.
                info!(%peer, error = %err, "handshake rejected");
                let _ = self.endpoint.send(&Packet::error(&err.to_string()), peer);
            }
            Err(err) => warn!(%peer, error = %err, "handshake failed"),
        }
    }

    /// Open the file, bind the session socket, record the session, and hand
    /// it to a worker thread.
    fn accept(&self, packet: &Packet, peer: SocketAddr, done_tx: &Sender<SocketAddr>) -> Result<()> {
        let request = handshake::parse_syn(packet)?;
        info!(
            %peer,
            operation = ?request.operation,
            protocol = ?request.protocol,
            name = %request.remote_name,
            "session requested"
        );

        // Reject before spending a socket on it.
        let (stream, file_size) = match request.operation {
            Operation::Upload => {
                let (file, path) = self.storage.create_upload(&request.remote_name)?;
                (ServerStream::Receive { file, path }, 0)
            }
            Operation::Download => {
                let (file, size) = self.storage.open_download(&request.remote_name)?;
                (ServerStream::Send { file }, size)
            }
        };

        let endpoint = Endpoint::bind_ephemeral(self.local_addr()?.ip())?;
        let syn_ack = handshake::accept_reply(request.operation, file_size);
        let table_endpoint = Arc::new(endpoint.try_clone()?);
        let session = Session::new(endpoint, peer, request.protocol);

        let worker_syn_ack = syn_ack.clone();
        let worker_done = done_tx.clone();
        let worker = thread::Builder::new()
            .name(format!("ferry-session-{peer}"))
            .spawn(move || {
                run_worker(session, request, stream, worker_syn_ack);
                let _ = worker_done.send(peer);
            })
            .map_err(TransferError::FileIo)?;

        self.sessions.lock().insert(
            peer,
            SessionEntry {
                endpoint: table_endpoint,
                syn_ack,
                worker: Some(worker),
            },
        );
        Ok(())
    }
}

/// Body of a session worker: answer the handshake from the session socket,
/// then drive the transfer to a terminal state.
fn run_worker(session: Session, request: SynRequest, stream: ServerStream, syn_ack: Packet) {
    let peer = session.peer();
    let outcome = match stream {
        ServerStream::Receive { file, path } => {
            let result = session.endpoint().send(&syn_ack, peer).and_then(|()| {
                // The client's first DATA doubles as handshake confirmation.
                let mut sink = BufWriter::new(file);
                session.receive_stream(&mut sink)
            });
            if result.is_err() {
                storage::discard_partial(&path);
            }
            result
        }
        ServerStream::Send { file } => session
            .endpoint()
            .send(&syn_ack, peer)
            .and_then(|()| handshake::await_client_ack(session.endpoint(), peer, &syn_ack))
            .and_then(|()| session.send_stream(BufReader::new(file))),
    };

    match outcome {
        Ok(report) => info!(
            %peer,
            name = %request.remote_name,
            bytes = report.bytes,
            "session complete"
        ),
        Err(err) => warn!(%peer, name = %request.remote_name, error = %err, "session aborted"),
    }
}
