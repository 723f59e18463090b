//! The transport-stream remultiplexer.
//!
//! One remux exists per open DVR. A single reader thread pulls 188-byte
//! packets off the DVR, classifies each by PID, and feeds every attached
//! service session whose PID set contains it. Native PAT packets are
//! dropped; each session interleaves its own synthesized single-program
//! PAT so a downstream decoder sees a transport stream carrying exactly
//! that service.

pub mod queue;
pub mod stream;

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::model::service::Service;
use crate::psi::packet::{find_sync, pid_of};
use crate::psi::{pid, SYNC_BYTE, TS_PACKET_SIZE};
use crate::remux::stream::{ServiceSession, ServiceStream};

/// Remultiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct RemuxConfig {
    /// Per-service packet queue capacity.
    pub queue_capacity: usize,
    /// How long the reader may wait on a full queue before dropping.
    pub enqueue_timeout: Duration,
    /// Service packets between synthesized PATs. 40 packets keeps the PAT
    /// repeating faster than every 10 ms at typical DVB mux rates.
    pub pat_interval: u32,
    /// Backoff after a zero-byte DVR read.
    pub empty_read_backoff: Duration,
    /// Consecutive zero-byte reads treated as end of stream.
    pub empty_read_limit: u32,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        RemuxConfig {
            queue_capacity: 128,
            enqueue_timeout: Duration::from_millis(50),
            pat_interval: 40,
            empty_read_backoff: Duration::from_millis(10),
            empty_read_limit: 50,
        }
    }
}

struct SessionEntry {
    session: Arc<ServiceSession>,
    refs: u32,
}

struct RemuxShared {
    config: RemuxConfig,
    running: AtomicBool,
    sessions: Mutex<HashMap<u16, SessionEntry>>,
    next_stream_id: AtomicU64,
}

impl RemuxShared {
    /// Delivers end-of-stream to every session and tears them down.
    fn flush_sessions(&self) {
        let drained: Vec<Arc<ServiceSession>> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, e)| e.session).collect()
        };
        for session in drained {
            session.shutdown();
        }
    }
}

/// The remultiplexer for one DVR.
pub struct Remux {
    shared: Arc<RemuxShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Remux {
    pub fn new(config: RemuxConfig) -> Self {
        Remux {
            shared: Arc::new(RemuxShared {
                config,
                running: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU64::new(1),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Starts the reader thread on an open DVR handle.
    pub fn start(&self, dvr: Box<dyn Read + Send>) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let result = std::thread::Builder::new()
            .name("remux-reader".into())
            .spawn(move || run_reader(shared, dvr));
        match result {
            Ok(handle) => *self.reader.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                warn!("could not start remux reader: {e}");
            }
        }
    }

    /// Attaches a service, creating its session on first use. A second
    /// client asking for the same sid shares the session and gets its own
    /// subscriber queue.
    pub fn attach(&self, service: &Service) -> ServiceStream {
        let mut sessions = self.shared.sessions.lock();
        let entry = sessions.entry(service.sid).or_insert_with(|| {
            debug!("remux: new session for {} (sid {})", service.name, service.sid);
            SessionEntry {
                session: ServiceSession::new(service, &self.shared.config),
                refs: 0,
            }
        });
        entry.refs += 1;
        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let queue = entry.session.add_subscriber(id);
        ServiceStream::new(id, service.sid, service.name.clone(), queue)
    }

    /// Detaches one subscriber. When the last subscriber of a session is
    /// gone the session is shut down and its PIDs are returned so the
    /// caller can drop them from the demux whitelist. Idempotent.
    pub fn detach(&self, stream: &ServiceStream) -> Option<Vec<u16>> {
        self.detach_ids(stream.sid(), stream.id())
    }

    /// [`detach`](Self::detach) by raw ids, for callers that no longer own
    /// the stream handle.
    pub fn detach_ids(&self, sid: u16, subscriber_id: u64) -> Option<Vec<u16>> {
        let mut sessions = self.shared.sessions.lock();
        let entry = sessions.get_mut(&sid)?;
        let (removed, _remaining) = entry.session.remove_subscriber(subscriber_id);
        if !removed {
            return None;
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        let entry = sessions.remove(&sid)?;
        drop(sessions);
        let released: Vec<u16> = entry.session.pids().iter().copied().collect();
        entry.session.shutdown();
        debug!("remux: session for sid {sid} closed");
        Some(released)
    }

    /// Signals the reader to exit after the packet in flight.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Joins the reader thread.
    pub fn wait(&self) {
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }

    /// Drains every session, unblocking all consumer reads with
    /// end-of-stream.
    pub fn flush(&self) {
        self.shared.flush_sessions();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.session_count() == 0
    }
}

/// Reader loop: DVR bytes to per-session packet queues.
fn run_reader(shared: Arc<RemuxShared>, mut dvr: Box<dyn Read + Send>) {
    info!("remux reader started");
    let mut framer = PacketFramer::new();
    let mut packets_read: u64 = 0;

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            debug!("remux reader: stop requested");
            break;
        }
        let packet = match framer.next_packet(dvr.as_mut(), &shared) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!("remux reader: end of stream after {packets_read} packets");
                break;
            }
            Err(e) => {
                warn!("remux reader: read failed: {e}");
                break;
            }
        };
        packets_read += 1;

        let packet_pid = pid_of(&packet);
        // The native PAT describes the whole multiplex; every session
        // injects its own single-program replacement instead.
        if packet_pid == pid::PAT || packet_pid == pid::NULL {
            continue;
        }

        let targets: Vec<Arc<ServiceSession>> = {
            let sessions = shared.sessions.lock();
            sessions
                .values()
                .filter(|e| e.session.wants(packet_pid))
                .map(|e| Arc::clone(&e.session))
                .collect()
        };
        if targets.is_empty() {
            continue;
        }
        let packet = Bytes::copy_from_slice(&packet);
        for session in targets {
            session.handle_packet(packet.clone());
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.flush_sessions();
    info!("remux reader stopped");
}

/// Accumulates DVR bytes and yields aligned 188-byte packets, scanning
/// forward to a position where the sync byte recurs a packet later when
/// alignment is lost.
struct PacketFramer {
    carry: Vec<u8>,
    synced: bool,
}

impl PacketFramer {
    fn new() -> Self {
        PacketFramer {
            carry: Vec::with_capacity(4 * TS_PACKET_SIZE),
            synced: false,
        }
    }

    fn next_packet(
        &mut self,
        dvr: &mut dyn Read,
        shared: &RemuxShared,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let mut consecutive_empty: u32 = 0;
        let mut buf = [0u8; TS_PACKET_SIZE];
        loop {
            if let Some(packet) = self.try_extract() {
                return Ok(Some(packet));
            }
            if !shared.running.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match dvr.read(&mut buf) {
                Ok(0) => {
                    consecutive_empty += 1;
                    if consecutive_empty >= shared.config.empty_read_limit {
                        return Ok(None);
                    }
                    std::thread::sleep(shared.config.empty_read_backoff);
                }
                Ok(n) => {
                    consecutive_empty = 0;
                    self.carry.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    consecutive_empty += 1;
                    if consecutive_empty >= shared.config.empty_read_limit {
                        return Ok(None);
                    }
                    std::thread::sleep(shared.config.empty_read_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_extract(&mut self) -> Option<Vec<u8>> {
        if self.carry.len() < TS_PACKET_SIZE {
            return None;
        }
        if self.synced && self.carry[0] != SYNC_BYTE {
            self.synced = false;
        }
        if !self.synced {
            match find_sync(&self.carry) {
                Some(0) => {}
                Some(offset) => {
                    trace!("remux reader: resynchronized, {offset} bytes skipped");
                    self.carry.drain(..offset);
                }
                None => {
                    // Keep a window's tail; everything before it is noise.
                    let keep = self.carry.len().min(TS_PACKET_SIZE);
                    let start = self.carry.len() - keep;
                    self.carry.drain(..start);
                    return None;
                }
            }
            if self.carry.len() < TS_PACKET_SIZE {
                return None;
            }
            self.synced = true;
        }
        let packet: Vec<u8> = self.carry.drain(..TS_PACKET_SIZE).collect();
        Some(packet)
    }
}
