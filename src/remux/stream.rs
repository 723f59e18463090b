//! Per-service sessions and the readable streams handed to clients.
//!
//! One session exists per service attached to a remux, no matter how many
//! clients share it. The session owns the bounded packet queue and a
//! consumer thread that fans completed packets out to every subscriber's
//! byte queue.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::model::service::Service;
use crate::psi::pat::synthesize_pat_packet;
use crate::remux::queue::{ByteQueue, PacketQueue, QueueItem};
use crate::remux::RemuxConfig;

struct Subscriber {
    id: u64,
    queue: Arc<ByteQueue>,
}

struct PatState {
    continuity_counter: u8,
    /// Service packets until the next synthesized PAT.
    countdown: u32,
}

/// The shared state of one attached service.
pub struct ServiceSession {
    sid: u16,
    pmt_pid: u16,
    name: String,
    pids: HashSet<u16>,
    packets: Arc<PacketQueue>,
    pat_interval: u32,
    pat: Mutex<PatState>,
    subscribers: Mutex<Vec<Subscriber>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceSession {
    pub(crate) fn new(service: &Service, config: &RemuxConfig) -> Arc<ServiceSession> {
        let session = Arc::new(ServiceSession {
            sid: service.sid,
            pmt_pid: service.pmt_pid,
            name: service.name.clone(),
            pids: service.pids().iter().copied().collect(),
            packets: Arc::new(PacketQueue::new(
                config.queue_capacity,
                config.enqueue_timeout,
            )),
            pat_interval: config.pat_interval,
            pat: Mutex::new(PatState {
                continuity_counter: 0,
                countdown: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            consumer: Mutex::new(None),
        });
        session.start_consumer();
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// PIDs this session extracts from the multiplex.
    pub fn pids(&self) -> &HashSet<u16> {
        &self.pids
    }

    pub fn wants(&self, pid: u16) -> bool {
        self.pids.contains(&pid)
    }

    /// Packets discarded on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.packets.dropped()
    }

    /// Registers a new subscriber and injects a fresh PAT so its stream
    /// begins with one.
    pub(crate) fn add_subscriber(&self, id: u64) -> Arc<ByteQueue> {
        let queue = Arc::new(ByteQueue::new());
        self.subscribers.lock().push(Subscriber {
            id,
            queue: Arc::clone(&queue),
        });
        debug!("service {}: subscriber {id} attached", self.name);
        self.inject_pat();
        queue
    }

    /// Closes and removes one subscriber. Returns `(was removed, remaining
    /// subscriber count)`; removing an unknown id is a no-op.
    pub(crate) fn remove_subscriber(&self, id: u64) -> (bool, usize) {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| {
            if s.id == id {
                s.queue.close();
                false
            } else {
                true
            }
        });
        let removed = subscribers.len() < before;
        if removed {
            debug!("service {}: subscriber {id} detached", self.name);
        }
        (removed, subscribers.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Called by the remux reader for every packet whose PID this session
    /// owns. Interleaves the synthesized PAT at the configured cadence.
    pub(crate) fn handle_packet(&self, packet: Bytes) {
        {
            let mut pat = self.pat.lock();
            if pat.countdown == 0 {
                let synthesized =
                    synthesize_pat_packet(self.sid, self.pmt_pid, pat.continuity_counter);
                pat.continuity_counter = (pat.continuity_counter + 1) & 0x0F;
                pat.countdown = self.pat_interval;
                self.packets.enqueue(synthesized);
            }
            pat.countdown = pat.countdown.saturating_sub(1);
        }
        self.packets.enqueue(packet);
    }

    /// Queues a synthesized PAT immediately and restarts the cadence.
    fn inject_pat(&self) {
        let mut pat = self.pat.lock();
        let synthesized = synthesize_pat_packet(self.sid, self.pmt_pid, pat.continuity_counter);
        pat.continuity_counter = (pat.continuity_counter + 1) & 0x0F;
        pat.countdown = self.pat_interval;
        self.packets.enqueue(synthesized);
    }

    fn start_consumer(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let result = std::thread::Builder::new()
            .name(format!("svc-{}", self.name))
            .spawn(move || session.consume());
        match result {
            Ok(handle) => *self.consumer.lock() = Some(handle),
            Err(e) => warn!("service {}: could not start consumer: {e}", self.name),
        }
    }

    /// Consumer loop: packet queue to every subscriber's byte queue.
    fn consume(&self) {
        loop {
            match self.packets.dequeue() {
                QueueItem::Packet(packet) => {
                    let subscribers = self.subscribers.lock();
                    for s in subscribers.iter() {
                        s.queue.write(&packet);
                    }
                }
                QueueItem::EndOfStream => {
                    trace!("service {}: end of stream", self.name);
                    let subscribers = self.subscribers.lock();
                    for s in subscribers.iter() {
                        s.queue.close();
                    }
                    return;
                }
            }
        }
    }

    /// Delivers end-of-stream and joins the consumer thread.
    pub(crate) fn shutdown(&self) {
        self.packets.push_eos();
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
        let dropped = self.packets.dropped();
        if dropped > 0 {
            warn!(
                "service {}: {dropped} packets were dropped during the session",
                self.name
            );
        }
    }
}

/// A client's handle on a served single-program transport stream.
///
/// Reads block until bytes are available and return 0 at end of stream.
pub struct ServiceStream {
    stream_id: u64,
    sid: u16,
    service_name: String,
    queue: Arc<ByteQueue>,
}

impl ServiceStream {
    pub(crate) fn new(
        stream_id: u64,
        sid: u16,
        service_name: String,
        queue: Arc<ByteQueue>,
    ) -> Self {
        ServiceStream {
            stream_id,
            sid,
            service_name,
            queue,
        }
    }

    pub fn id(&self) -> u64 {
        self.stream_id
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The raw byte queue, for consumers that want `read_some` semantics
    /// instead of `io::Read`.
    pub fn byte_queue(&self) -> Arc<ByteQueue> {
        Arc::clone(&self.queue)
    }
}

impl io::Read for ServiceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.queue.read(buf))
    }
}
