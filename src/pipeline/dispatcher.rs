//! Encoded-stream fan-out.
//!
//! One fetch worker pulls packets from the encoder, copies them off the
//! hardware buffer, releases the buffer, and pushes one owned copy into
//! every consumer's bounded queue. Queues are drop-oldest rings with a
//! per-consumer drop counter (a lagging receiver skips ahead and counts
//! what it missed), so a slow consumer only ever throttles itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hw::session::VencSession;
use crate::hw::Codec;
use crate::nal;

const FETCH_TIMEOUT: Duration = Duration::from_millis(100);
const BACKOFF_MIN: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// One encoded frame, decoupled from hardware memory. Every consumer gets
/// its own value with its own buffer.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts_us: u64,
    pub seq: u64,
    pub is_keyframe: bool,
}

pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;
pub type ConsumerCallback = Arc<dyn Fn(&EncodedPacket) -> Result<(), ConsumerError> + Send + Sync>;

/// How packets reach the consumer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A dedicated worker drains the queue and invokes the callback inline.
    Queued,
    /// The worker hands each packet to the executor instead of calling
    /// inline; ordering across packets is not guaranteed.
    Spawned,
}

/// Persistent consumer description; the manager replays these across
/// pipeline swaps so peers survive reconfiguration.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub name: String,
    pub mode: DeliveryMode,
    /// Queue capacity, at least 1.
    pub capacity: usize,
    pub callback: ConsumerCallback,
}

impl ConsumerRegistration {
    pub fn queued(name: &str, capacity: usize, callback: ConsumerCallback) -> Self {
        Self {
            name: name.to_string(),
            mode: DeliveryMode::Queued,
            capacity: capacity.max(1),
            callback,
        }
    }
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub queue_depth: usize,
}

struct SlotShared {
    name: String,
    tx: broadcast::Sender<EncodedPacket>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

pub struct StreamDispatcher {
    venc: Arc<VencSession>,
    codec: Codec,
    running: Arc<AtomicBool>,
    senders: Arc<RwLock<Vec<SlotShared>>>,
    workers: Vec<(String, JoinHandle<()>)>,
    pending: Vec<ConsumerRegistration>,
    fetch: Option<JoinHandle<()>>,
    fetched: Arc<AtomicU64>,
    started: bool,
}

impl StreamDispatcher {
    pub fn new(venc: Arc<VencSession>) -> Self {
        let codec = venc.config().codec;
        Self {
            venc,
            codec,
            running: Arc::new(AtomicBool::new(false)),
            senders: Arc::new(RwLock::new(Vec::new())),
            workers: Vec::new(),
            pending: Vec::new(),
            fetch: None,
            fetched: Arc::new(AtomicU64::new(0)),
            started: false,
        }
    }

    /// Registers a consumer. Before `start` the registration is parked;
    /// while running the consumer goes live immediately.
    pub fn add_consumer(&mut self, reg: ConsumerRegistration) {
        info!(consumer = %reg.name, capacity = reg.capacity, "stream consumer registered");
        if self.started {
            self.spawn_worker(reg);
        } else {
            self.pending.push(reg);
        }
    }

    /// Detaches a consumer: its queue closes, its worker drains what is
    /// left and exits.
    pub async fn remove_consumer(&mut self, name: &str) {
        self.senders.write().retain(|s| s.name != name);
        let mut kept = Vec::new();
        for (n, handle) in self.workers.drain(..) {
            if n == name {
                let _ = handle.await;
            } else {
                kept.push((n, handle));
            }
        }
        self.workers = kept;
        self.pending.retain(|r| r.name != name);
        info!(consumer = %name, "stream consumer removed");
    }

    /// Starts the consumer workers, then the fetch worker.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.running.store(true, Ordering::Release);
        for reg in std::mem::take(&mut self.pending) {
            self.spawn_worker(reg);
        }
        let venc = Arc::clone(&self.venc);
        let codec = self.codec;
        let running = Arc::clone(&self.running);
        let senders = Arc::clone(&self.senders);
        let fetched = Arc::clone(&self.fetched);
        self.fetch = Some(tokio::task::spawn_blocking(move || {
            fetch_loop(venc, codec, running, senders, fetched);
        }));
        info!(consumers = self.senders.read().len(), "stream dispatcher started");
    }

    /// Closes every queue and joins the fetch worker, then all consumer
    /// workers.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.running.store(false, Ordering::Release);
        if let Some(fetch) = self.fetch.take() {
            let _ = fetch.await;
        }
        self.senders.write().clear();
        for (_, worker) in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.started = false;
        info!(packets = self.fetched.load(Ordering::Acquire), "stream dispatcher stopped");
    }

    pub fn packets_fetched(&self) -> u64 {
        self.fetched.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Vec<ConsumerStats> {
        self.senders
            .read()
            .iter()
            .map(|s| ConsumerStats {
                name: s.name.clone(),
                delivered: s.delivered.load(Ordering::Acquire),
                dropped: s.dropped.load(Ordering::Acquire),
                queue_depth: s.tx.len(),
            })
            .collect()
    }

    fn spawn_worker(&mut self, reg: ConsumerRegistration) {
        let (tx, rx) = broadcast::channel(reg.capacity.max(1));
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(consumer_worker(
            reg.name.clone(),
            reg.mode,
            Arc::clone(&reg.callback),
            rx,
            Arc::clone(&delivered),
            Arc::clone(&dropped),
        ));
        self.senders.write().push(SlotShared {
            name: reg.name.clone(),
            tx,
            delivered,
            dropped,
        });
        self.workers.push((reg.name, handle));
    }
}

fn fetch_loop(
    venc: Arc<VencSession>,
    codec: Codec,
    running: Arc<AtomicBool>,
    senders: Arc<RwLock<Vec<SlotShared>>>,
    fetched: Arc<AtomicU64>,
) {
    debug!("fetch loop started");
    let mut backoff = BACKOFF_MIN;
    let mut last_pts = 0u64;
    let mut staging: Vec<u8> = Vec::new();
    while running.load(Ordering::Acquire) {
        match venc.fetch_packet(FETCH_TIMEOUT) {
            Ok(pkt) => {
                backoff = BACKOFF_MIN;
                let payload = pkt.payload();
                let is_keyframe = nal::is_keyframe(payload, codec);
                // Emitted timestamps are non-decreasing even if the
                // encoder clock hiccups.
                let pts_us = pkt.pts_us.max(last_pts);
                last_pts = pts_us;
                let seq = pkt.seq;
                staging.clear();
                staging.extend_from_slice(payload);
                // The hardware slot goes back before any consumer sees the
                // data.
                venc.release_packet(pkt);
                fetched.fetch_add(1, Ordering::AcqRel);
                for slot in senders.read().iter() {
                    let _ = slot.tx.send(EncodedPacket {
                        data: Bytes::copy_from_slice(&staging),
                        pts_us,
                        seq,
                        is_keyframe,
                    });
                }
            }
            Err(e) if e.is_transient() => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!(error = %e, "encoder fetch failed");
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
    debug!("fetch loop exited");
}

async fn consumer_worker(
    name: String,
    mode: DeliveryMode,
    callback: ConsumerCallback,
    mut rx: broadcast::Receiver<EncodedPacket>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) {
    debug!(consumer = %name, "consumer worker started");
    loop {
        match rx.recv().await {
            Ok(pkt) => match mode {
                DeliveryMode::Queued => {
                    deliver(&name, &callback, &pkt, &delivered);
                }
                DeliveryMode::Spawned => {
                    let name = name.clone();
                    let callback = Arc::clone(&callback);
                    let delivered = Arc::clone(&delivered);
                    tokio::spawn(async move {
                        deliver(&name, &callback, &pkt, &delivered);
                    });
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                dropped.fetch_add(n, Ordering::AcqRel);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(consumer = %name, delivered = delivered.load(Ordering::Acquire), "consumer worker exited");
}

fn deliver(
    name: &str,
    callback: &ConsumerCallback,
    pkt: &EncodedPacket,
    delivered: &AtomicU64,
) {
    match (callback.as_ref())(pkt) {
        Ok(()) => {
            delivered.fetch_add(1, Ordering::AcqRel);
        }
        Err(e) => {
            // Consumer failures stay inside this worker.
            warn!(consumer = %name, error = %e, "consumer callback failed");
        }
    }
}
