//! WebSocket preview feed.
//!
//! Pushes NAL units as binary frames in encoder order. The WebSocket
//! server itself is an external collaborator; clients appear here as send
//! callbacks. A new client is gated until the first keyframe, at which
//! point the cached parameter sets (SPS+PPS) are prepended so the
//! browser-side demuxer can start immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::hw::Codec;
use crate::nal;
use crate::pipeline::dispatcher::{ConsumerRegistration, EncodedPacket};

type SendFn = Box<dyn Fn(&Bytes) + Send>;

struct Client {
    id: u64,
    primed: bool,
    send: SendFn,
}

pub struct WsPreview {
    codec: Codec,
    config_cache: Mutex<Option<Bytes>>,
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
}

impl WsPreview {
    pub fn new(codec: Codec) -> Arc<Self> {
        Arc::new(Self {
            codec,
            config_cache: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a connected client; returns its id for removal.
    pub fn add_client<F>(&self, send: F) -> u64
    where
        F: Fn(&Bytes) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.clients.lock().push(Client {
            id,
            primed: false,
            send: Box::new(send),
        });
        debug!(client = id, "preview client attached");
        id
    }

    pub fn remove_client(&self, id: u64) {
        self.clients.lock().retain(|c| c.id != id);
        debug!(client = id, "preview client detached");
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn on_packet(&self, pkt: &EncodedPacket) {
        if let Some(ps) = nal::parameter_sets(&pkt.data, self.codec) {
            *self.config_cache.lock() = Some(ps);
        }
        let config = self.config_cache.lock().clone();
        let mut clients = self.clients.lock();
        for client in clients.iter_mut() {
            if !client.primed {
                if !pkt.is_keyframe {
                    continue;
                }
                client.primed = true;
                // Keyframes straight from the encoder already lead with
                // their parameter sets; only stitch them in when missing.
                if nal::parameter_sets(&pkt.data, self.codec).is_none() {
                    if let Some(ps) = &config {
                        (client.send)(ps);
                    }
                }
            }
            (client.send)(&pkt.data);
        }
    }

    /// The dispatcher consumer feeding all preview clients.
    pub fn consumer(self: &Arc<Self>, name: &str, capacity: usize) -> ConsumerRegistration {
        let preview = Arc::clone(self);
        ConsumerRegistration::queued(
            name,
            capacity,
            Arc::new(move |pkt: &EncodedPacket| {
                preview.on_packet(pkt);
                Ok(())
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(nals: &[&[u8]]) -> Bytes {
        let mut v = Vec::new();
        for n in nals {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(n);
        }
        Bytes::from(v)
    }

    fn pkt(data: Bytes, seq: u64, key: bool) -> EncodedPacket {
        EncodedPacket {
            data,
            pts_us: seq * 40_000,
            seq,
            is_keyframe: key,
        }
    }

    fn collecting_client(preview: &Arc<WsPreview>) -> (u64, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = preview.add_client(move |b| sink.lock().push(b.clone()));
        (id, seen)
    }

    #[test]
    fn client_gated_until_keyframe() {
        let preview = WsPreview::new(Codec::H264);
        let (_, seen) = collecting_client(&preview);
        preview.on_packet(&pkt(annexb(&[&[0x41, 1]]), 0, false));
        assert!(seen.lock().is_empty());
        let key = annexb(&[&[0x67, 1], &[0x68, 2], &[0x65, 3]]);
        preview.on_packet(&pkt(key.clone(), 1, true));
        preview.on_packet(&pkt(annexb(&[&[0x41, 4]]), 2, false));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], key);
    }

    #[test]
    fn late_client_gets_cached_parameter_sets_when_keyframe_lacks_them() {
        let preview = WsPreview::new(Codec::H264);
        // A config-bearing keyframe passes by before the client connects.
        preview.on_packet(&pkt(annexb(&[&[0x67, 9], &[0x68, 8], &[0x65, 7]]), 0, true));
        let (_, seen) = collecting_client(&preview);
        // The next keyframe carries only the IDR slice.
        let bare_key = annexb(&[&[0x65, 5]]);
        preview.on_packet(&pkt(bare_key.clone(), 1, true));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2, "config prefix then the keyframe");
        let ps_units: Vec<_> = crate::nal::nal_units(&seen[0]).collect();
        assert_eq!(crate::nal::h264_nal_type(ps_units[0][0]), 7);
        assert_eq!(seen[1], bare_key);
    }

    #[test]
    fn detached_client_receives_nothing_more() {
        let preview = WsPreview::new(Codec::H264);
        let (id, seen) = collecting_client(&preview);
        preview.on_packet(&pkt(annexb(&[&[0x67, 1], &[0x68, 2], &[0x65, 3]]), 0, true));
        preview.remove_client(id);
        preview.on_packet(&pkt(annexb(&[&[0x41, 4]]), 1, false));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(preview.client_count(), 0);
    }
}
