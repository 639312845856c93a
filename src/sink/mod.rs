//! Consumer-side adapters.
//!
//! The RTSP server, WebRTC stack and WebSocket server are external
//! collaborators; this module holds the one callback each of them needs
//! from the core, plus the recorder.

pub mod preview;
pub mod recorder;

use std::sync::Arc;

use crate::nal;
use crate::pipeline::dispatcher::{ConsumerCallback, ConsumerRegistration, EncodedPacket};

/// Builds the RTSP consumer: raw frames with 90 kHz RTP timestamps derived
/// from the microsecond PTS. `push` is the server library's frame entry
/// point.
pub fn rtsp_consumer<F>(name: &str, capacity: usize, push: F) -> ConsumerRegistration
where
    F: Fn(&[u8], u64) -> Result<(), crate::pipeline::dispatcher::ConsumerError>
        + Send
        + Sync
        + 'static,
{
    let callback: ConsumerCallback =
        Arc::new(move |pkt: &EncodedPacket| push(&pkt.data, nal::rtp90k(pkt.pts_us)));
    ConsumerRegistration::queued(name, capacity, callback)
}

/// Builds the WebRTC consumer: NAL units handed to the media track as-is;
/// the library does its own RTP packetization.
pub fn webrtc_consumer<F>(name: &str, capacity: usize, push: F) -> ConsumerRegistration
where
    F: Fn(&EncodedPacket) -> Result<(), crate::pipeline::dispatcher::ConsumerError>
        + Send
        + Sync
        + 'static,
{
    ConsumerRegistration::queued(name, capacity, Arc::new(push))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[test]
    fn rtsp_consumer_converts_pts_to_rtp_clock() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reg = rtsp_consumer("rtsp", 5, move |data, ts| {
            sink.lock().push((data.to_vec(), ts));
            Ok(())
        });
        let pkt = EncodedPacket {
            data: Bytes::from_static(&[1, 2, 3]),
            pts_us: 1_000_000,
            seq: 0,
            is_keyframe: true,
        };
        (reg.callback.as_ref())(&pkt).unwrap();
        let seen = seen.lock();
        assert_eq!(seen[0].1, 90_000);
        assert_eq!(seen[0].0, vec![1, 2, 3]);
    }
}
