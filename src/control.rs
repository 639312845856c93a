//! UDP command listener.
//!
//! Each datagram is a JSON object `{"type": ..., "payload": ...}`.
//! Malformed JSON falls back to the legacy opaque form and is matched by
//! substring against the uppercase model names; anything else answers with
//! an error datagram. WebRTC signaling blobs are forwarded to the external
//! signaling collaborator.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::detect::DetectorKind;
use crate::error::{MediaError, MediaResult};
use crate::pipeline::manager::{PipelineManager, PipelineMode};

const BUFFER_SIZE: usize = 64 * 1024;

/// The WebRTC signaling collaborator's surface.
pub trait SignalingHandler: Send + Sync {
    /// Returns the answer SDP when the peer stack produces one.
    fn on_offer(&self, sdp: &str) -> Option<String>;
    fn on_answer(&self, sdp: &str);
    fn on_candidate(&self, candidate: &str);
}

/// Stand-in used when no WebRTC stack is attached.
pub struct NoSignaling;

impl SignalingHandler for NoSignaling {
    fn on_offer(&self, _sdp: &str) -> Option<String> {
        debug!("webrtc offer ignored: no signaling backend");
        None
    }

    fn on_answer(&self, _sdp: &str) {}

    fn on_candidate(&self, _candidate: &str) {}
}

#[derive(Debug, Deserialize)]
struct CommandMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: String,
}

pub struct ControlPlane {
    socket: UdpSocket,
    manager: Arc<PipelineManager>,
    signaling: Arc<dyn SignalingHandler>,
}

impl ControlPlane {
    pub async fn bind(
        port: u16,
        manager: Arc<PipelineManager>,
        signaling: Arc<dyn SignalingHandler>,
    ) -> MediaResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| MediaError::HardwareUnavailable(format!("control socket: {}", e)))?;
        info!(addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "command listener bound");
        Ok(Self {
            socket,
            manager,
            signaling,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Receive loop; runs until the task is aborted at shutdown.
    pub async fn run(self) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "control recv failed");
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
            debug!(bytes = n, %peer, "control datagram");
            if let Some(reply) = self.handle_raw(&raw).await {
                if let Err(e) = self.socket.send_to(reply.as_bytes(), peer).await {
                    warn!(error = %e, %peer, "control reply failed");
                }
            }
        }
    }

    async fn handle_raw(&self, raw: &str) -> Option<String> {
        match serde_json::from_str::<CommandMessage>(raw) {
            Ok(cmd) => self.handle_command(cmd).await,
            Err(e) => {
                debug!(error = %e, "not JSON, trying legacy command form");
                self.handle_legacy(raw).await
            }
        }
    }

    async fn handle_command(&self, cmd: CommandMessage) -> Option<String> {
        match cmd.kind.as_str() {
            "model_switch" => {
                let target = match cmd.payload.as_str() {
                    "none" => Ok(None),
                    other => DetectorKind::parse(other).map(Some).ok_or_else(|| {
                        MediaError::Malformed(format!("unknown model: {}", other))
                    }),
                };
                Some(match target {
                    Ok(kind) => reply_for(self.manager.switch_detector(kind).await),
                    Err(e) => error_reply(&e),
                })
            }
            "mode_switch" => Some(match PipelineMode::parse(&cmd.payload) {
                Some(mode) => reply_for(self.manager.switch_mode(mode).await),
                None => error_reply(&MediaError::Malformed(format!(
                    "unknown mode: {}",
                    cmd.payload
                ))),
            }),
            "record_start" => Some(reply_for(self.manager.record_start().await)),
            "record_stop" => Some(reply_for(self.manager.record_stop().await)),
            "webrtc_offer" => self
                .signaling
                .on_offer(&cmd.payload)
                .map(|answer| json!({"type": "webrtc_answer", "payload": answer}).to_string()),
            "webrtc_answer" => {
                self.signaling.on_answer(&cmd.payload);
                None
            }
            "webrtc_candidate" => {
                self.signaling.on_candidate(&cmd.payload);
                None
            }
            other => {
                warn!(kind = %other, "unknown command type ignored");
                None
            }
        }
    }

    /// Legacy opaque commands: match model names by substring.
    async fn handle_legacy(&self, raw: &str) -> Option<String> {
        let upper = raw.to_ascii_uppercase();
        let target = if upper.contains("YOLOV5") {
            Some(Some(DetectorKind::Yolo))
        } else if upper.contains("RETINAFACE") {
            Some(Some(DetectorKind::RetinaFace))
        } else if upper.contains("NONE") {
            Some(None)
        } else {
            None
        };
        match target {
            Some(kind) => Some(reply_for(self.manager.switch_detector(kind).await)),
            None => {
                warn!(raw = %raw.chars().take(100).collect::<String>(), "malformed command");
                Some(error_reply(&MediaError::Malformed(
                    "unparseable command".into(),
                )))
            }
        }
    }
}

fn reply_for(result: MediaResult<()>) -> String {
    match result {
        Ok(()) => json!({"type": "ok"}).to_string(),
        Err(e) => error_reply(&e),
    }
}

fn error_reply(e: &MediaError) -> String {
    json!({"type": "error", "message": e.to_string()}).to_string()
}
