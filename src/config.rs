//! Configuration for the camera core.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hw::{Codec, EncoderConfig, PixelFormat};
use crate::overlay::OverlayStyle;
use crate::pipeline::manager::PipelineMode;
use crate::pipeline::serial::{OverlayBackend, SerialConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub encoder: EncoderSection,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub detect: DetectConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub record: RecordConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            encoder: EncoderSection::default(),
            pipeline: PipelineSection::default(),
            detect: DetectConfig::default(),
            control: ControlConfig::default(),
            record: RecordConfig::default(),
        }
    }
}

/// Sensor/capture geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

/// Encoder channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSection {
    /// "h264", "h265" or "mjpeg".
    #[serde(default = "default_codec")]
    pub codec: String,

    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,

    /// Keyframe interval in frames; defaults to two seconds of video.
    #[serde(default)]
    pub gop: Option<u32>,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            bitrate_kbps: default_bitrate(),
            gop: None,
        }
    }
}

impl EncoderSection {
    pub fn codec(&self) -> Codec {
        match self.codec.as_str() {
            "h265" | "hevc" => Codec::H265,
            "mjpeg" => Codec::Mjpeg,
            _ => Codec::H264,
        }
    }
}

/// Pipeline behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_mode")]
    pub initial_mode: PipelineMode,

    /// Inference on one of every N frames in serial mode (0/1 = every
    /// frame); skipped frames reuse the last detections.
    #[serde(default)]
    pub skip_every_n: u32,

    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// "cpu" or "osd".
    #[serde(default = "default_overlay")]
    pub overlay: String,

    #[serde(default = "default_osd_regions")]
    pub osd_regions: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            initial_mode: default_mode(),
            skip_every_n: 0,
            frame_timeout_ms: default_frame_timeout_ms(),
            overlay: default_overlay(),
            osd_regions: default_osd_regions(),
        }
    }
}

/// Detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Model loaded at startup, if any ("yolov5" / "retinaface").
    #[serde(default)]
    pub default_model: Option<String>,

    #[serde(default = "default_yolo_input")]
    pub yolo_input: [u32; 2],

    #[serde(default = "default_retinaface_input")]
    pub retinaface_input: [u32; 2],

    #[serde(default = "default_score_thresh")]
    pub score_thresh: f32,

    #[serde(default = "default_iou_thresh")]
    pub iou_thresh: f32,

    #[serde(default = "default_face_score_thresh")]
    pub face_score_thresh: f32,

    #[serde(default = "default_face_iou_thresh")]
    pub face_iou_thresh: f32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            default_model: None,
            yolo_input: default_yolo_input(),
            retinaface_input: default_retinaface_input(),
            score_thresh: default_score_thresh(),
            iou_thresh: default_iou_thresh(),
            face_score_thresh: default_face_score_thresh(),
            face_iou_thresh: default_face_iou_thresh(),
        }
    }
}

/// Control surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            http_port: default_http_port(),
        }
    }
}

/// Recording output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(default = "default_record_dir")]
    pub dir: PathBuf,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            dir: default_record_dir(),
        }
    }
}

fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    30
}
fn default_codec() -> String {
    "h264".to_string()
}
fn default_bitrate() -> u32 {
    10 * 1024
}
fn default_mode() -> PipelineMode {
    PipelineMode::Parallel
}
fn default_frame_timeout_ms() -> u64 {
    100
}
fn default_overlay() -> String {
    "cpu".to_string()
}
fn default_osd_regions() -> usize {
    8
}
fn default_model_dir() -> PathBuf {
    PathBuf::from("./model")
}
fn default_yolo_input() -> [u32; 2] {
    [640, 640]
}
fn default_retinaface_input() -> [u32; 2] {
    [640, 640]
}
fn default_score_thresh() -> f32 {
    0.25
}
fn default_iou_thresh() -> f32 {
    0.45
}
fn default_face_score_thresh() -> f32 {
    0.5
}
fn default_face_iou_thresh() -> f32 {
    0.2
}
fn default_udp_port() -> u16 {
    9000
}
fn default_http_port() -> u16 {
    8080
}
fn default_record_dir() -> PathBuf {
    PathBuf::from("recordings")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid("width and height must be > 0".into()));
        }
        if self.video.width % 8 != 0 || self.video.height % 8 != 0 {
            return Err(ConfigError::Invalid(
                "width and height must be multiples of 8".into(),
            ));
        }
        if self.video.fps == 0 || self.video.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "fps must be between 1 and 120, got {}",
                self.video.fps
            )));
        }
        match self.encoder.codec.as_str() {
            "h264" | "h265" | "hevc" | "mjpeg" => {}
            other => {
                return Err(ConfigError::Invalid(format!("unsupported codec: {}", other)))
            }
        }
        match self.pipeline.overlay.as_str() {
            "cpu" | "osd" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "overlay must be \"cpu\" or \"osd\", got {}",
                    other
                )))
            }
        }
        for input in [&self.detect.yolo_input, &self.detect.retinaface_input] {
            if input[0] == 0 || input[1] == 0 {
                return Err(ConfigError::Invalid("model input must be > 0".into()));
            }
        }
        Ok(())
    }

    /// Keyframe interval: configured, or two seconds of video.
    pub fn gop(&self) -> u32 {
        self.encoder.gop.unwrap_or(self.video.fps * 2)
    }

    pub fn encoder_config(&self, input: PixelFormat) -> EncoderConfig {
        EncoderConfig {
            codec: self.encoder.codec(),
            width: self.video.width,
            height: self.video.height,
            bitrate_kbps: self.encoder.bitrate_kbps,
            gop: self.gop(),
            input,
        }
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            width: self.video.width,
            height: self.video.height,
            frame_timeout: Duration::from_millis(self.pipeline.frame_timeout_ms),
            skip_every_n: self.pipeline.skip_every_n,
            detect_input: (self.detect.yolo_input[0], self.detect.yolo_input[1]),
            overlay: match self.pipeline.overlay.as_str() {
                "osd" => OverlayBackend::HardwareOsd,
                _ => OverlayBackend::CpuBlit,
            },
            overlay_style: OverlayStyle::default(),
            osd_regions: self.pipeline.osd_regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.video.width, 1920);
        assert_eq!(cfg.gop(), 60);
        assert_eq!(cfg.encoder.codec(), Codec::H264);
        assert_eq!(cfg.pipeline.initial_mode, PipelineMode::Parallel);
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
[video]
width = 1280
height = 720
fps = 25

[encoder]
codec = "h265"
bitrate_kbps = 4096
gop = 50

[pipeline]
initial_mode = "serial"
skip_every_n = 3
overlay = "osd"

[detect]
model_dir = "/opt/models"
default_model = "yolov5"
yolo_input = [320, 320]

[control]
udp_port = 9100
http_port = 8081

[record]
dir = "/tmp/rec"
        "#;
        let cfg = Config::from_str(toml).unwrap();
        assert_eq!(cfg.video.fps, 25);
        assert_eq!(cfg.encoder.codec(), Codec::H265);
        assert_eq!(cfg.gop(), 50);
        assert_eq!(cfg.pipeline.initial_mode, PipelineMode::Serial);
        assert_eq!(cfg.detect.yolo_input, [320, 320]);
        assert_eq!(cfg.control.udp_port, 9100);
        let sc = cfg.serial_config();
        assert_eq!(sc.skip_every_n, 3);
        assert_eq!(sc.overlay, OverlayBackend::HardwareOsd);
    }

    #[test]
    fn rejects_unaligned_dimensions() {
        let toml = r#"
[video]
width = 1001
height = 720
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn rejects_unknown_codec() {
        let toml = r#"
[encoder]
codec = "av1"
        "#;
        assert!(Config::from_str(toml).is_err());
    }
}
