//! Stream recorder.
//!
//! Wraps the encoded stream through a [`StreamMuxer`] into a file under
//! the recordings directory, writing to a `.tmp` path and renaming on
//! close so finished recordings appear atomically. The fragmented-MP4
//! muxer is supplied externally; [`AnnexBMuxer`] writes the raw bitstream
//! and is what the tests use.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::hw::Codec;
use crate::pipeline::dispatcher::{ConsumerRegistration, EncodedPacket};

/// Container interface. Implemented externally for fragmented MP4; the
/// in-tree implementation passes the Annex-B bitstream through.
pub trait StreamMuxer: Send {
    fn file_extension(&self) -> &'static str;
    fn begin(&mut self, out: &mut dyn Write) -> io::Result<()>;
    fn write_packet(&mut self, out: &mut dyn Write, pkt: &EncodedPacket) -> io::Result<()>;
    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()>;
}

/// Raw bitstream pass-through.
pub struct AnnexBMuxer {
    codec: Codec,
}

impl AnnexBMuxer {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }
}

impl StreamMuxer for AnnexBMuxer {
    fn file_extension(&self) -> &'static str {
        match self.codec {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Mjpeg => "mjpeg",
        }
    }

    fn begin(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn write_packet(&mut self, out: &mut dyn Write, pkt: &EncodedPacket) -> io::Result<()> {
        out.write_all(&pkt.data)
    }

    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.flush()
    }
}

struct RecorderInner {
    muxer: Box<dyn StreamMuxer>,
    file: Option<BufWriter<File>>,
    /// The stream only starts at a decodable point.
    primed: bool,
    finished: bool,
}

pub struct Recorder {
    inner: Mutex<RecorderInner>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Recorder {
    /// Opens `<dir>/<start-timestamp>.<ext>` for writing (via the `.tmp`
    /// staging name).
    pub fn create_in(dir: &Path, muxer: Box<dyn StreamMuxer>) -> io::Result<Arc<Self>> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let final_path = dir.join(format!("{}.{}", ts, muxer.file_extension()));
        Self::create_at(&final_path, muxer)
    }

    /// Opens an explicit target path (the `.tmp` staging name is derived
    /// from it).
    pub fn create_at(final_path: &Path, mut muxer: Box<dyn StreamMuxer>) -> io::Result<Arc<Self>> {
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp_path = final_path.with_extension(format!(
            "{}.tmp",
            final_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("rec")
        ));
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        muxer.begin(&mut file)?;
        info!(path = %final_path.display(), "recording opened");
        Ok(Arc::new(Self {
            inner: Mutex::new(RecorderInner {
                muxer,
                file: Some(file),
                primed: false,
                finished: false,
            }),
            tmp_path,
            final_path: final_path.to_path_buf(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }))
    }

    /// The dispatcher consumer feeding this recorder.
    pub fn consumer(self: &Arc<Self>, name: &str, capacity: usize) -> ConsumerRegistration {
        let recorder = Arc::clone(self);
        ConsumerRegistration::queued(
            name,
            capacity,
            Arc::new(move |pkt: &EncodedPacket| {
                recorder.on_packet(pkt).map_err(Into::into)
            }),
        )
    }

    fn on_packet(&self, pkt: &EncodedPacket) -> io::Result<()> {
        let mut g = self.inner.lock();
        if g.finished {
            return Ok(());
        }
        if !g.primed {
            if !pkt.is_keyframe {
                debug!("recorder waiting for keyframe");
                return Ok(());
            }
            g.primed = true;
        }
        let inner = &mut *g;
        if let Some(file) = inner.file.as_mut() {
            inner.muxer.write_packet(file, pkt)?;
            self.packets.fetch_add(1, Ordering::AcqRel);
            self.bytes.fetch_add(pkt.data.len() as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Finalizes the container and renames the staging file into place.
    /// Idempotent.
    pub fn close(&self) -> io::Result<PathBuf> {
        let mut g = self.inner.lock();
        if g.finished {
            return Ok(self.final_path.clone());
        }
        g.finished = true;
        let inner = &mut *g;
        if let Some(mut file) = inner.file.take() {
            inner.muxer.finish(&mut file)?;
            file.flush()?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        info!(
            path = %self.final_path.display(),
            packets = self.packets.load(Ordering::Acquire),
            bytes = self.bytes.load(Ordering::Acquire),
            "recording closed"
        );
        Ok(self.final_path.clone())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.inner.lock().finished {
            if let Err(e) = self.close() {
                warn!(error = %e, "recorder close on drop failed");
            }
        }
    }
}
