//! Cold-swap cell holding the current detector.
//!
//! One mutex serializes inference against swaps: an inference in flight
//! holds the lock for its whole duration, so a swap arriving mid-inference
//! blocks until the call returns and never destroys a detector under use.
//!
//! States: `Empty -> Loading -> Active`, `Active -> Swapping -> Active`,
//! with load failures landing back in `Empty`.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{MediaError, MediaResult};

use super::{DetectError, Detector, DetectorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Empty,
    Loading,
    Active(DetectorKind),
    Swapping,
}

pub type DetectorFactory =
    Box<dyn Fn(DetectorKind) -> Result<Box<dyn Detector>, DetectError> + Send + Sync>;

pub type ResizeCallback = Box<dyn Fn(u32, u32) -> MediaResult<()> + Send + Sync>;

struct Inner {
    state: RegistryState,
    detector: Option<Box<dyn Detector>>,
    /// Input dimensions of the last successfully installed detector (or the
    /// scaler channel's current geometry); drives resize notifications.
    last_dims: Option<(u32, u32)>,
    on_resize: Option<ResizeCallback>,
}

pub struct DetectorRegistry {
    inner: Mutex<Inner>,
    factory: DetectorFactory,
}

impl DetectorRegistry {
    pub fn new(factory: DetectorFactory) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RegistryState::Empty,
                detector: None,
                last_dims: None,
                on_resize: None,
            }),
            factory,
        }
    }

    pub fn state(&self) -> RegistryState {
        self.inner.lock().state
    }

    pub fn current(&self) -> Option<DetectorKind> {
        match self.inner.lock().state {
            RegistryState::Active(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn input_size(&self) -> Option<(u32, u32)> {
        let g = self.inner.lock();
        g.detector.as_ref().map(|d| d.input_size())
    }

    /// Registers the callback invoked when a successful swap changes the
    /// detector's input dimensions.
    pub fn set_on_resize(&self, cb: ResizeCallback) {
        self.inner.lock().on_resize = Some(cb);
    }

    pub fn clear_on_resize(&self) {
        self.inner.lock().on_resize = None;
    }

    /// Seeds the dimension tracker with the scaler channel's current
    /// geometry so the first load only reconfigures when it has to.
    pub fn note_dims(&self, width: u32, height: u32) {
        self.inner.lock().last_dims = Some((width, height));
    }

    /// Loads `kind`, replacing any active detector. Blocks while an
    /// inference is in flight. On load failure the cell is left `Empty`;
    /// on a resize-callback failure the new detector is unloaded and the
    /// operation reports `ResizeFailed`.
    pub fn swap(&self, kind: DetectorKind) -> MediaResult<()> {
        let mut g = self.inner.lock();
        g.state = match g.state {
            RegistryState::Active(_) => RegistryState::Swapping,
            _ => RegistryState::Loading,
        };
        match (self.factory)(kind) {
            Err(e) => {
                g.detector = None;
                g.state = RegistryState::Empty;
                warn!(model = kind.as_str(), error = %e, "detector load failed");
                Err(MediaError::ModelLoad(e.to_string()))
            }
            Ok(det) => {
                let dims = det.input_size();
                let changed = g.last_dims != Some(dims);
                g.detector = Some(det);
                if changed {
                    if let Some(cb) = g.on_resize.as_ref() {
                        if let Err(e) = cb(dims.0, dims.1) {
                            g.detector = None;
                            g.state = RegistryState::Empty;
                            return Err(MediaError::ResizeFailed(e.to_string()));
                        }
                    }
                }
                g.last_dims = Some(dims);
                g.state = RegistryState::Active(kind);
                info!(model = kind.as_str(), width = dims.0, height = dims.1, "detector active");
                Ok(())
            }
        }
    }

    /// Drops the active detector. Blocks while an inference is in flight.
    pub fn unload(&self) {
        let mut g = self.inner.lock();
        if g.detector.take().is_some() {
            info!("detector unloaded");
        }
        g.state = RegistryState::Empty;
    }

    /// Runs `f` against the active detector under the cell's lock; the lock
    /// is held for the whole call, which is what makes swaps atomic with
    /// respect to inference.
    pub fn with_active<R>(&self, f: impl FnOnce(&mut dyn Detector) -> R) -> Option<R> {
        let mut g = self.inner.lock();
        g.detector.as_mut().map(|d| f(d.as_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeDetector {
        kind: DetectorKind,
        dims: (u32, u32),
        input: Vec<u8>,
    }

    impl Detector for FakeDetector {
        fn kind(&self) -> DetectorKind {
            self.kind
        }
        fn input_size(&self) -> (u32, u32) {
            self.dims
        }
        fn input_region(&mut self) -> &mut [u8] {
            &mut self.input
        }
        fn infer(&mut self) -> Result<(), DetectError> {
            Ok(())
        }
        fn decode(&mut self) -> Vec<Detection> {
            vec![Detection {
                bbox: BBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
                score: 1.0,
                class_id: 0,
                label: "t",
                landmarks: vec![],
            }]
        }
    }

    fn registry_with_dims(yolo: (u32, u32), face: (u32, u32), fail_face: bool) -> DetectorRegistry {
        DetectorRegistry::new(Box::new(move |kind| {
            if fail_face && kind == DetectorKind::RetinaFace {
                return Err(DetectError::Load("refused".into()));
            }
            let dims = match kind {
                DetectorKind::Yolo => yolo,
                DetectorKind::RetinaFace => face,
            };
            Ok(Box::new(FakeDetector {
                kind,
                dims,
                input: vec![0; 4],
            }))
        }))
    }

    #[test]
    fn load_moves_empty_to_active() {
        let reg = registry_with_dims((640, 640), (640, 640), false);
        assert_eq!(reg.state(), RegistryState::Empty);
        reg.swap(DetectorKind::Yolo).unwrap();
        assert_eq!(reg.state(), RegistryState::Active(DetectorKind::Yolo));
        assert_eq!(reg.input_size(), Some((640, 640)));
    }

    #[test]
    fn failed_load_lands_in_empty_and_drops_previous() {
        let reg = registry_with_dims((640, 640), (640, 640), true);
        reg.swap(DetectorKind::Yolo).unwrap();
        let err = reg.swap(DetectorKind::RetinaFace).unwrap_err();
        assert!(matches!(err, MediaError::ModelLoad(_)));
        assert_eq!(reg.state(), RegistryState::Empty);
        assert!(reg.with_active(|_| ()).is_none());
    }

    #[test]
    fn resize_callback_fires_once_per_dimension_change() {
        let reg = registry_with_dims((640, 640), (320, 320), false);
        reg.note_dims(640, 640);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls2 = Arc::clone(&calls);
        reg.set_on_resize(Box::new(move |w, h| {
            calls2.lock().push((w, h));
            Ok(())
        }));

        // Same dims as the seeded geometry: no callback.
        reg.swap(DetectorKind::Yolo).unwrap();
        assert!(calls.lock().is_empty());

        // 640 -> 320: exactly one invocation with the new size.
        reg.swap(DetectorKind::RetinaFace).unwrap();
        assert_eq!(calls.lock().clone(), vec![(320, 320)]);

        // Swapping again at the same size stays quiet.
        reg.swap(DetectorKind::RetinaFace).unwrap();
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn resize_failure_unloads_detector() {
        let reg = registry_with_dims((640, 640), (320, 320), false);
        reg.note_dims(640, 640);
        reg.set_on_resize(Box::new(|_, _| {
            Err(MediaError::HardwareUnavailable("chn1 refused".into()))
        }));
        reg.swap(DetectorKind::Yolo).unwrap();
        let err = reg.swap(DetectorKind::RetinaFace).unwrap_err();
        assert!(matches!(err, MediaError::ResizeFailed(_)));
        assert_eq!(reg.state(), RegistryState::Empty);
    }

    #[test]
    fn unload_moves_to_empty() {
        let reg = registry_with_dims((640, 640), (640, 640), false);
        reg.swap(DetectorKind::Yolo).unwrap();
        reg.unload();
        assert_eq!(reg.state(), RegistryState::Empty);
        assert_eq!(reg.current(), None);
    }

    #[test]
    fn swap_waits_for_inference_in_flight() {
        let reg = Arc::new(registry_with_dims((640, 640), (640, 640), false));
        reg.swap(DetectorKind::Yolo).unwrap();

        let order = Arc::new(AtomicU32::new(0));
        let (reg2, order2) = (Arc::clone(&reg), Arc::clone(&order));
        let infer = std::thread::spawn(move || {
            reg2.with_active(|d| {
                std::thread::sleep(std::time::Duration::from_millis(100));
                d.infer().unwrap();
                order2.store(1, Ordering::SeqCst);
            });
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        reg.swap(DetectorKind::RetinaFace).unwrap();
        // The swap could only complete after the inference released the cell.
        assert_eq!(order.load(Ordering::SeqCst), 1);
        infer.join().unwrap();
    }
}
