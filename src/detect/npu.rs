//! NPU runtime interface and its software stand-in.
//!
//! The vendor NPU SDK is an external collaborator; [`NpuRuntime`] is the
//! slice of it the detectors use: load a model, write the input tensor
//! in place, run synchronously, read quantized output tensors.

use std::path::Path;

use super::DetectError;

/// Quantization parameters and length of one tensor.
#[derive(Debug, Clone)]
pub struct TensorAttr {
    pub zp: i32,
    pub scale: f32,
    pub len: usize,
}

/// Geometry and quantization of a loaded model.
#[derive(Debug, Clone)]
pub struct NpuModelDesc {
    pub input_w: u32,
    pub input_h: u32,
    pub channels: u32,
    pub is_quantized: bool,
    pub outputs: Vec<TensorAttr>,
}

impl NpuModelDesc {
    pub fn input_bytes(&self) -> usize {
        (self.input_w * self.input_h * self.channels) as usize
    }
}

pub trait NpuRuntime: Send {
    /// Loads the model file and reports its tensor layout.
    fn load(&mut self, path: &Path) -> Result<NpuModelDesc, DetectError>;

    /// The model's input tensor memory; callers write RGB bytes directly.
    fn input_mut(&mut self) -> &mut [u8];

    /// Runs inference; returns only after the NPU finishes.
    fn run(&mut self) -> Result<(), DetectError>;

    fn output(&self, idx: usize) -> &[i8];

    fn output_attr(&self, idx: usize) -> &TensorAttr;
}

type OutputWriter = Box<dyn FnMut(&mut [Vec<i8>]) + Send>;

/// Software NPU. Tensor layout comes from a descriptor supplied at
/// construction (the per-model helpers in [`super::yolo`] and
/// [`super::retinaface`] build it); `load` only validates the model file.
/// Outputs are background-filled each run; tests seed detections through
/// [`SimNpu::set_output_writer`].
pub struct SimNpu {
    desc: NpuModelDesc,
    fills: Vec<i8>,
    input: Vec<u8>,
    outputs: Vec<Vec<i8>>,
    loaded: bool,
    writer: Option<OutputWriter>,
}

impl SimNpu {
    pub fn new(desc: NpuModelDesc, fills: Vec<i8>) -> Self {
        debug_assert_eq!(desc.outputs.len(), fills.len());
        let input = vec![0u8; desc.input_bytes()];
        let outputs = desc
            .outputs
            .iter()
            .zip(&fills)
            .map(|(attr, &fill)| vec![fill; attr.len])
            .collect();
        Self {
            desc,
            fills,
            input,
            outputs,
            loaded: false,
            writer: None,
        }
    }

    /// Installs a closure that fills the output tensors on every run.
    pub fn set_output_writer<F>(&mut self, writer: F)
    where
        F: FnMut(&mut [Vec<i8>]) + Send + 'static,
    {
        self.writer = Some(Box::new(writer));
    }
}

impl NpuRuntime for SimNpu {
    fn load(&mut self, path: &Path) -> Result<NpuModelDesc, DetectError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| DetectError::Load(format!("{}: {}", path.display(), e)))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(DetectError::Load(format!(
                "{}: not a model file",
                path.display()
            )));
        }
        self.loaded = true;
        Ok(self.desc.clone())
    }

    fn input_mut(&mut self) -> &mut [u8] {
        &mut self.input
    }

    fn run(&mut self) -> Result<(), DetectError> {
        if !self.loaded {
            return Err(DetectError::NotLoaded);
        }
        for (out, &fill) in self.outputs.iter_mut().zip(&self.fills) {
            for v in out.iter_mut() {
                *v = fill;
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            writer(&mut self.outputs);
        }
        Ok(())
    }

    fn output(&self, idx: usize) -> &[i8] {
        &self.outputs[idx]
    }

    fn output_attr(&self, idx: usize) -> &TensorAttr {
        &self.desc.outputs[idx]
    }
}
