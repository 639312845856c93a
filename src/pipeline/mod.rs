//! Media pipelines and their orchestration.
//!
//! Two pipeline shapes share the dispatcher: [`parallel::ParallelPipeline`]
//! keeps the whole capture->scale->encode path hardware-bound with zero
//! per-frame CPU work, while [`serial::SerialPipeline`] breaks the
//! scale->encode bind and runs a software frame loop with inference and
//! overlay. [`manager::PipelineManager`] owns whichever is active and
//! performs cold swaps between them.

pub mod dispatcher;
pub mod manager;
pub mod parallel;
pub mod serial;

pub use dispatcher::{ConsumerRegistration, EncodedPacket, StreamDispatcher};
