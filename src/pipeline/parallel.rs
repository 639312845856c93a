//! Hardware-bound pipeline: VI -> VPSS -> VENC, zero copies, zero
//! per-frame CPU work. The only consumer of CPU time is the dispatcher.

use std::sync::Arc;

use tracing::info;

use crate::error::MediaResult;
use crate::hw::session::{
    IspSession, VencSession, ViSession, ViVpssBind, VpssLayout, VpssSession, VpssVencBind,
};
use crate::hw::{EncoderConfig, VideoCore};

use super::dispatcher::{ConsumerRegistration, ConsumerStats, StreamDispatcher};

pub struct ParallelPipeline {
    dispatcher: StreamDispatcher,
    // Field order below is teardown order: unbind encoder, destroy encoder,
    // unbind capture, then scaler, capture, ISP.
    _bind_venc: VpssVencBind,
    venc: Arc<VencSession>,
    _bind_vi: ViVpssBind,
    _vpss: VpssSession,
    _vi: ViSession,
    _isp: IspSession,
}

impl ParallelPipeline {
    pub fn new(core: Arc<dyn VideoCore>, encoder: EncoderConfig) -> MediaResult<Self> {
        let (width, height) = (encoder.width, encoder.height);
        let isp = IspSession::new(Arc::clone(&core), 0)?;
        let vi = ViSession::new(Arc::clone(&core), 0, 0, width, height)?;
        let vpss = VpssSession::new(
            Arc::clone(&core),
            0,
            &VpssLayout {
                in_width: width,
                in_height: height,
                chn0: (width, height, 0),
                chn1: None,
            },
        )?;
        let bind_vi = ViVpssBind::new(Arc::clone(&core), &vi, &vpss)?;
        let venc = Arc::new(VencSession::new(Arc::clone(&core), 0, encoder)?);
        let bind_venc = VpssVencBind::new(Arc::clone(&core), &vpss, &venc)?;
        // No detector runs in this mode, so no overlay regions either.
        let _ = core.osd_clear(0);
        let dispatcher = StreamDispatcher::new(Arc::clone(&venc));
        info!(width, height, "parallel pipeline constructed");
        Ok(Self {
            dispatcher,
            _bind_venc: bind_venc,
            venc,
            _bind_vi: bind_vi,
            _vpss: vpss,
            _vi: vi,
            _isp: isp,
        })
    }

    pub fn register_consumer(&mut self, reg: ConsumerRegistration) {
        self.dispatcher.add_consumer(reg);
    }

    pub async fn remove_consumer(&mut self, name: &str) {
        self.dispatcher.remove_consumer(name).await;
    }

    /// The bound hardware is already producing; only the dispatcher needs
    /// spinning up.
    pub fn start(&mut self) {
        self.dispatcher.start();
    }

    pub async fn stop(&mut self) {
        self.venc.stop_recv();
        self.dispatcher.stop().await;
        info!("parallel pipeline stopped");
    }

    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        self.dispatcher.stats()
    }

    pub fn packets_fetched(&self) -> u64 {
        self.dispatcher.packets_fetched()
    }
}
