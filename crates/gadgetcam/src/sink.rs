//! Producer side of a streaming session: accepts locked camera frames
//! from the host and feeds the encode worker.

use crate::frames::FrameLedger;
use crate::host::HostCallbacks;
use crate::tunables::encoder_tunables;
use crate::ServiceError;
use gadgetcam_codec::prelude::*;
use gadgetcam_uvc::device::GadgetBuffer;
use std::sync::Arc;
use tracing::{debug, warn};

struct SinkShared<T: FrameMemory + 'static> {
    pool: SlotPool<T>,
    ledger: FrameLedger,
    host: Arc<dyn HostCallbacks>,
    metrics: Arc<StreamMetrics>,
}

impl<T: FrameMemory + 'static> EncoderCallback<T> for SinkShared<T> {
    fn on_encoded(&self, dst: SlotLease<T>, source: SourceFrame, success: bool) {
        let timestamp = source.timestamp;
        self.ledger.release(source.id);
        // The pipeline's own reference goes here; the CPU lock is gone
        // before the host is told the image is free.
        drop(source);
        self.host.return_image(timestamp);
        if success {
            self.metrics.frame_encoded();
            dst.queue_filled();
        } else {
            self.metrics.encode_failure();
            dst.cancel();
        }
    }
}

/// Frame ingress for one streaming session.
///
/// Owns the encode worker; `encode_image` is called from host threads
/// while the poller thread consumes the pool's filled slots.
pub struct FrameSink<T: FrameMemory + 'static = GadgetBuffer> {
    shared: Arc<SinkShared<T>>,
    encoder: Encoder<T>,
    config: CameraConfig,
}

impl<T: FrameMemory + 'static> FrameSink<T> {
    pub fn new(
        pool: SlotPool<T>,
        config: CameraConfig,
        host: Arc<dyn HostCallbacks>,
        metrics: Arc<StreamMetrics>,
    ) -> Result<Self, ServiceError> {
        let tunables = encoder_tunables();
        let shared = Arc::new(SinkShared {
            pool,
            ledger: FrameLedger::new(),
            host,
            metrics,
        });
        let callback: Arc<dyn EncoderCallback<T>> = shared.clone();
        let encoder = Encoder::new(config, callback, tunables.jpeg_quality, tunables.queue_depth)?;
        Ok(Self {
            shared,
            encoder,
            config,
        })
    }

    pub fn config(&self) -> CameraConfig {
        self.config
    }

    /// Number of locked frames currently in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.shared.ledger.len()
    }

    /// Accept one locked camera frame for encoding.
    ///
    /// When every producer slot is in flight the frame is dropped here and
    /// its lock released immediately; that is the backpressure policy, not
    /// a fault.
    pub fn encode_image(
        &self,
        frame: Arc<dyn LockedFrame>,
        timestamp: i64,
        rotation_degrees: i32,
    ) -> Result<(), ServiceError> {
        let id = self.shared.ledger.insert(frame.clone());
        let Some(dst) = self.shared.pool.try_acquire_free() else {
            self.shared.ledger.release(id);
            self.shared.metrics.ingress_drop();
            debug!("no free producer buffer, dropping frame at {timestamp}");
            return Err(ServiceError::Backpressure);
        };
        dst.set_timestamp(timestamp as u64);
        let request = EncodeRequest {
            source: SourceFrame {
                id,
                timestamp,
                frame,
            },
            dst,
            rotation: Rotation::from_degrees(rotation_degrees),
        };
        match self.encoder.queue_request(request) {
            SendOutcome::Ok => Ok(()),
            outcome => {
                // The dropped request cancels its slot lease on the way out.
                self.shared.ledger.release(id);
                warn!("encode queue rejected a request: {outcome:?}");
                Err(ServiceError::Backpressure)
            }
        }
    }

    /// Stop the encode worker, reporting queued requests as failures.
    pub fn shutdown(&self) {
        self.encoder.shutdown();
    }
}
