use std::sync::{Mutex, OnceLock};

/// Default baseline JPEG quality for MJPEG sessions.
pub const DEFAULT_JPEG_QUALITY: i32 = 85;
/// Default depth of the encode request queue.
pub const DEFAULT_ENCODE_QUEUE_DEPTH: usize = 4;

/// Tunables for the per-session encode worker.
#[derive(Clone, Copy, Debug)]
pub struct EncoderTunables {
    pub jpeg_quality: i32,
    pub queue_depth: usize,
}

impl Default for EncoderTunables {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            queue_depth: DEFAULT_ENCODE_QUEUE_DEPTH,
        }
    }
}

impl EncoderTunables {
    fn sanitized(self) -> Self {
        Self {
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
            queue_depth: self.queue_depth.max(1),
        }
    }
}

static ENCODER_TUNABLES: OnceLock<Mutex<EncoderTunables>> = OnceLock::new();

/// Override encoder tunables process-wide. Applies to sessions started
/// afterwards.
pub fn set_encoder_tunables(tunables: EncoderTunables) {
    let lock = ENCODER_TUNABLES.get_or_init(|| Mutex::new(EncoderTunables::default()));
    *lock.lock().expect("tunables lock poisoned") = tunables.sanitized();
}

pub(crate) fn encoder_tunables() -> EncoderTunables {
    ENCODER_TUNABLES
        .get()
        .and_then(|lock| lock.lock().ok().map(|tunables| *tunables))
        .unwrap_or_default()
}

/// Builder for process-wide gadgetcam tunables.
///
/// # Example
/// ```rust
/// use gadgetcam::prelude::*;
///
/// GadgetcamConfig::new()
///     .jpeg_quality(92)
///     .encode_queue_depth(8)
///     .apply();
/// ```
#[derive(Clone, Debug, Default)]
pub struct GadgetcamConfig {
    encoder: EncoderTunables,
}

impl GadgetcamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the MJPEG quality (clamped to 1..=100).
    pub fn jpeg_quality(mut self, quality: i32) -> Self {
        self.encoder.jpeg_quality = quality;
        self
    }

    /// Override the encode queue depth (minimum 1).
    pub fn encode_queue_depth(mut self, depth: usize) -> Self {
        self.encoder.queue_depth = depth;
        self
    }

    /// Apply the configuration to the global tunables.
    pub fn apply(self) {
        set_encoder_tunables(self.encoder);
    }
}
