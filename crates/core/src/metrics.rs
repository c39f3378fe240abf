use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for the streaming data plane.
///
/// # Example
/// ```rust
/// use gadgetcam_core::metrics::StreamMetrics;
///
/// let metrics = StreamMetrics::default();
/// metrics.frame_encoded();
/// assert_eq!(metrics.frames_encoded(), 1);
/// ```
#[derive(Debug, Default)]
pub struct StreamMetrics {
    frames_encoded: AtomicU64,
    ingress_dropped: AtomicU64,
    encode_failures: AtomicU64,
    gadget_errors: AtomicU64,
}

impl StreamMetrics {
    /// A frame was encoded and queued for the gadget driver.
    pub fn frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// A camera frame was dropped at ingress because no producer buffer
    /// was free.
    pub fn ingress_drop(&self) {
        self.ingress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// An encode attempt failed.
    pub fn encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A queue/dequeue ioctl against the gadget driver failed.
    pub fn gadget_error(&self) {
        self.gadget_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    pub fn ingress_dropped(&self) -> u64 {
        self.ingress_dropped.load(Ordering::Relaxed)
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    pub fn gadget_errors(&self) -> u64 {
        self.gadget_errors.load(Ordering::Relaxed)
    }
}
