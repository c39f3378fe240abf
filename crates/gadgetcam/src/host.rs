//! Contract with the process-level host service.

/// Notifications out of the core into the host that owns the camera
/// session.
///
/// Each call may cross a process or runtime boundary; the core never
/// holds internal locks while calling in.
pub trait HostCallbacks: Send + Sync {
    /// Announce the committed stream configuration. Idempotent within a
    /// session.
    fn set_stream_config(&self, mjpeg: bool, width: u32, height: u32, fps: u32);

    /// The host should start delivering camera frames.
    fn start_streaming(&self);

    /// The host should stop delivering camera frames.
    fn stop_streaming(&self);

    /// The frame ingressed with this timestamp is no longer referenced and
    /// the host may close its handle.
    fn return_image(&self, timestamp: i64);

    /// Fire-and-forget request to terminate the hosting process.
    fn stop_service(&self);
}
