//! Minimal host wiring against the public service surface.
//!
//! Starts the service if a UVC gadget node is present, then pushes one
//! synthetic RGBA frame. Without a USB host driving STREAMON the frame is
//! rejected with `NotStreaming`, which is the expected idle behavior.

use gadgetcam::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct LoggingHost;

impl HostCallbacks for LoggingHost {
    fn set_stream_config(&self, mjpeg: bool, width: u32, height: u32, fps: u32) {
        info!("stream config: mjpeg={mjpeg} {width}x{height} @ {fps} fps");
    }

    fn start_streaming(&self) {
        info!("host asked to start streaming");
    }

    fn stop_streaming(&self) {
        info!("host asked to stop streaming");
    }

    fn return_image(&self, timestamp: i64) {
        info!("frame {timestamp} returned");
    }

    fn stop_service(&self) {
        info!("service stop requested");
    }
}

struct TestPattern {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TestPattern {
    fn new(width: u32, height: u32) -> Self {
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            let x = (i as u32 % width) as u8;
            px[0] = x;
            px[1] = 128;
            px[2] = 255 - x;
            px[3] = 255;
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

impl LockedFrame for TestPattern {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn planes(&self) -> SourcePlanes<'_> {
        SourcePlanes::Rgba(RgbaFrame {
            data: &self.pixels,
            stride: self.width as usize * 4,
        })
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let manager = ServiceManager::new();
    let ignored = HashSet::new();
    if !manager.should_start(&ignored) {
        println!("no uvc gadget node present, nothing to do");
        return;
    }

    if let Err(err) = manager.setup_and_start(Arc::new(LoggingHost), &ignored) {
        eprintln!("service start failed: {err}");
        return;
    }

    let frame: Arc<dyn LockedFrame> = Arc::new(TestPattern::new(640, 480));
    match manager.encode_image(frame, 0, 0) {
        Ok(()) => info!("frame accepted"),
        Err(err) => info!("frame rejected: {err}"),
    }

    std::thread::sleep(Duration::from_secs(2));
    manager.on_destroy();
}
