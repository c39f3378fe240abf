use crate::convert::{self, I420Planes, LockedFrame, SourcePlanes};
use crate::{ConvertError, EncodeError};
use gadgetcam_core::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How long the worker waits on the queue before re-checking its stop flag.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// A locked camera frame travelling through the encode pipeline.
///
/// `id` keys the frame in the ingress ledger; `timestamp` is echoed back
/// to the host when the frame can be released.
pub struct SourceFrame {
    pub id: u32,
    pub timestamp: i64,
    pub frame: Arc<dyn LockedFrame>,
}

/// One unit of work for the encode worker.
pub struct EncodeRequest<T> {
    pub source: SourceFrame,
    pub dst: SlotLease<T>,
    pub rotation: Rotation,
}

/// Invoked by the encode worker when a request completes.
pub trait EncoderCallback<T>: Send + Sync {
    /// Called exactly once per accepted request, success or failure.
    /// The callee decides whether the destination slot is published or
    /// cancelled.
    fn on_encoded(&self, dst: SlotLease<T>, source: SourceFrame, success: bool);
}

/// Per-session encode worker.
///
/// Owns the I420 scratch sized to the committed stream and a bounded
/// request queue. Dropping the encoder stops the worker; anything still
/// queued is reported as failed so locked camera frames are not leaked.
pub struct Encoder<T: FrameMemory + 'static> {
    tx: BoundedTx<EncodeRequest<T>>,
    continue_encoding: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: FrameMemory + 'static> Encoder<T> {
    pub fn new(
        config: CameraConfig,
        callback: Arc<dyn EncoderCallback<T>>,
        jpeg_quality: i32,
        queue_depth: usize,
    ) -> Result<Self, EncodeError> {
        let scratch = I420Planes::new(config.width, config.height)?;
        let (tx, rx) = bounded(queue_depth.max(1));
        let continue_encoding = Arc::new(AtomicBool::new(true));
        let flag = continue_encoding.clone();
        let worker = thread::Builder::new()
            .name("gadgetcam-encode".into())
            .spawn(move || worker_loop(config, scratch, rx, callback, flag, jpeg_quality))
            .map_err(EncodeError::Spawn)?;
        Ok(Self {
            tx,
            continue_encoding,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hand a request to the worker. Non-blocking.
    pub fn queue_request(&self, request: EncodeRequest<T>) -> SendOutcome {
        self.tx.send(request)
    }

    /// Stop the worker and flush the queue. Pending requests are reported
    /// as failures through the callback.
    pub fn shutdown(&self) {
        self.continue_encoding.store(false, Ordering::Release);
        self.tx.close();
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<T: FrameMemory + 'static> Drop for Encoder<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: FrameMemory>(
    config: CameraConfig,
    mut scratch: I420Planes,
    rx: BoundedRx<EncodeRequest<T>>,
    callback: Arc<dyn EncoderCallback<T>>,
    continue_encoding: Arc<AtomicBool>,
    jpeg_quality: i32,
) {
    debug!(
        "encode worker up: {}x{} {} @ {} fps",
        config.width, config.height, config.fourcc, config.fps
    );
    while continue_encoding.load(Ordering::Acquire) {
        match rx.recv_timeout(IDLE_WAIT) {
            RecvOutcome::Data(request) => {
                encode_one(&config, &mut scratch, &*callback, request, jpeg_quality)
            }
            RecvOutcome::Empty => continue,
            RecvOutcome::Closed => break,
        }
    }
    // Flush whatever is still queued as failures so the source frames get
    // unlocked and returned to the host.
    for request in rx.drain() {
        callback.on_encoded(request.dst, request.source, false);
    }
    debug!("encode worker exiting");
}

fn encode_one<T: FrameMemory>(
    config: &CameraConfig,
    scratch: &mut I420Planes,
    callback: &dyn EncoderCallback<T>,
    request: EncodeRequest<T>,
    jpeg_quality: i32,
) {
    let EncodeRequest {
        source,
        dst,
        rotation,
    } = request;
    let result = if config.fourcc == FOURCC_YUYV {
        encode_yuyv(config, scratch, &source, &dst, rotation)
    } else if config.fourcc == FOURCC_MJPEG {
        encode_mjpeg(config, scratch, &source, &dst, rotation, jpeg_quality)
    } else {
        Err(EncodeError::UnsupportedFourcc(config.fourcc))
    };
    match result {
        Ok(()) => callback.on_encoded(dst, source, true),
        Err(err) => {
            error!("encode failed: {err}");
            callback.on_encoded(dst, source, false);
        }
    }
}

fn fill_scratch(
    config: &CameraConfig,
    scratch: &mut I420Planes,
    source: &SourceFrame,
    rotation: Rotation,
) -> Result<(), ConvertError> {
    let frame = source.frame.as_ref();
    if frame.width() != config.width || frame.height() != config.height {
        return Err(ConvertError::SizeMismatch {
            got_width: frame.width(),
            got_height: frame.height(),
            want_width: config.width,
            want_height: config.height,
        });
    }
    match frame.planes() {
        SourcePlanes::Yuv(planes) => convert::android420_to_i420(&planes, scratch, rotation),
        // RGBA sources are not rotated upstream.
        SourcePlanes::Rgba(plane) => convert::rgba_to_i420(&plane, scratch),
    }
}

fn encode_yuyv<T: FrameMemory>(
    config: &CameraConfig,
    scratch: &mut I420Planes,
    source: &SourceFrame,
    dst: &SlotLease<T>,
    rotation: Rotation,
) -> Result<(), EncodeError> {
    fill_scratch(config, scratch, source, rotation)?;
    let buffer = dst.item();
    // Safety: the lease holds this slot InUse; nothing else touches it.
    let out = unsafe { buffer.as_write_slice() };
    let written = convert::i420_to_yuyv(scratch, out)?;
    buffer.set_bytes_used(written as u32);
    Ok(())
}

fn encode_mjpeg<T: FrameMemory>(
    config: &CameraConfig,
    scratch: &mut I420Planes,
    source: &SourceFrame,
    dst: &SlotLease<T>,
    rotation: Rotation,
    jpeg_quality: i32,
) -> Result<(), EncodeError> {
    fill_scratch(config, scratch, source, rotation)?;
    let buffer = dst.item();
    // Safety: the lease holds this slot InUse; nothing else touches it.
    let out = unsafe { buffer.as_write_slice() };
    let written = compress_i420(scratch, out, jpeg_quality)?;
    buffer.set_bytes_used(written as u32);
    Ok(())
}

/// Compress the I420 scratch into baseline JPEG with 4:2:0 subsampling,
/// writing directly into `dst`. A frame that would not fit fails instead
/// of growing the buffer.
pub fn compress_i420(src: &I420Planes, dst: &mut [u8], quality: i32) -> Result<usize, EncodeError> {
    let image = turbojpeg::YuvImage {
        pixels: src.as_bytes(),
        width: src.width(),
        align: 1,
        height: src.height(),
        subsamp: turbojpeg::Subsamp::Sub2x2,
    };
    let mut compressor = turbojpeg::Compressor::new()?;
    compressor.set_quality(quality)?;
    compressor.set_subsamp(turbojpeg::Subsamp::Sub2x2)?;
    let mut output = turbojpeg::OutputBuf::borrowed(dst);
    compressor.compress_yuv(image, &mut output)?;
    Ok(output.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct TestMemory {
        data: UnsafeCell<Vec<u8>>,
        used: AtomicU32,
    }

    // Safety: tests serialize access through the slot pool states.
    unsafe impl Sync for TestMemory {}

    impl TestMemory {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                data: UnsafeCell::new(vec![0; len]),
                used: AtomicU32::new(0),
            })
        }
    }

    impl FrameMemory for TestMemory {
        fn len(&self) -> usize {
            unsafe { (*self.data.get()).len() }
        }

        unsafe fn as_write_slice(&self) -> &mut [u8] {
            unsafe { (*self.data.get()).as_mut_slice() }
        }

        fn set_bytes_used(&self, bytes: u32) {
            self.used.store(bytes, Ordering::SeqCst);
        }

        fn bytes_used(&self) -> u32 {
            self.used.load(Ordering::SeqCst)
        }
    }

    struct RgbaSource {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    }

    impl RgbaSource {
        fn gray(width: u32, height: u32, value: u8) -> Arc<Self> {
            let mut pixels = vec![value; (width * height * 4) as usize];
            for px in pixels.chunks_exact_mut(4) {
                px[3] = 255;
            }
            Arc::new(Self {
                width,
                height,
                pixels,
            })
        }
    }

    impl LockedFrame for RgbaSource {
        fn width(&self) -> u32 {
            self.width
        }

        fn height(&self) -> u32 {
            self.height
        }

        fn planes(&self) -> SourcePlanes<'_> {
            SourcePlanes::Rgba(crate::convert::RgbaFrame {
                data: &self.pixels,
                stride: self.width as usize * 4,
            })
        }
    }

    struct Collector {
        results: Mutex<Vec<(i64, bool)>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(Vec::new()),
            })
        }

        fn wait_for(&self, count: usize) -> Vec<(i64, bool)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                {
                    let results = self.results.lock().unwrap();
                    if results.len() >= count {
                        return results.clone();
                    }
                }
                assert!(Instant::now() < deadline, "timed out waiting for callbacks");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl EncoderCallback<TestMemory> for Collector {
        fn on_encoded(&self, dst: SlotLease<TestMemory>, source: SourceFrame, success: bool) {
            if success {
                dst.queue_filled();
            } else {
                dst.cancel();
            }
            self.results.lock().unwrap().push((source.timestamp, success));
        }
    }

    fn config(width: u32, height: u32, fourcc: FourCc, fps: u32) -> CameraConfig {
        CameraConfig {
            width,
            height,
            fourcc,
            fps,
        }
    }

    fn request(
        pool: &SlotPool<TestMemory>,
        frame: Arc<dyn LockedFrame>,
        id: u32,
        timestamp: i64,
    ) -> EncodeRequest<TestMemory> {
        let dst = pool.try_acquire_free().expect("free slot");
        dst.set_timestamp(timestamp as u64);
        EncodeRequest {
            source: SourceFrame {
                id,
                timestamp,
                frame,
            },
            dst,
            rotation: Rotation::Deg0,
        }
    }

    #[test]
    fn yuyv_frames_are_two_bytes_per_pixel() {
        let cfg = config(16, 8, FOURCC_YUYV, 30);
        let pool = SlotPool::new(TestMemory::new(16 * 8 * 2), vec![TestMemory::new(16 * 8 * 2)]);
        let collector = Collector::new();
        let encoder = Encoder::new(cfg, collector.clone(), 85, 4).unwrap();

        let req = request(&pool, RgbaSource::gray(16, 8, 120), 1, 1000);
        assert_eq!(encoder.queue_request(req), SendOutcome::Ok);

        let results = collector.wait_for(1);
        assert_eq!(results, vec![(1000, true)]);
        let taken = pool.take_filled_and_swap();
        assert_eq!(taken.bytes_used(), 16 * 8 * 2);
    }

    #[test]
    fn mjpeg_frames_decode_to_the_committed_size() {
        let cfg = config(64, 48, FOURCC_MJPEG, 30);
        let pool = SlotPool::new(TestMemory::new(64 * 48 * 2), vec![TestMemory::new(64 * 48 * 2)]);
        let collector = Collector::new();
        let encoder = Encoder::new(cfg, collector.clone(), 85, 4).unwrap();

        let req = request(&pool, RgbaSource::gray(64, 48, 90), 1, 7);
        assert_eq!(encoder.queue_request(req), SendOutcome::Ok);
        assert_eq!(collector.wait_for(1), vec![(7, true)]);

        let taken = pool.take_filled_and_swap();
        let used = taken.bytes_used() as usize;
        assert!(used > 0);
        let jpeg = unsafe { &taken.as_write_slice()[..used] };
        let mut decompressor = turbojpeg::Decompressor::new().unwrap();
        let header = decompressor.read_header(jpeg).unwrap();
        assert_eq!(header.width, 64);
        assert_eq!(header.height, 48);
    }

    #[test]
    fn mjpeg_bottom_rows_survive_non_mcu_aligned_height() {
        // 478 is not a multiple of 16; the bottom macroblock band is padded
        // by clamping to the last row.
        let mut scratch = I420Planes::new(640, 478).unwrap();
        {
            let (y, u, v) = scratch.planes_mut();
            y.fill(60);
            // Flat bright band across the bottom 16 rows.
            y[640 * 462..].fill(200);
            u.fill(128);
            v.fill(128);
        }
        let mut dst = vec![0u8; 640 * 478 * 2];
        let written = compress_i420(&scratch, &mut dst, 90).unwrap();
        let jpeg = &dst[..written];

        let mut decompressor = turbojpeg::Decompressor::new().unwrap();
        let header = decompressor.read_header(jpeg).unwrap();
        assert_eq!(header.height, 478);

        let mut pixels = vec![0u8; 640 * 478 * 3];
        let image = turbojpeg::Image {
            pixels: pixels.as_mut_slice(),
            width: 640,
            pitch: 640 * 3,
            height: 478,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(jpeg, image.as_deref_mut()).unwrap();

        for row in [476usize, 477] {
            for px in pixels[row * 640 * 3..(row + 1) * 640 * 3].chunks_exact(3) {
                for channel in px {
                    assert!(
                        (*channel as i32 - 200).abs() <= 12,
                        "row {row} channel {channel}"
                    );
                }
            }
        }
    }

    #[test]
    fn oversized_frame_fails_instead_of_overrunning() {
        // Destination far too small for any JPEG of this size.
        let scratch = {
            let mut planes = I420Planes::new(320, 240).unwrap();
            let (y, u, v) = planes.planes_mut();
            y.fill(100);
            u.fill(128);
            v.fill(128);
            planes
        };
        let mut tiny = vec![0u8; 64];
        assert!(compress_i420(&scratch, &mut tiny, 90).is_err());
    }

    #[test]
    fn unsupported_fourcc_reports_failure_and_frees_the_slot() {
        let cfg = config(8, 8, FourCc::new(*b"H264"), 30);
        let pool = SlotPool::new(TestMemory::new(256), vec![TestMemory::new(256)]);
        let collector = Collector::new();
        let encoder = Encoder::new(cfg, collector.clone(), 85, 4).unwrap();

        let req = request(&pool, RgbaSource::gray(8, 8, 10), 1, 42);
        assert_eq!(encoder.queue_request(req), SendOutcome::Ok);
        assert_eq!(collector.wait_for(1), vec![(42, false)]);
        assert_eq!(pool.producer_states(), vec![SlotState::Free]);
        drop(encoder);
    }

    #[test]
    fn every_queued_request_gets_exactly_one_callback() {
        let cfg = config(8, 8, FourCc::new(*b"H264"), 30);
        let producers = vec![TestMemory::new(256), TestMemory::new(256), TestMemory::new(256)];
        let pool = SlotPool::new(TestMemory::new(256), producers);
        let collector = Collector::new();
        let encoder = Encoder::new(cfg, collector.clone(), 85, 4).unwrap();

        for id in 0..3 {
            let req = request(&pool, RgbaSource::gray(8, 8, 10), id, id as i64);
            assert_eq!(encoder.queue_request(req), SendOutcome::Ok);
        }
        encoder.shutdown();
        let results = collector.wait_for(3);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, success)| !success));
        assert_eq!(
            pool.producer_states(),
            vec![SlotState::Free, SlotState::Free, SlotState::Free]
        );
    }
}
