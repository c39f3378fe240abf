//! Data-plane behavior across the sink, ledger, encoder, and slot pool.

use gadgetcam::prelude::*;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct TestMemory {
    data: UnsafeCell<Vec<u8>>,
    used: AtomicU32,
}

// Safety: access is serialized through the slot-pool states.
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

/// RGBA frame that records when its CPU lock is dropped.
struct TrackedFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    released: Arc<AtomicBool>,
}

impl TrackedFrame {
    fn new(width: u32, height: u32) -> (Arc<Self>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let frame = Arc::new(Self {
            width,
            height,
            pixels: vec![127; (width * height * 4) as usize],
            released: released.clone(),
        });
        (frame, released)
    }
}

impl Drop for TrackedFrame {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl LockedFrame for TrackedFrame {
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

#[derive(Default)]
struct RecordingHost {
    returned: Mutex<Vec<i64>>,
    stops: AtomicU32,
}

impl RecordingHost {
    fn wait_returned(&self, count: usize) -> Vec<i64> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let returned = self.returned.lock().unwrap();
                if returned.len() >= count {
                    return returned.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for returns");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl HostCallbacks for RecordingHost {
    fn set_stream_config(&self, _mjpeg: bool, _width: u32, _height: u32, _fps: u32) {}

    fn start_streaming(&self) {}

    fn stop_streaming(&self) {}

    fn return_image(&self, timestamp: i64) {
        self.returned.lock().unwrap().push(timestamp);
    }

    fn stop_service(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn yuyv_config(width: u32, height: u32) -> CameraConfig {
    CameraConfig {
        width,
        height,
        fourcc: FOURCC_YUYV,
        fps: 30,
    }
}

fn make_pool(buffer_len: usize, producers: usize) -> SlotPool<TestMemory> {
    SlotPool::new(
        TestMemory::new(buffer_len),
        (0..producers).map(|_| TestMemory::new(buffer_len)).collect(),
    )
}

#[test]
fn accepted_frame_is_encoded_released_and_published() {
    let pool = make_pool(16 * 8 * 2, 3);
    let host = Arc::new(RecordingHost::default());
    let metrics = Arc::new(StreamMetrics::default());
    let sink = FrameSink::new(pool.clone(), yuyv_config(16, 8), host.clone(), metrics.clone())
        .expect("sink");

    let (frame, released) = TrackedFrame::new(16, 8);
    sink.encode_image(frame.clone(), 1234, 0).expect("accepted");

    assert_eq!(host.wait_returned(1), vec![1234]);
    let published = pool.take_filled_and_swap();
    assert_eq!(published.bytes_used(), 16 * 8 * 2);
    assert_eq!(metrics.frames_encoded(), 1);
    assert_eq!(sink.frames_in_flight(), 0);

    drop(frame);
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn ingress_drops_when_every_producer_slot_is_busy() {
    let pool = make_pool(16 * 8 * 2, 2);
    let host = Arc::new(RecordingHost::default());
    let metrics = Arc::new(StreamMetrics::default());
    let sink = FrameSink::new(pool.clone(), yuyv_config(16, 8), host.clone(), metrics.clone())
        .expect("sink");

    // Hold every producer slot so ingress has nowhere to go.
    let _leases: Vec<_> = (0..2).map(|_| pool.try_acquire_free().unwrap()).collect();

    let (frame, released) = TrackedFrame::new(16, 8);
    let result = sink.encode_image(frame.clone(), 99, 0);
    assert!(matches!(result, Err(ServiceError::Backpressure)));

    // The lock is released immediately and nothing was queued or returned.
    assert_eq!(sink.frames_in_flight(), 0);
    assert_eq!(Arc::strong_count(&frame), 1);
    drop(frame);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(metrics.ingress_dropped(), 1);
    assert!(host.returned.lock().unwrap().is_empty());
}

#[test]
fn newest_frame_wins_when_the_consumer_falls_behind() {
    let pool = make_pool(16 * 8 * 2, 3);
    let host = Arc::new(RecordingHost::default());
    let metrics = Arc::new(StreamMetrics::default());
    let sink = FrameSink::new(pool.clone(), yuyv_config(16, 8), host, metrics).expect("sink");

    for timestamp in [100i64, 200, 150] {
        let (frame, _) = TrackedFrame::new(16, 8);
        sink.encode_image(frame, timestamp, 0).expect("accepted");
    }

    // Wait for all three to be encoded before consuming.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.pending_filled() < 3 {
        assert!(Instant::now() < deadline, "frames never filled");
        thread::sleep(Duration::from_millis(5));
    }

    let _newest = pool.take_filled_and_swap();
    assert_eq!(pool.pending_filled(), 0, "older frames were demoted");
}

#[test]
fn shutdown_fails_queued_frames_and_releases_their_locks() {
    // An unencodable fourcc forces the failure path for every request.
    let config = CameraConfig {
        width: 16,
        height: 8,
        fourcc: FourCc::new(*b"H264"),
        fps: 30,
    };
    let pool = make_pool(16 * 8 * 2, 3);
    let host = Arc::new(RecordingHost::default());
    let metrics = Arc::new(StreamMetrics::default());
    let sink = FrameSink::new(pool.clone(), config, host.clone(), metrics.clone()).expect("sink");

    let mut flags = Vec::new();
    for timestamp in 0..3i64 {
        let (frame, released) = TrackedFrame::new(16, 8);
        sink.encode_image(frame, timestamp, 0).expect("accepted");
        flags.push(released);
    }
    sink.shutdown();

    assert_eq!(host.wait_returned(3).len(), 3);
    assert_eq!(sink.frames_in_flight(), 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while flags.iter().any(|flag| !flag.load(Ordering::SeqCst)) {
        assert!(Instant::now() < deadline, "locks never released");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(metrics.frames_encoded(), 0);
    assert_eq!(pool.pending_filled(), 0);
    // Encoder shutdown is not a service stop.
    assert_eq!(host.stops.load(Ordering::SeqCst), 0);
}

#[test]
fn rotation_is_clamped_to_supported_angles() {
    let pool = make_pool(16 * 8 * 2, 2);
    let host = Arc::new(RecordingHost::default());
    let metrics = Arc::new(StreamMetrics::default());
    let sink = FrameSink::new(pool.clone(), yuyv_config(16, 8), host.clone(), metrics).expect("sink");

    let (frame, _) = TrackedFrame::new(16, 8);
    sink.encode_image(frame, 5, 90).expect("accepted with clamped rotation");
    assert_eq!(host.wait_returned(1), vec![5]);
}
