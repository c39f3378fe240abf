//! The UVC event loop: one listener thread per service instance pumping
//! control and stream events off the readiness poller.

use crate::host::HostCallbacks;
use crate::service::ShutdownSlot;
use crate::sink::FrameSink;
use crate::ServiceError;
use gadgetcam_codec::prelude::LockedFrame;
use gadgetcam_uvc::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

type ActiveSink = Arc<Mutex<Option<Arc<FrameSink>>>>;

/// Owns the gadget node and the listener thread for one service run.
pub struct UvcProvider {
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    active_sink: ActiveSink,
    metrics: Arc<StreamMetrics>,
}

impl UvcProvider {
    /// Discover the gadget node, open it, and start listening.
    pub(crate) fn start(
        host: Arc<dyn HostCallbacks>,
        ignored_nodes: &HashSet<String>,
        shutdown: Arc<ShutdownSlot>,
    ) -> Result<Self, ServiceError> {
        let Some(node) = find_output_node(ignored_nodes) else {
            return Err(ServiceError::NoDevice);
        };
        let device = UvcDevice::open(&node)?;
        let watch = NodeWatch::watch(&node)?;
        let poller = Poller::new()?;
        poller.add(watch.fd(), Interest::READABLE)?;
        poller.add(device.fd(), Interest::PRIORITY)?;

        let running = Arc::new(AtomicBool::new(true));
        let active_sink: ActiveSink = Arc::new(Mutex::new(None));
        let metrics = Arc::new(StreamMetrics::default());
        let control = ControlMachine::new(device.catalogue().clone());

        let listener = Listener {
            device,
            watch,
            poller,
            control,
            committed: None,
            session: None,
            active_sink: active_sink.clone(),
            host,
            metrics: metrics.clone(),
            running: running.clone(),
            shutdown,
        };
        let handle = thread::Builder::new()
            .name("gadgetcam-uvc".into())
            .spawn(move || listener.run())?;

        Ok(Self {
            running,
            listener: Some(handle),
            active_sink,
            metrics,
        })
    }

    /// Route a locked camera frame into the active session.
    pub fn encode_image(
        &self,
        frame: Arc<dyn LockedFrame>,
        timestamp: i64,
        rotation_degrees: i32,
    ) -> Result<(), ServiceError> {
        let sink = self
            .active_sink
            .lock()
            .expect("active sink lock poisoned")
            .clone();
        match sink {
            Some(sink) => sink.encode_image(frame, timestamp, rotation_degrees),
            None => Err(ServiceError::NotStreaming),
        }
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Stop the listener and wait for it to exit.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UvcProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

struct StreamSession {
    pool: SlotPool<GadgetBuffer>,
    sink: Arc<FrameSink>,
}

struct Listener {
    device: UvcDevice,
    watch: NodeWatch,
    poller: Poller,
    control: ControlMachine,
    committed: Option<(AppliedFormat, u32)>,
    session: Option<StreamSession>,
    active_sink: ActiveSink,
    host: Arc<dyn HostCallbacks>,
    metrics: Arc<StreamMetrics>,
    running: Arc<AtomicBool>,
    shutdown: Arc<ShutdownSlot>,
}

impl Listener {
    fn run(mut self) {
        info!(
            "listening on {} for uvc events",
            self.device.path().display()
        );
        while self.running.load(Ordering::Acquire) {
            let events = match self.poller.wait() {
                Ok(events) => events,
                Err(err) => {
                    error!("poller wait failed: {err}");
                    continue;
                }
            };
            for event in events {
                if event.fd == self.watch.fd() && event.events & Interest::READABLE != 0 {
                    self.watch.drain();
                    if self.watch.node_gone() {
                        warn!("gadget node removed without a disconnect event, stopping service");
                        self.stop_service();
                        break;
                    }
                } else {
                    // Priority and stream readiness can arrive in the same
                    // event.
                    if event.events & Interest::PRIORITY != 0 {
                        self.handle_uvc_event();
                    }
                    if event.events & Interest::WRITABLE != 0 {
                        self.handle_stream_writable();
                    }
                }
            }
        }
        if self.session.is_some() {
            self.stop_session();
        }
        info!("uvc listener exiting");
    }

    fn handle_uvc_event(&mut self) {
        let event = match self.device.dequeue_event() {
            Ok(event) => event,
            Err(err) => {
                warn!("VIDIOC_DQEVENT failed: {err}");
                return;
            }
        };
        match event {
            UvcEvent::Connect => {}
            UvcEvent::Disconnect => {
                info!("host disconnected");
                self.stop_service();
            }
            UvcEvent::Setup(setup) => {
                let response = self.control.handle_setup(&setup);
                if let Err(err) = self.device.send_response(&response) {
                    warn!("sending setup response failed: {err}");
                }
            }
            UvcEvent::Data(payload) => {
                if let Some(action) = self.control.handle_data(&payload) {
                    self.apply_commit(action);
                }
            }
            UvcEvent::StreamOn => {
                info!("stream-on event");
                self.start_session();
            }
            UvcEvent::StreamOff => {
                info!("stream-off event");
                self.stop_session();
            }
            UvcEvent::Unknown(kind) => {
                info!("unsupported uvc event {kind:#x}");
                if let Err(err) = self.device.send_response(&UvcResponse::default()) {
                    warn!("sending stub response failed: {err}");
                }
            }
        }
    }

    fn apply_commit(&mut self, action: CommitAction) {
        match self
            .device
            .apply_format(action.width, action.height, action.fourcc, action.size_image)
        {
            Ok(applied) => self.committed = Some((applied, action.fps)),
            Err(err) => error!("applying committed format failed: {err}"),
        }
    }

    fn start_session(&mut self) {
        if self.session.is_some() {
            warn!("stream-on with a session already active");
            return;
        }
        match self.build_session() {
            Ok(session) => self.session = Some(session),
            Err(err) => {
                error!("starting stream session failed: {err}");
                let sink = self
                    .active_sink
                    .lock()
                    .expect("active sink lock poisoned")
                    .take();
                if let Some(sink) = sink {
                    sink.shutdown();
                    drop(sink);
                    self.host.stop_streaming();
                }
                self.device.release_buffers();
            }
        }
    }

    fn build_session(&mut self) -> Result<StreamSession, ServiceError> {
        let Some((applied, fps)) = self.committed else {
            return Err(ServiceError::NotNegotiated);
        };
        self.device.request_buffers()?;
        let consumer = Arc::new(self.device.map_buffer(0)?);
        let mut producers = Vec::with_capacity(NUM_BUFFERS as usize - 1);
        for index in 1..NUM_BUFFERS {
            producers.push(Arc::new(self.device.map_buffer(index)?));
        }
        let pool = SlotPool::new(consumer, producers);

        let config = CameraConfig {
            width: applied.width,
            height: applied.height,
            fourcc: applied.fourcc,
            fps,
        };
        let sink = Arc::new(FrameSink::new(
            pool.clone(),
            config,
            self.host.clone(),
            self.metrics.clone(),
        )?);
        self.host.set_stream_config(
            config.fourcc == FOURCC_MJPEG,
            config.width,
            config.height,
            config.fps,
        );
        self.host.start_streaming();
        *self
            .active_sink
            .lock()
            .expect("active sink lock poisoned") = Some(sink.clone());

        // Blocks until the host delivers (and the worker encodes) the
        // first frame.
        let first = pool.take_filled_and_swap();
        self.device.stream_on().map_err(|source| UvcError::Ioctl {
            op: "VIDIOC_STREAMON",
            source,
        })?;
        self.device
            .queue_buffer(&first)
            .map_err(|source| UvcError::Ioctl {
                op: "VIDIOC_QBUF",
                source,
            })?;
        self.poller
            .modify(self.device.fd(), Interest::PRIORITY | Interest::WRITABLE)?;
        Ok(StreamSession { pool, sink })
    }

    /// Pump one frame: reclaim a transmitted buffer, queue the newest
    /// encoded one. Transient ioctl failures abort the iteration only.
    fn handle_stream_writable(&mut self) {
        let Some(session) = &self.session else {
            warn!("stream writable without an active session");
            return;
        };
        if let Err(err) = self.device.dequeue_buffer() {
            warn!("VIDIOC_DQBUF failed: {err}");
            self.metrics.gadget_error();
            return;
        }
        let next = session.pool.take_filled_and_swap();
        if let Err(err) = self.device.queue_buffer(&next) {
            warn!("VIDIOC_QBUF failed: {err}");
            self.metrics.gadget_error();
        }
    }

    fn stop_session(&mut self) {
        if let Err(err) = self.device.stream_off() {
            warn!("VIDIOC_STREAMOFF failed: {err}");
        }
        *self
            .active_sink
            .lock()
            .expect("active sink lock poisoned") = None;
        if let Some(session) = self.session.take() {
            session.sink.shutdown();
            drop(session);
            self.device.release_buffers();
            self.host.stop_streaming();
        }
        self.control.reset();
        self.committed = None;
        if let Err(err) = self.poller.modify(self.device.fd(), Interest::PRIORITY) {
            warn!("narrowing poller interest failed: {err}");
        }
    }

    /// Deterministic teardown shared by DISCONNECT and node unlink.
    fn stop_service(&mut self) {
        self.stop_session();
        if let Err(err) = self.poller.remove(self.device.fd()) {
            warn!("removing device fd from poller failed: {err}");
        }
        if let Err(err) = self.poller.remove(self.watch.fd()) {
            warn!("removing watch fd from poller failed: {err}");
        }
        self.running.store(false, Ordering::Release);
        self.shutdown.request(self.host.clone());
    }
}
