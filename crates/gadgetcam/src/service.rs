//! Externally visible service surface: lifecycle, frame ingress, and the
//! detached shutdown notification.

use crate::host::HostCallbacks;
use crate::provider::UvcProvider;
use crate::ServiceError;
use gadgetcam_codec::prelude::LockedFrame;
use gadgetcam_uvc::prelude::find_output_node;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Hands the host's `stop_service` upcall to a background thread so the
/// listener is never stuck on host-side logic. A new request joins the
/// previous thread first, keeping the sequence causal.
#[derive(Default)]
pub(crate) struct ShutdownSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownSlot {
    pub(crate) fn request(&self, host: Arc<dyn HostCallbacks>) {
        let mut slot = self.handle.lock().expect("shutdown slot poisoned");
        if let Some(previous) = slot.take() {
            let _ = previous.join();
        }
        *slot = Some(thread::spawn(move || host.stop_service()));
    }
}

#[derive(Default)]
struct ManagerState {
    provider: Option<UvcProvider>,
    running: bool,
}

/// Entry point for the host service.
///
/// One mutex serializes every externally visible operation, so lifecycle
/// calls and frame ingress never interleave.
#[derive(Default)]
pub struct ServiceManager {
    state: Mutex<ManagerState>,
    shutdown: Arc<ShutdownSlot>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a service start would find a gadget node to drive.
    ///
    /// `ignored_nodes` lists `/dev/video*` paths known not to be the
    /// gadget (capture nodes, codecs).
    pub fn should_start(&self, ignored_nodes: &HashSet<String>) -> bool {
        let state = self.state.lock().expect("service state poisoned");
        if state.running {
            warn!("service already running, not starting again");
            return false;
        }
        find_output_node(ignored_nodes).is_some()
    }

    /// Open the gadget node and start the event listener.
    pub fn setup_and_start(
        &self,
        host: Arc<dyn HostCallbacks>,
        ignored_nodes: &HashSet<String>,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().expect("service state poisoned");
        if state.running {
            return Err(ServiceError::AlreadyRunning);
        }
        let provider = UvcProvider::start(host, ignored_nodes, self.shutdown.clone())?;
        state.provider = Some(provider);
        state.running = true;
        info!("uvc gadget service started");
        Ok(())
    }

    /// Push one locked camera frame into the active streaming session.
    pub fn encode_image(
        &self,
        frame: Arc<dyn LockedFrame>,
        timestamp: i64,
        rotation_degrees: i32,
    ) -> Result<(), ServiceError> {
        let state = self.state.lock().expect("service state poisoned");
        if !state.running {
            error!("encode_image called while the service is not running");
            return Err(ServiceError::NotRunning);
        }
        state
            .provider
            .as_ref()
            .ok_or(ServiceError::NotRunning)?
            .encode_image(frame, timestamp, rotation_degrees)
    }

    /// Final cleanup when the host service is destroyed. The listener may
    /// or may not still be running at this point.
    pub fn on_destroy(&self) {
        let mut state = self.state.lock().expect("service state poisoned");
        if !state.running {
            warn!("destroy requested but the service was already stopped");
            return;
        }
        if let Some(mut provider) = state.provider.take() {
            provider.stop();
        }
        state.running = false;
        info!("uvc gadget service destroyed");
    }
}
