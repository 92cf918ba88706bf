use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use capstream_codec::WireFrame;
use tracing::debug;

use crate::capability::{Capability, OutboundSink};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};

/// Application callback invoked for every inbound frame.
///
/// A returned frame is sent back through the same endpoint. The engine
/// attaches no meaning to frame contents; call/return grammar lives
/// entirely in the dispatcher.
pub type Dispatcher =
    Box<dyn Fn(&Arc<Endpoint>, WireFrame) -> Result<Option<WireFrame>> + Send + Sync>;

pub(crate) struct EngineShared {
    dispatcher: Option<Dispatcher>,
    bootstrap: Mutex<Option<Arc<dyn Capability>>>,
    endpoints: Mutex<HashMap<u64, Arc<Endpoint>>>,
    next_endpoint_id: AtomicU64,
}

impl EngineShared {
    pub(crate) fn dispatcher(&self) -> Option<&Dispatcher> {
        self.dispatcher.as_ref()
    }

    pub(crate) fn bootstrap(&self) -> Option<Arc<dyn Capability>> {
        lock(&self.bootstrap).clone()
    }

    pub(crate) fn remove_endpoint(&self, id: u64) {
        if lock(&self.endpoints).remove(&id).is_some() {
            debug!(endpoint = id, "removed endpoint from engine table");
        }
    }
}

/// Registry of live endpoints and the process-wide bootstrap capability.
///
/// One engine serves every connection of a listener. Cloning is cheap and
/// shares the same endpoint table.
#[derive(Clone)]
pub struct RpcEngine {
    shared: Arc<EngineShared>,
}

impl RpcEngine {
    /// Create an engine with no dispatcher; inbound frames are counted
    /// and dropped.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an engine that routes every inbound frame to `dispatcher`.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self::build(Some(dispatcher))
    }

    fn build(dispatcher: Option<Dispatcher>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                dispatcher,
                bootstrap: Mutex::new(None),
                endpoints: Mutex::new(HashMap::new()),
                next_endpoint_id: AtomicU64::new(1),
            }),
        }
    }

    /// Set the bootstrap capability handed to every endpoint.
    ///
    /// Write-once: must happen before the listener starts accepting, and a
    /// second call fails rather than swapping the object under live
    /// connections.
    pub fn set_bootstrap(&self, cap: Arc<dyn Capability>) -> Result<()> {
        let mut bootstrap = lock(&self.shared.bootstrap);
        if bootstrap.is_some() {
            return Err(RpcError::BootstrapAlreadySet);
        }
        debug!(name = cap.name(), "bootstrap capability attached");
        *bootstrap = Some(cap);
        Ok(())
    }

    /// The bootstrap capability, if one was attached.
    pub fn bootstrap(&self) -> Option<Arc<dyn Capability>> {
        self.shared.bootstrap()
    }

    /// Register a new endpoint backed by the given outbound sink.
    pub fn add_endpoint(&self, outbound: Arc<dyn OutboundSink>) -> Arc<Endpoint> {
        let id = self.shared.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = Arc::new(Endpoint::new(id, Arc::downgrade(&self.shared), outbound));
        lock(&self.shared.endpoints).insert(id, Arc::clone(&endpoint));
        debug!(endpoint = id, "registered endpoint");
        endpoint
    }

    /// Number of endpoints currently registered.
    pub fn endpoint_count(&self) -> usize {
        lock(&self.shared.endpoints).len()
    }
}

impl Default for RpcEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
