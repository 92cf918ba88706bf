use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use capstream_codec::WireFrame;
use tracing::{debug, trace};

use crate::capability::{Capability, OutboundSink};
use crate::engine::EngineShared;
use crate::error::{Result, RpcError};

struct ExportEntry {
    cap: Arc<dyn Capability>,
    refs: u32,
}

#[derive(Default)]
struct ExportTable {
    next_id: u32,
    entries: HashMap<u32, ExportEntry>,
}

/// The engine's per-connection handle.
///
/// Routes inbound frames into the dispatcher and outbound frames into the
/// connection's sink, counts traffic, and owns the capability export and
/// import tables for its connection. `forward` is only ever called by the
/// connection's pump worker, so inbound processing is single-consumer and
/// preserves arrival order.
pub struct Endpoint {
    id: u64,
    engine: Weak<EngineShared>,
    outbound: Arc<dyn OutboundSink>,
    recv_count: AtomicU64,
    send_count: AtomicU64,
    dismissed: AtomicBool,
    exports: Mutex<ExportTable>,
    imports: Mutex<HashMap<u32, u32>>,
}

impl Endpoint {
    pub(crate) fn new(id: u64, engine: Weak<EngineShared>, outbound: Arc<dyn OutboundSink>) -> Self {
        Self {
            id,
            engine,
            outbound,
            recv_count: AtomicU64::new(0),
            send_count: AtomicU64::new(0),
            dismissed: AtomicBool::new(false),
            exports: Mutex::new(ExportTable::default()),
            imports: Mutex::new(HashMap::new()),
        }
    }

    /// Identifier within the engine's endpoint table.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process one inbound frame.
    ///
    /// Bumps the receive counter, hands the frame to the engine's
    /// dispatcher, and sends back whatever reply the dispatcher produces.
    pub fn forward(self: &Arc<Self>, frame: WireFrame) -> Result<()> {
        if self.dismissed.load(Ordering::SeqCst) {
            return Err(RpcError::EndpointDismissed);
        }
        self.recv_count.fetch_add(1, Ordering::Relaxed);
        trace!(endpoint = self.id, len = frame.len(), "forwarding inbound frame");

        let Some(engine) = self.engine.upgrade() else {
            return Err(RpcError::EndpointDismissed);
        };
        if let Some(dispatcher) = engine.dispatcher() {
            if let Some(reply) = dispatcher(self, frame)? {
                self.send(reply)?;
            }
        }
        Ok(())
    }

    /// Send one frame to the remote peer via the outbound sink.
    pub fn send(&self, frame: WireFrame) -> Result<()> {
        if self.dismissed.load(Ordering::SeqCst) {
            return Err(RpcError::EndpointDismissed);
        }
        self.outbound.deliver(&frame)?;
        self.send_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The bootstrap capability this endpoint resolves for its peer.
    pub fn bootstrap(&self) -> Option<Arc<dyn Capability>> {
        self.engine.upgrade().and_then(|engine| engine.bootstrap())
    }

    /// Release all capabilities and remove this endpoint from routing.
    ///
    /// Idempotent: only the first call releases table entries and touches
    /// the engine, no matter which teardown path gets here first.
    pub fn dismiss(&self) {
        if self.dismissed.swap(true, Ordering::SeqCst) {
            return;
        }

        let exported = {
            let mut exports = lock(&self.exports);
            let count = exports.entries.len();
            exports.entries.clear();
            count
        };
        let imported = {
            let mut imports = lock(&self.imports);
            let count = imports.len();
            imports.clear();
            count
        };
        debug!(
            endpoint = self.id,
            exported, imported, "dismissed endpoint, released capability tables"
        );

        self.outbound.close();
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_endpoint(self.id);
        }
    }

    pub fn is_dismissed(&self) -> bool {
        self.dismissed.load(Ordering::SeqCst)
    }

    /// Messages received, monotonically increasing.
    ///
    /// Updated only by this endpoint's own worker; a relaxed read from any
    /// other thread is a valid diagnostic observation.
    pub fn recv_count(&self) -> u64 {
        self.recv_count.load(Ordering::Relaxed)
    }

    /// Messages sent, monotonically increasing.
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    /// Enter a capability into the export table with one reference.
    pub fn export(&self, cap: Arc<dyn Capability>) -> Result<u32> {
        if self.dismissed.load(Ordering::SeqCst) {
            return Err(RpcError::EndpointDismissed);
        }
        let mut exports = lock(&self.exports);
        let id = exports.next_id;
        exports.next_id += 1;
        exports.entries.insert(id, ExportEntry { cap, refs: 1 });
        trace!(endpoint = self.id, export = id, "exported capability");
        Ok(id)
    }

    /// Add one reference to an existing export.
    pub fn add_export_ref(&self, id: u32) -> Result<()> {
        let mut exports = lock(&self.exports);
        let entry = exports
            .entries
            .get_mut(&id)
            .ok_or(RpcError::UnknownExport(id))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop `count` references from an export; the entry is removed when
    /// its reference count reaches zero.
    pub fn release_export(&self, id: u32, count: u32) -> Result<()> {
        let mut exports = lock(&self.exports);
        let entry = exports
            .entries
            .get_mut(&id)
            .ok_or(RpcError::UnknownExport(id))?;
        entry.refs = entry.refs.saturating_sub(count);
        if entry.refs == 0 {
            exports.entries.remove(&id);
            trace!(endpoint = self.id, export = id, "released export");
        }
        Ok(())
    }

    /// Look up an exported capability.
    pub fn resolve_export(&self, id: u32) -> Result<Arc<dyn Capability>> {
        let exports = lock(&self.exports);
        exports
            .entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.cap))
            .ok_or(RpcError::UnknownExport(id))
    }

    /// Record one reference to a capability imported from the peer.
    pub fn add_import(&self, id: u32) -> Result<()> {
        if self.dismissed.load(Ordering::SeqCst) {
            return Err(RpcError::EndpointDismissed);
        }
        let mut imports = lock(&self.imports);
        *imports.entry(id).or_insert(0) += 1;
        Ok(())
    }

    /// Drop `count` references from an import.
    pub fn release_import(&self, id: u32, count: u32) -> Result<()> {
        let mut imports = lock(&self.imports);
        let refs = imports.get_mut(&id).ok_or(RpcError::UnknownImport(id))?;
        *refs = refs.saturating_sub(count);
        if *refs == 0 {
            imports.remove(&id);
            trace!(endpoint = self.id, import = id, "released import");
        }
        Ok(())
    }

    /// Number of live export table entries.
    pub fn export_count(&self) -> usize {
        lock(&self.exports).entries.len()
    }

    /// Number of live import table entries.
    pub fn import_count(&self) -> usize {
        lock(&self.imports).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("recv_count", &self.recv_count())
            .field("send_count", &self.send_count())
            .field("dismissed", &self.is_dismissed())
            .finish()
    }
}
