use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use capstream_codec::{CodecError, FramePump, FrameSender, FrameSink, PumpConfig, PumpHandle};
use capstream_transport::{RpcStream, TcpSocket};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capability::OutboundSink;
use crate::endpoint::Endpoint;
use crate::engine::RpcEngine;
use crate::error::{Result, RpcError};

/// Bind attempts before a startup failure is surfaced.
pub const BIND_RETRIES: u32 = 3;
/// Delay between bind attempts (transient port contention).
pub const BIND_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Join attempts per worker during shutdown.
const JOIN_RETRIES: u32 = 20;
/// Initial backoff between join attempts; doubles up to the cap.
const JOIN_RETRY_START: Duration = Duration::from_millis(1);
const JOIN_RETRY_MAX: Duration = Duration::from_millis(100);

/// Per-connection lifecycle state.
///
/// Terminated connections are removed from the registry, so snapshots
/// only ever observe the first two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Accepted,
    Running,
}

/// Outbound half of one connection: a dismissable frame-sender adapter.
///
/// Dismissal only stops delivery; the socket itself is closed by the pump
/// handle so teardown order stays explicit in the worker.
pub struct OutboundEndpoint {
    sender: FrameSender<RpcStream>,
    dismissed: AtomicBool,
}

impl OutboundEndpoint {
    fn new(sender: FrameSender<RpcStream>) -> Self {
        Self {
            sender,
            dismissed: AtomicBool::new(false),
        }
    }

    pub fn dismiss(&self) {
        self.dismissed.store(true, Ordering::SeqCst);
    }

    pub fn is_dismissed(&self) -> bool {
        self.dismissed.load(Ordering::SeqCst)
    }
}

impl OutboundSink for OutboundEndpoint {
    fn deliver(&self, frame: &capstream_codec::WireFrame) -> Result<()> {
        if self.is_dismissed() {
            return Err(RpcError::EndpointDismissed);
        }
        self.sender.send(frame).map_err(Into::into)
    }

    fn close(&self) {
        self.dismiss();
    }
}

struct ConnectionRecord {
    peer_addr: SocketAddr,
    state: ConnectionState,
    endpoint: Arc<Endpoint>,
    pump: PumpHandle,
    /// None between registry insert and the spawn call storing the handle,
    /// and again after shutdown takes it for joining.
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<u64, ConnectionRecord>,
    live: usize,
}

struct ServerShared {
    listener: TcpSocket,
    engine: RpcEngine,
    config: PumpConfig,
    /// Intent flag: cleared first on shutdown so the acceptor can tell a
    /// designed wakeup from a transport failure.
    accepting: AtomicBool,
    /// Status flag: true while the accept worker is running.
    acceptor_live: AtomicBool,
    registry: Mutex<Registry>,
    next_conn_id: AtomicU64,
}

/// Per-connection traffic and status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: String,
    pub state: ConnectionState,
    pub recv_count: u64,
    pub send_count: u64,
    /// True when the connection's pump is blocked waiting for input.
    pub waiting_for_data: bool,
}

/// Accepts connections and runs one frame-pump worker per connection.
///
/// Owns the accept worker, the lock-guarded connection registry, and the
/// coordinated shutdown sequence. Every accepted socket is wired as
/// sender → outbound endpoint → engine endpoint → pump, and torn down in
/// the reverse order exactly once when its worker finishes.
pub struct RpcServer {
    shared: Arc<ServerShared>,
    accept_worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl RpcServer {
    /// Bind and start accepting, with default pump configuration.
    pub fn bind(addr: SocketAddr, engine: RpcEngine) -> Result<Self> {
        Self::bind_with_config(addr, engine, PumpConfig::default())
    }

    /// Bind and start accepting.
    ///
    /// Transient bind failures (port contention from a just-closed
    /// listener) are retried a fixed number of times before surfacing.
    pub fn bind_with_config(
        addr: SocketAddr,
        engine: RpcEngine,
        config: PumpConfig,
    ) -> Result<Self> {
        let mut attempt = 1;
        let listener = loop {
            match TcpSocket::bind(addr) {
                Ok(listener) => break listener,
                Err(err) if attempt < BIND_RETRIES => {
                    warn!(%addr, attempt, %err, "bind failed, retrying");
                    attempt += 1;
                    std::thread::sleep(BIND_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        };

        let shared = Arc::new(ServerShared {
            listener,
            engine,
            config,
            accepting: AtomicBool::new(true),
            acceptor_live: AtomicBool::new(true),
            registry: Mutex::new(Registry::default()),
            next_conn_id: AtomicU64::new(1),
        });

        let acceptor_shared = Arc::clone(&shared);
        let accept_worker = std::thread::Builder::new()
            .name("capstream-accept".to_string())
            .spawn(move || accept_loop(acceptor_shared))
            .map_err(capstream_transport::TransportError::Io)?;

        info!(local_addr = %shared.listener.local_addr(), "rpc server accepting");

        Ok(Self {
            shared,
            accept_worker: Mutex::new(Some(accept_worker)),
            disposed: AtomicBool::new(false),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listener.local_addr()
    }

    /// The engine serving this listener's connections.
    pub fn engine(&self) -> &RpcEngine {
        &self.shared.engine
    }

    /// Whether the accept worker is alive.
    pub fn is_accepting(&self) -> bool {
        self.shared.acceptor_live.load(Ordering::SeqCst)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock_registry(&self.shared).live
    }

    /// Copy of the current connection descriptors.
    ///
    /// A snapshot, never a live view of the registry.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let registry = lock_registry(&self.shared);
        let mut infos: Vec<ConnectionInfo> = registry
            .connections
            .iter()
            .map(|(&id, record)| ConnectionInfo {
                id,
                peer_addr: record.peer_addr.to_string(),
                state: record.state,
                recv_count: record.endpoint.recv_count(),
                send_count: record.endpoint.send_count(),
                waiting_for_data: record.pump.is_waiting_for_data(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Stop accepting, close every live connection, and wait for all
    /// workers to finish.
    ///
    /// Idempotent; the second and later calls return `Ok(())` without
    /// touching anything. Per-connection failures during the run never
    /// reach here; an error means a worker could not be released within
    /// the retry budget.
    pub fn shutdown(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("rpc server shutting down");
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.listener.shutdown();
        if let Some(worker) = take_handle(&self.accept_worker) {
            if worker.join().is_err() {
                error!("accept worker panicked");
            }
        }

        let ids: Vec<u64> = {
            let registry = lock_registry(&self.shared);
            registry.connections.keys().copied().collect()
        };
        let mut stragglers = 0usize;
        for id in ids {
            let pump = {
                let registry = lock_registry(&self.shared);
                registry.connections.get(&id).map(|rec| rec.pump.clone())
            };
            if let Some(pump) = pump {
                pump.dispose();
            }
            if !join_worker(&self.shared, id) {
                stragglers += 1;
            }
        }

        let remaining = lock_registry(&self.shared).connections.len();
        if stragglers > 0 || remaining > 0 {
            return Err(RpcError::ShutdownFailed(format!(
                "{stragglers} workers unreleased, {remaining} registry records remain"
            )));
        }
        debug!("rpc server shut down cleanly");
        Ok(())
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "shutdown during drop failed");
        }
    }
}

fn accept_loop(shared: Arc<ServerShared>) {
    while shared.accepting.load(Ordering::SeqCst) {
        let stream = match shared.listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if shared.accepting.load(Ordering::SeqCst) {
                    error!(%err, "accept failed, stopping acceptor");
                } else {
                    debug!("accept loop stopped by shutdown");
                }
                break;
            }
        };

        if !shared.accepting.load(Ordering::SeqCst) {
            // Wakeup connection from the shutdown path; not a peer.
            break;
        }

        if let Err(err) = spawn_connection(&shared, stream) {
            // Fatal to this connection only; keep accepting.
            warn!(%err, "failed to wire accepted connection");
        }
    }
    shared.acceptor_live.store(false, Ordering::SeqCst);
    debug!("acceptor terminated");
}

fn spawn_connection(shared: &Arc<ServerShared>, stream: RpcStream) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);

    let write_half = stream.try_clone()?;
    let sender = FrameSender::with_config(write_half, shared.config.clone());
    let outbound = Arc::new(OutboundEndpoint::new(sender));
    let endpoint = shared.engine.add_endpoint(outbound.clone());

    let sink: FrameSink = {
        let endpoint = Arc::clone(&endpoint);
        Box::new(move |frame| {
            endpoint
                .forward(frame)
                .map_err(|err| CodecError::Receiver(err.to_string()))
        })
    };
    let mut pump = FramePump::with_config(stream, sink, shared.config.clone());
    let pump_handle = pump.handle()?;

    {
        let mut registry = lock_registry(shared);
        registry.live += 1;
        registry.connections.insert(
            id,
            ConnectionRecord {
                peer_addr,
                state: ConnectionState::Accepted,
                endpoint: Arc::clone(&endpoint),
                pump: pump_handle.clone(),
                worker: None,
            },
        );
    }
    info!(conn = id, %peer_addr, "connection accepted");

    let worker_shared = Arc::clone(shared);
    let worker_outbound = Arc::clone(&outbound);
    let worker_endpoint = Arc::clone(&endpoint);
    let worker_pump = pump_handle.clone();
    let worker = std::thread::Builder::new()
        .name(format!("capstream-conn-{id}"))
        .spawn(move || {
            mark_running(&worker_shared, id);
            match pump.run() {
                Ok(()) => debug!(conn = id, "connection closed"),
                Err(err) => warn!(conn = id, %err, "connection failed"),
            }
            terminate_connection(
                &worker_shared,
                id,
                &worker_outbound,
                &worker_endpoint,
                &worker_pump,
            );
        });

    match worker {
        Ok(handle) => {
            let mut registry = lock_registry(shared);
            if let Some(record) = registry.connections.get_mut(&id) {
                record.worker = Some(handle);
            } else {
                // Worker already terminated and removed its record.
                drop(registry);
                let _ = handle.join();
            }
            Ok(())
        }
        Err(err) => {
            // Never ran; tear down inline and unregister.
            endpoint.dismiss();
            pump_handle.dispose();
            let mut registry = lock_registry(shared);
            if registry.connections.remove(&id).is_some() {
                registry.live -= 1;
            }
            Err(capstream_transport::TransportError::Io(err).into())
        }
    }
}

fn mark_running(shared: &Arc<ServerShared>, id: u64) {
    let mut registry = lock_registry(shared);
    if let Some(record) = registry.connections.get_mut(&id) {
        record.state = ConnectionState::Running;
    }
}

/// One-shot teardown for a finished connection worker, in the required
/// order: outbound wrapper, engine endpoint, pump transport, registry.
fn terminate_connection(
    shared: &Arc<ServerShared>,
    id: u64,
    outbound: &OutboundEndpoint,
    endpoint: &Arc<Endpoint>,
    pump: &PumpHandle,
) {
    outbound.dismiss();
    endpoint.dismiss();
    pump.dispose();

    let mut registry = lock_registry(shared);
    if registry.connections.remove(&id).is_some() {
        registry.live -= 1;
        debug!(conn = id, live = registry.live, "connection terminated");
    }
}

/// Join one connection worker with bounded retry. Returns false only if
/// the worker never became joinable within the retry budget.
///
/// The worker handle may not have been stored yet when shutdown runs
/// right after an accept; that race is expected and resolves within a
/// retry or two.
fn join_worker(shared: &Arc<ServerShared>, id: u64) -> bool {
    let mut delay = JOIN_RETRY_START;
    for attempt in 0..JOIN_RETRIES {
        let worker = {
            let mut registry = lock_registry(shared);
            match registry.connections.get_mut(&id) {
                // Record already removed: worker finished on its own.
                None => return true,
                Some(record) => record.worker.take(),
            }
        };
        match worker {
            Some(handle) => {
                if handle.join().is_err() {
                    error!(conn = id, "connection worker panicked");
                }
                return true;
            }
            None => {
                debug!(conn = id, attempt, "worker handle not stored yet, retrying join");
                std::thread::sleep(delay);
                delay = (delay * 2).min(JOIN_RETRY_MAX);
            }
        }
    }
    error!(conn = id, "worker did not become joinable within retry budget");
    false
}

fn lock_registry(shared: &ServerShared) -> std::sync::MutexGuard<'_, Registry> {
    match shared.registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take_handle(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use capstream_codec::{pump_pair, WireFrame};

    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback addr should parse")
    }

    fn echo_engine() -> RpcEngine {
        RpcEngine::with_dispatcher(Box::new(|_, frame| Ok(Some(frame))))
    }

    fn frame(byte: u8) -> WireFrame {
        WireFrame::single_segment(vec![byte; 16]).expect("aligned payload")
    }

    fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    struct TestClient {
        sender: FrameSender<RpcStream>,
        handle: PumpHandle,
        worker: std::thread::JoinHandle<capstream_codec::Result<()>>,
        frames: mpsc::Receiver<WireFrame>,
    }

    impl TestClient {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpSocket::connect(addr).expect("client should connect");
            let (tx, frames) = mpsc::channel();
            let sink: FrameSink = Box::new(move |frame| {
                tx.send(frame)
                    .map_err(|e| CodecError::Receiver(e.to_string()))
            });
            let (mut pump, sender, handle) =
                pump_pair(stream, PumpConfig::default(), sink).expect("pump pair");
            let worker = std::thread::spawn(move || pump.run());
            Self {
                sender,
                handle,
                worker,
                frames,
            }
        }

        fn close(self) {
            self.handle.dispose();
            let _ = self.worker.join();
        }
    }

    #[test]
    fn echo_round_trip() {
        let server = RpcServer::bind(loopback(), echo_engine()).unwrap();
        let client = TestClient::connect(server.local_addr());

        let sent = frame(0xAB);
        client.sender.send(&sent).unwrap();

        let reply = client
            .frames
            .recv_timeout(Duration::from_secs(5))
            .expect("echo reply should arrive");
        assert_eq!(reply.as_bytes(), sent.as_bytes());

        assert!(wait_until(
            || {
                server
                    .snapshot()
                    .first()
                    .is_some_and(|c| c.recv_count == 1 && c.send_count == 1)
            },
            Duration::from_secs(5)
        ));

        client.close();
        server.shutdown().unwrap();
    }

    #[test]
    fn snapshot_reports_live_connections() {
        let server = RpcServer::bind(loopback(), echo_engine()).unwrap();
        let client = TestClient::connect(server.local_addr());

        // The record is inserted as Accepted before the worker starts.
        assert!(wait_until(
            || {
                server
                    .snapshot()
                    .first()
                    .is_some_and(|c| c.state == ConnectionState::Running)
            },
            Duration::from_secs(5)
        ));

        let infos = server.snapshot();
        assert_eq!(infos.len(), 1);
        assert_eq!(server.connection_count(), 1);
        assert!(!infos[0].peer_addr.is_empty());

        client.close();
        assert!(wait_until(
            || server.connection_count() == 0,
            Duration::from_secs(5)
        ));
        assert_eq!(server.engine().endpoint_count(), 0);

        server.shutdown().unwrap();
    }

    #[test]
    fn peer_close_tears_down_connection() {
        let server = RpcServer::bind(loopback(), echo_engine()).unwrap();

        let client = TestClient::connect(server.local_addr());
        client.sender.send(&frame(1)).unwrap();
        client.close();

        assert!(wait_until(
            || server.connection_count() == 0 && server.engine().endpoint_count() == 0,
            Duration::from_secs(5)
        ));
        // Acceptor survives individual connection teardown.
        assert!(server.is_accepting());

        server.shutdown().unwrap();
    }

    #[test]
    fn concurrent_connections_then_shutdown() {
        let server = RpcServer::bind(loopback(), echo_engine()).unwrap();
        let addr = server.local_addr();

        let clients: Vec<TestClient> = (0..8)
            .map(|_| TestClient::connect(addr))
            .collect();
        for (i, client) in clients.iter().enumerate() {
            client.sender.send(&frame(i as u8 + 1)).unwrap();
        }

        assert!(wait_until(
            || server.connection_count() == 8,
            Duration::from_secs(5)
        ));

        server.shutdown().unwrap();

        assert_eq!(server.connection_count(), 0);
        assert!(server.snapshot().is_empty());
        assert_eq!(server.engine().endpoint_count(), 0);
        assert!(!server.is_accepting());

        for client in clients {
            client.close();
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let server = RpcServer::bind(loopback(), echo_engine()).unwrap();
        server.shutdown().unwrap();
        server.shutdown().unwrap();
        assert!(!server.is_accepting());
    }

    #[test]
    fn shutdown_without_connections_stops_acceptor() {
        let server = RpcServer::bind(loopback(), RpcEngine::new()).unwrap();
        assert!(server.is_accepting());

        server.shutdown().unwrap();

        assert!(!server.is_accepting());
        assert_eq!(server.connection_count(), 0);
        // Listener is closed: new connections must fail.
        assert!(TcpSocket::connect(server.local_addr()).is_err());
    }

    #[test]
    fn bind_conflict_surfaces_after_retries() {
        let first = RpcServer::bind(loopback(), RpcEngine::new()).unwrap();
        let result = RpcServer::bind(first.local_addr(), RpcEngine::new());
        assert!(matches!(
            result,
            Err(RpcError::Transport(
                capstream_transport::TransportError::Bind { .. }
            ))
        ));
        first.shutdown().unwrap();
    }

    #[test]
    fn dismissed_outbound_rejects_delivery() {
        let (left, _right) = {
            let listener = TcpSocket::bind(loopback()).unwrap();
            let addr = listener.local_addr();
            let connector = std::thread::spawn(move || TcpSocket::connect(addr).unwrap());
            let accepted = listener.accept().unwrap();
            (accepted, connector.join().unwrap())
        };

        let outbound = OutboundEndpoint::new(FrameSender::new(left));
        outbound.dismiss();
        outbound.dismiss();

        let err = outbound.deliver(&frame(9)).unwrap_err();
        assert!(matches!(err, RpcError::EndpointDismissed));
    }
}
