//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to services. This module provides the
//! shared [`AppState`], connection tracking, the transport middleware
//! hook, and server startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use duocast_proto::ServerMessage;

use crate::config::Config;
use crate::context::NetworkContext;
use crate::services::{IngestPipeline, Library, SessionStore};

pub mod http;
pub mod ws;

/// Port range scanned when no port is configured.
const PORT_SCAN_RANGE: (u16, u16) = (4400, 4410);

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Hook observing every envelope before dispatch and before write.
///
/// Taps run synchronously on the dispatcher/writer path, so they should
/// only record, not block. The default methods make every hook opt-in.
pub trait MessageTap: Send + Sync {
    /// Called with the raw frame of every inbound message.
    fn inbound(&self, _conn_id: &str, _raw: &str) {}

    /// Called with every outbound envelope before serialization.
    fn outbound(&self, _conn_id: &str, _msg: &ServerMessage) {}
}

/// Tap that mirrors all traffic to the debug log.
pub struct LoggingTap;

impl MessageTap for LoggingTap {
    fn inbound(&self, conn_id: &str, raw: &str) {
        log::debug!("[WS] {conn_id} -> {raw}");
    }

    fn outbound(&self, conn_id: &str, msg: &ServerMessage) {
        log::debug!("[WS] {conn_id} <- {msg:?}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks live WebSocket connections with force-close capability.
///
/// Each handler registers on upgrade and holds an RAII guard; shutdown
/// cancels every connection's token so the handlers exit their loops.
pub struct ConnectionRegistry {
    connections: DashMap<String, ()>,
    next_id: AtomicU64,
    /// Replaced with a fresh token after `close_all` so later
    /// connections are still accepted.
    global_cancel: RwLock<CancellationToken>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection, returning a guard for RAII cleanup.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("conn-{id}");
        let cancel_token = self.global_cancel.read().child_token();
        self.connections.insert(conn_id.clone(), ());
        log::info!(
            "[WS] Connection registered: {} (total: {})",
            conn_id,
            self.connections.len()
        );
        ConnectionGuard {
            id: conn_id,
            registry: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] Connection closed: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Signals every connection handler to terminate. Returns how many
    /// were signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
            log::info!("[WS] Force-closing {count} connection(s)");
        }
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: String,
    registry: Arc<ConnectionRegistry>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// Connection id, used for log and tap labelling.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the server force-closes connections.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// App state
// ─────────────────────────────────────────────────────────────────────────────

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to services; all business logic
/// lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Owner of sessions, clients, and fan-out.
    pub store: Arc<SessionStore>,
    /// Read-only track library over the audio root.
    pub library: Arc<Library>,
    /// Audio ingestion pipeline.
    pub ingest: Arc<IngestPipeline>,
    /// Network configuration (advertised IP, port).
    pub network: NetworkContext,
    /// Coordinator configuration.
    pub config: Arc<Config>,
    /// Live connection tracking.
    pub registry: Arc<ConnectionRegistry>,
    /// Transport middleware taps, applied in order.
    pub taps: Arc<Vec<Box<dyn MessageTap>>>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    store: Option<Arc<SessionStore>>,
    library: Option<Arc<Library>>,
    ingest: Option<Arc<IngestPipeline>>,
    network: Option<NetworkContext>,
    config: Option<Arc<Config>>,
    taps: Vec<Box<dyn MessageTap>>,
}

impl AppStateBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session store.
    pub fn store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the library.
    pub fn library(mut self, library: Arc<Library>) -> Self {
        self.library = Some(library);
        self
    }

    /// Sets the ingestion pipeline.
    pub fn ingest(mut self, ingest: Arc<IngestPipeline>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    /// Sets the network context.
    pub fn network(mut self, network: NetworkContext) -> Self {
        self.network = Some(network);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds a transport middleware tap.
    pub fn tap(mut self, tap: Box<dyn MessageTap>) -> Self {
        self.taps.push(tap);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        AppState {
            store: self.store.expect("store is required"),
            library: self.library.expect("library is required"),
            ingest: self.ingest.expect("ingest is required"),
            network: self.network.expect("network is required"),
            config: self.config.expect("config is required"),
            registry: Arc::new(ConnectionRegistry::new()),
            taps: Arc::new(self.taps),
        }
    }
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// Wires the standard services over a config and network context.
    #[must_use]
    pub fn from_config(config: Config, network: NetworkContext) -> AppState {
        let config = Arc::new(config);
        let library = Arc::new(Library::new(config.audio_root.clone()));
        let store = Arc::new(SessionStore::new(&config));
        let ingest = Arc::new(IngestPipeline::new(
            Arc::clone(&config),
            Arc::clone(&library),
        ));
        AppState::builder()
            .store(store)
            .library(library)
            .ingest(ingest)
            .network(network)
            .config(config)
            .tap(Box::new(LoggingTap))
            .build()
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP server on the configured or auto-discovered port.
pub async fn start_server(state: AppState, preferred_port: u16) -> Result<(), ServerError> {
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(PORT_SCAN_RANGE.0, PORT_SCAN_RANGE.1).await?
    };

    // Artifact URLs embed the advertised address, so record the port
    // before the first client can join.
    state.network.set_port(port);

    log::info!("Server listening on http://0.0.0.0:{port}");
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_counts_and_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard_a = registry.register();
        let guard_b = registry.register();
        assert_eq!(registry.connection_count(), 2);
        assert_ne!(guard_a.id(), guard_b.id());

        drop(guard_a);
        assert_eq!(registry.connection_count(), 1);
        drop(guard_b);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn close_all_cancels_existing_tokens_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry.register();
        let token = guard.cancel_token().clone();
        assert!(!token.is_cancelled());

        registry.close_all();
        assert!(token.is_cancelled());

        // New connections after close_all get a live token
        let fresh = registry.register();
        assert!(!fresh.cancel_token().is_cancelled());
    }
}
