//! Control plane
//!
//! [`SocketManager`] binds one reply socket per control operation and
//! serves each on its own thread. Every loop observes the same cancellation
//! token, so shutdown stops and joins all of them together.

pub mod handlers;
pub mod session;

pub use handlers::{
    ConnectWifiHandler, ControlContext, IdentityHandler, Reply, RequestHandler, SignalHandler,
    StartAssetHandler, StopAssetHandler, SubscribeHandler,
};
pub use session::Session;

use crate::error::{AssetError, AssetResult};
use common::transport::DEFAULT_POLL_INTERVAL;
use common::{CancelToken, Received, ReplyConnection, ReplySocket, ThreadGroup};
use std::net::{IpAddr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A handler and the port it is served on
pub struct Binding {
    pub port: u16,
    pub handler: Arc<dyn RequestHandler>,
}

impl Binding {
    pub fn new(port: u16, handler: Arc<dyn RequestHandler>) -> Self {
        Self { port, handler }
    }
}

/// The six standard control bindings
pub fn standard_bindings(
    ctx: Arc<ControlContext>,
    ports: &crate::config::PortSettings,
) -> Vec<Binding> {
    vec![
        Binding::new(ports.subscribe, Arc::new(SubscribeHandler(ctx.clone()))),
        Binding::new(ports.start_asset, Arc::new(StartAssetHandler(ctx.clone()))),
        Binding::new(ports.stop_asset, Arc::new(StopAssetHandler(ctx.clone()))),
        Binding::new(ports.identity, Arc::new(IdentityHandler(ctx.clone()))),
        Binding::new(ports.signal, Arc::new(SignalHandler(ctx.clone()))),
        Binding::new(ports.connect_wifi, Arc::new(ConnectWifiHandler(ctx))),
    ]
}

/// Run `handler` on one request, turning a panic into a failure reply
pub fn dispatch(handler: &dyn RequestHandler, request: &str, peer: SocketAddr) -> Reply {
    catch_unwind(AssertUnwindSafe(|| handler.handle(request, peer))).unwrap_or_else(|_| {
        error!("{} handler panicked on {:?}", handler.name(), request);
        Reply::failure(&AssetError::Internal(format!(
            "{} handler failed",
            handler.name()
        )))
    })
}

/// Default for how long a silent control connection may hold its port
pub const DEFAULT_CONTROL_IDLE: Duration = Duration::from_secs(3);

pub struct SocketManager {
    threads: ThreadGroup,
    addrs: Vec<(&'static str, SocketAddr)>,
}

impl SocketManager {
    /// Bind every socket, then start serving
    ///
    /// Nothing is served unless every bind succeeds. Each port serves one
    /// connection at a time, so a connection that sends nothing for
    /// `idle_timeout` is closed to let the next controller in.
    pub fn start(
        bind_host: IpAddr,
        idle_timeout: Duration,
        bindings: Vec<Binding>,
    ) -> AssetResult<Self> {
        let mut bound = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let name = binding.handler.name();
            let socket = ReplySocket::bind((bind_host, binding.port), DEFAULT_POLL_INTERVAL)
                .map_err(|e| {
                    AssetError::Transport(format!(
                        "bind {} on {}:{}: {}",
                        name, bind_host, binding.port, e
                    ))
                })?;
            let addr = socket.local_addr()?;
            bound.push((name, addr, socket, binding.handler));
        }

        let mut threads = ThreadGroup::new("control");
        let mut addrs = Vec::with_capacity(bound.len());
        for (name, addr, socket, handler) in bound {
            threads
                .spawn(name, move |token| serve(socket, handler, idle_timeout, token))
                .map_err(|e| AssetError::Internal(format!("spawn {} loop: {}", name, e)))?;
            info!("Serving {} on {}", name, addr);
            addrs.push((name, addr));
        }

        Ok(Self { threads, addrs })
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, addr)| *addr)
    }

    pub fn live_loops(&self) -> usize {
        self.threads.live_count()
    }

    /// Stop and join every loop; returns how many panicked
    pub fn shutdown(&mut self) -> usize {
        let panicked = self.threads.shutdown();
        info!("Control plane stopped");
        panicked
    }
}

fn serve(
    socket: ReplySocket,
    handler: Arc<dyn RequestHandler>,
    idle_timeout: Duration,
    token: CancelToken,
) {
    while !token.is_cancelled() {
        match socket.accept() {
            Ok(Some(conn)) => serve_connection(conn, handler.as_ref(), idle_timeout, &token),
            Ok(None) => {}
            Err(e) => {
                warn!("{}: accept failed: {}", handler.name(), e);
                if token.wait_timeout(DEFAULT_POLL_INTERVAL) {
                    break;
                }
            }
        }
    }
    debug!("{} loop exiting", handler.name());
}

/// Strict turn-taking: one request, one reply, until the peer hangs up or
/// stays silent for `idle_timeout`
fn serve_connection(
    mut conn: ReplyConnection,
    handler: &dyn RequestHandler,
    idle_timeout: Duration,
    token: &CancelToken,
) {
    let peer = conn.peer_addr();
    debug!("{}: connection from {}", handler.name(), peer);
    let mut last_request = Instant::now();
    while !token.is_cancelled() {
        match conn.recv() {
            Ok(Received::Line(request)) => {
                let reply = dispatch(handler, &request, peer);
                if let Err(e) = conn.reply(&reply.line) {
                    warn!("{}: reply to {} failed: {}", handler.name(), peer, e);
                    break;
                }
                if let Some(work) = reply.deferred {
                    if catch_unwind(AssertUnwindSafe(work)).is_err() {
                        error!("{}: deferred work panicked", handler.name());
                    }
                }
                last_request = Instant::now();
            }
            Ok(Received::Timeout) => {
                if last_request.elapsed() >= idle_timeout {
                    debug!("{}: closing idle connection from {}", handler.name(), peer);
                    break;
                }
            }
            Ok(Received::Closed) => break,
            Err(e) => {
                warn!("{}: receive from {} failed: {}", handler.name(), peer, e);
                break;
            }
        }
    }
}
