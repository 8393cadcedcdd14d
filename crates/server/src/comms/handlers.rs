//! Control request handlers
//!
//! Each handler turns one decoded request into a registry or device
//! operation and produces exactly one reply line. Failures never escape a
//! handler: they become `{"success": false, "message": ...}`.

use super::session::Session;
use crate::device::DeviceControl;
use crate::error::{AssetError, AssetResult};
use crate::manager::AssetManager;
use protocol::{
    ConnectWifiRequest, Identity, IdentityResponse, SignalRequest, StandardResponse,
    StartAssetRequest, StopAssetRequest, SubscribeRequest, decode_line, encode_line,
};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Work to run after the reply has been sent
pub type Deferred = Box<dyn FnOnce() + Send>;

/// The reply line plus optional post-reply work
pub struct Reply {
    pub line: String,
    pub deferred: Option<Deferred>,
}

impl Reply {
    pub fn new<T: Serialize>(response: &T) -> Self {
        let line = encode_line(response).unwrap_or_else(|e| {
            warn!("Failed to encode reply: {}", e);
            r#"{"success":false,"message":"internal error"}"#.to_string()
        });
        Self {
            line,
            deferred: None,
        }
    }

    pub fn from_result(result: AssetResult<()>) -> Self {
        match result {
            Ok(()) => Self::new(&StandardResponse::ok()),
            Err(e) => Self::failure(&e),
        }
    }

    pub fn failure(error: &AssetError) -> Self {
        Self::new(&StandardResponse::failure(error.to_string()))
    }

    pub fn then(mut self, work: Deferred) -> Self {
        self.deferred = Some(work);
        self
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("line", &self.line)
            .field("deferred", &self.deferred.is_some())
            .finish()
    }
}

/// One control operation served on its own port
pub trait RequestHandler: Send + Sync {
    /// Operation name, also the serving thread's name
    fn name(&self) -> &'static str;

    fn handle(&self, request: &str, peer: SocketAddr) -> Reply;
}

/// Collaborators shared by every handler
pub struct ControlContext {
    pub manager: Arc<AssetManager>,
    pub session: Arc<Session>,
    pub device: Arc<dyn DeviceControl>,
    pub identity: Identity,
}

/// `{"subscribe": bool}`: open or close the controller session
pub struct SubscribeHandler(pub Arc<ControlContext>);

impl RequestHandler for SubscribeHandler {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    fn handle(&self, request: &str, peer: SocketAddr) -> Reply {
        let ctx = &self.0;
        let result = decode_line::<SubscribeRequest>(request)
            .map_err(AssetError::from)
            .map(|req| {
                if req.subscribe {
                    ctx.session.subscribe(peer.ip());
                    ctx.manager.publish_asset_state();
                } else {
                    let stopped = ctx.manager.stop_all();
                    ctx.session.unsubscribe();
                    info!("Unsubscribe stopped {} assets", stopped);
                }
            });
        Reply::from_result(result)
    }
}

/// `{"id", "type", "config"}`: apply overrides, then start the asset
pub struct StartAssetHandler(pub Arc<ControlContext>);

impl RequestHandler for StartAssetHandler {
    fn name(&self) -> &'static str {
        "start-asset"
    }

    fn handle(&self, request: &str, _peer: SocketAddr) -> Reply {
        let ctx = &self.0;
        let result = ctx.session.ensure_subscribed().and_then(|()| {
            let req: StartAssetRequest = decode_line(request)?;
            debug!("Start {}-{} with {:?}", req.asset_type, req.id, req.config);
            ctx.manager
                .configure_and_start(&req.id, req.asset_type, &req.config)
        });
        Reply::from_result(result)
    }
}

/// `{"id", "type"}`: stop a streaming asset
pub struct StopAssetHandler(pub Arc<ControlContext>);

impl RequestHandler for StopAssetHandler {
    fn name(&self) -> &'static str {
        "stop-asset"
    }

    fn handle(&self, request: &str, _peer: SocketAddr) -> Reply {
        let ctx = &self.0;
        let result = decode_line::<StopAssetRequest>(request)
            .map_err(AssetError::from)
            .and_then(|req| ctx.manager.stop_asset(&req.id, req.asset_type));
        Reply::from_result(result)
    }
}

/// Any request: reply with the device identity
pub struct IdentityHandler(pub Arc<ControlContext>);

impl RequestHandler for IdentityHandler {
    fn name(&self) -> &'static str {
        "get-identity"
    }

    fn handle(&self, _request: &str, _peer: SocketAddr) -> Reply {
        Reply::new(&IdentityResponse {
            success: true,
            message: None,
            identity: Some(self.0.identity.clone()),
        })
    }
}

/// `{"signal": n}`: acknowledge a known signal, then run it
pub struct SignalHandler(pub Arc<ControlContext>);

impl RequestHandler for SignalHandler {
    fn name(&self) -> &'static str {
        "signal-rpc"
    }

    fn handle(&self, request: &str, _peer: SocketAddr) -> Reply {
        let ctx = &self.0;
        let parsed = ctx
            .session
            .ensure_subscribed()
            .and_then(|()| Ok(decode_line::<SignalRequest>(request)?))
            .and_then(|req| {
                if ctx.device.knows_signal(req.signal) {
                    Ok(req)
                } else {
                    Err(AssetError::BadRequest(format!("unknown signal {}", req.signal)))
                }
            });
        match parsed {
            Ok(req) => {
                let device = ctx.device.clone();
                Reply::from_result(Ok(())).then(Box::new(move || {
                    if let Err(e) = device.invoke_signal(req.signal) {
                        warn!("Signal {} failed: {}", req.signal, e);
                    }
                }))
            }
            Err(e) => Reply::failure(&e),
        }
    }
}

/// `{"ssid", "password"}`: join a Wi-Fi network
pub struct ConnectWifiHandler(pub Arc<ControlContext>);

impl RequestHandler for ConnectWifiHandler {
    fn name(&self) -> &'static str {
        "connect-wifi"
    }

    fn handle(&self, request: &str, _peer: SocketAddr) -> Reply {
        let ctx = &self.0;
        let result = decode_line::<ConnectWifiRequest>(request)
            .map_err(AssetError::from)
            .and_then(|req| ctx.device.connect_wifi(&req.ssid, &req.password));
        Reply::from_result(result)
    }
}
