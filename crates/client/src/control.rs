//! Control-plane calls against one device

use crate::config::DeviceProfile;
use anyhow::{Context, Result, anyhow, bail};
use common::transport::resolve;
use common::{Received, Requester, Subscriber};
use protocol::{
    AssetType, ConnectWifiRequest, Identity, IdentityResponse, SignalRequest, StandardResponse,
    StartAssetRequest, StopAssetRequest, SubscribeRequest,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Parse a `--set key=value` override
///
/// The value is read as JSON when it parses (`fps=30`, `stream={...}`) and
/// as a plain string otherwise (`ip=10.0.0.2`).
pub fn parse_override(arg: &str) -> Result<(String, Value)> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected key=value, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Empty key in '{}'", arg);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

pub struct Controller {
    device: DeviceProfile,
    timeout: Duration,
}

impl Controller {
    pub fn new(device: DeviceProfile, timeout: Duration) -> Self {
        Self { device, timeout }
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        resolve((self.device.host.as_str(), port))
            .with_context(|| format!("Cannot resolve {}:{}", self.device.host, port))
    }

    fn call<Req: Serialize>(&self, port: u16, request: &Req) -> Result<StandardResponse> {
        let addr = self.addr(port)?;
        debug!("Request to {}", addr);
        let mut requester = Requester::connect(addr, self.timeout)
            .with_context(|| format!("Cannot connect to {}", addr))?;
        Ok(requester.request(request)?)
    }

    fn expect_ok<Req: Serialize>(&self, port: u16, request: &Req) -> Result<()> {
        let reply = self.call(port, request)?;
        if reply.success {
            Ok(())
        } else {
            Err(anyhow!(
                "{}",
                reply.message.unwrap_or_else(|| "request failed".to_string())
            ))
        }
    }

    pub fn subscribe(&self, subscribe: bool) -> Result<()> {
        self.expect_ok(self.device.ports.subscribe, &SubscribeRequest { subscribe })
    }

    pub fn start(&self, id: &str, asset_type: AssetType, config: Map<String, Value>) -> Result<()> {
        let request = StartAssetRequest {
            id: id.to_string(),
            asset_type,
            config,
        };
        self.expect_ok(self.device.ports.start_asset, &request)
    }

    pub fn stop(&self, id: &str, asset_type: AssetType) -> Result<()> {
        let request = StopAssetRequest {
            id: id.to_string(),
            asset_type,
        };
        self.expect_ok(self.device.ports.stop_asset, &request)
    }

    pub fn identity(&self) -> Result<Identity> {
        let addr = self.addr(self.device.ports.identity)?;
        let mut requester = Requester::connect(addr, self.timeout)
            .with_context(|| format!("Cannot connect to {}", addr))?;
        let reply: IdentityResponse = requester.request(&Map::new())?;
        match reply.identity {
            Some(identity) if reply.success => Ok(identity),
            _ => Err(anyhow!(
                "{}",
                reply.message.unwrap_or_else(|| "no identity".to_string())
            )),
        }
    }

    pub fn signal(&self, signal: i32) -> Result<()> {
        self.expect_ok(self.device.ports.signal, &SignalRequest { signal })
    }

    pub fn connect_wifi(&self, ssid: &str, password: &str) -> Result<()> {
        let request = ConnectWifiRequest {
            ssid: ssid.to_string(),
            password: password.to_string(),
        };
        self.expect_ok(self.device.ports.connect_wifi, &request)
    }

    /// Subscribe, then wait for the catalog the device publishes in response
    pub fn catalog(&self, wait: Duration) -> Result<Value> {
        self.subscribe(true)?;
        let addr = self.addr(self.device.ports.asset_state)?;
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            let Ok(mut sub) = Subscriber::connect(addr, Duration::from_millis(250)) else {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            };
            while Instant::now() < deadline {
                match sub.recv()? {
                    Received::Line(line) => return Ok(protocol::decode_line(&line)?),
                    Received::Timeout => {}
                    Received::Closed => break,
                }
            }
        }
        bail!("No catalog published by {} within {:?}", addr, wait)
    }

    /// Stream lines from a data-plane port into `sink`
    ///
    /// Returns when `sink` returns false, `stop` is set or the device closes
    /// the stream.
    pub fn tail(
        &self,
        port: u16,
        stop: &AtomicBool,
        mut sink: impl FnMut(&str) -> bool,
    ) -> Result<()> {
        let addr = self.addr(port)?;
        let mut sub = Subscriber::connect(addr, self.timeout)
            .with_context(|| format!("Cannot connect to {}", addr))?;
        while !stop.load(Ordering::Relaxed) {
            match sub.recv()? {
                Received::Line(line) => {
                    if !sink(&line) {
                        return Ok(());
                    }
                }
                Received::Timeout => {}
                Received::Closed => return Ok(()),
            }
        }
        Ok(())
    }
}
