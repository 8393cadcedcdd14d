//! USB-serial asset
//!
//! Two data-plane threads share the device opened by the per-device worker:
//! - reader: splits incoming bytes on the configured delimiter and publishes
//!   one [`RawRecord`] per frame on `port_pub`
//! - writer: receives [`RawRecord`]s from the controller on `port_sub` and
//!   writes each payload plus `\n` to the device
//!
//! By default the writer binds `port_sub`; when the config carries a
//! controller `ip` it connects to `ip:port_sub` instead.

use super::config::{AssetConfig, KindConfig, UsbSerialConfig};
use super::{Asset, AssetCore, join_threads};
use crate::error::{AssetError, AssetResult};
use crate::hardware::SerialOpener;
use crate::hardware::serial::{FrameSplitter, READ_BUFFER_SIZE};
use crate::usb::{DeviceWorkerHandle, SharedLink};
use common::transport::DEFAULT_POLL_INTERVAL;
use common::{Inbox, Publisher, Received, ThreadGroup};
use parking_lot::Mutex;
use protocol::{AssetState, RawRecord};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct UsbSerialAsset {
    core: AssetCore,
    path: String,
    bind_host: IpAddr,
    link: SharedLink,
    worker: DeviceWorkerHandle,
    threads: Option<ThreadGroup>,
}

impl UsbSerialAsset {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        port_pub: u16,
        port_sub: u16,
        opener: Arc<dyn SerialOpener>,
        bind_host: IpAddr,
    ) -> AssetResult<Self> {
        let path = path.into();
        let config = AssetConfig::new(
            KindConfig::UsbSerial(UsbSerialConfig::default()),
            port_pub,
            Some(port_sub),
        );
        let core = AssetCore::new(id, config);
        let link: SharedLink = Arc::new(Mutex::new(None));
        let worker = DeviceWorkerHandle::spawn(&core.name(), path.clone(), opener, link.clone())?;
        Ok(Self {
            core,
            path,
            bind_host,
            link,
            worker,
            threads: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn serial_config(&self) -> AssetResult<&UsbSerialConfig> {
        match &self.core.config().kind {
            KindConfig::UsbSerial(c) => Ok(c),
            _ => Err(AssetError::UnknownConfigType),
        }
    }

    fn open_sockets(&self) -> AssetResult<(Publisher, Inbox)> {
        let config = self.core.config();
        let port_sub = config.port_sub.ok_or_else(|| {
            AssetError::InvalidConfig(format!("{} needs port_sub", self.core.name()))
        })?;
        let publisher = Publisher::bind((self.bind_host, config.port_pub)).map_err(|e| {
            AssetError::Transport(format!("bind port {}: {}", config.port_pub, e))
        })?;
        let inbox = match config.connected_device_ip {
            Some(ip) => Inbox::connect(SocketAddr::new(ip, port_sub), DEFAULT_POLL_INTERVAL),
            None => Inbox::bind((self.bind_host, port_sub), DEFAULT_POLL_INTERVAL)
                .map_err(|e| AssetError::Transport(format!("bind port {}: {}", port_sub, e)))?,
        };
        Ok((publisher, inbox))
    }

    fn spawn_threads(
        &self,
        mut publisher: Publisher,
        mut inbox: Inbox,
        delimiter: u8,
    ) -> std::io::Result<ThreadGroup> {
        let mut group = self.core.thread_group();

        let link = self.link.clone();
        let name = self.core.name();
        group.spawn(self.core.thread_name("reader"), move |token| {
            let mut splitter = FrameSplitter::new(delimiter);
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while !token.is_cancelled() {
                let read = match link.lock().as_mut() {
                    Some(device) => device.read(&mut buf),
                    None => break,
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        error!("{}: device read failed: {}", name, e);
                        break;
                    }
                };
                for frame in splitter.push(&buf[..n]) {
                    let record = RawRecord::new(String::from_utf8_lossy(&frame));
                    if let Err(e) = publisher.send(&record) {
                        warn!("{}: publish failed: {}", name, e);
                    }
                }
            }
            debug!("{} reader exiting", name);
        })?;

        let link = self.link.clone();
        let name = self.core.name();
        let spawned = group.spawn(self.core.thread_name("writer"), move |token| {
            while !token.is_cancelled() {
                let line = match inbox.recv() {
                    Ok(Received::Line(line)) => line,
                    Ok(Received::Timeout) => continue,
                    Ok(Received::Closed) => {
                        debug!("{}: controller disconnected", name);
                        continue;
                    }
                    Err(e) => {
                        warn!("{}: inbound stream failed: {}", name, e);
                        continue;
                    }
                };
                let record: RawRecord = match protocol::decode_line(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("{}: dropping malformed record: {}", name, e);
                        continue;
                    }
                };
                let mut payload = record.data.into_bytes();
                payload.push(b'\n');
                let written = match link.lock().as_mut() {
                    Some(device) => device.write_all(&payload),
                    None => break,
                };
                if let Err(e) = written {
                    error!("{}: device write failed: {}", name, e);
                }
            }
            debug!("{} writer exiting", name);
        });
        if let Err(e) = spawned {
            group.shutdown();
            return Err(e);
        }
        Ok(group)
    }
}

impl Asset for UsbSerialAsset {
    fn core(&self) -> &AssetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AssetCore {
        &mut self.core
    }

    fn start(&mut self) -> AssetResult<()> {
        self.core.ensure_idle()?;
        let (baud, delimiter) = {
            let config = self.serial_config()?;
            (*config.baud.value(), config.delimiter_byte())
        };

        self.worker.open(baud)?;
        let (publisher, inbox) = match self.open_sockets() {
            Ok(sockets) => sockets,
            Err(e) => {
                let _ = self.worker.close();
                return Err(e);
            }
        };
        let group = match self.spawn_threads(publisher, inbox, delimiter) {
            Ok(group) => group,
            Err(e) => {
                let _ = self.worker.close();
                return Err(AssetError::Internal(format!("spawn data plane: {}", e)));
            }
        };

        self.threads = Some(group);
        self.core.set_state(AssetState::Streaming);
        info!(
            "{} streaming {} at {} baud (pub {}, sub {:?})",
            self.core.name(),
            self.path,
            baud,
            self.core.config().port_pub,
            self.core.config().port_sub
        );
        Ok(())
    }

    fn stop(&mut self) -> AssetResult<()> {
        self.core.ensure_streaming()?;
        join_threads(&mut self.threads);
        let closed = self.worker.close();
        self.core.set_state(AssetState::Idle);
        closed
    }

    fn destroy(&mut self) {
        if self.core.state() == AssetState::Streaming {
            let _ = self.stop();
        }
        self.worker.shutdown();
    }

    fn data_plane_threads(&self) -> usize {
        self.threads.as_ref().map_or(0, ThreadGroup::live_count)
    }
}
