//! Per-device open/close worker
//!
//! Each USB-serial device gets one dedicated thread that owns opening and
//! closing its handle. Callers reach it only through a command channel and
//! wait for the reply on a oneshot, so driver open/close calls for one device
//! are never issued from two threads at once. Reader and writer threads share
//! the opened handle through [`SharedLink`].

use crate::error::{AssetError, AssetResult};
use crate::hardware::{SerialLink, SerialOpener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// The opened device, `None` while closed
pub type SharedLink = Arc<Mutex<Option<Box<dyn SerialLink>>>>;

pub enum DeviceCommand {
    Open {
        baud: u32,
        response: oneshot::Sender<AssetResult<()>>,
    },
    Close {
        response: oneshot::Sender<()>,
    },
    Shutdown,
}

struct DeviceWorker {
    path: String,
    opener: Arc<dyn SerialOpener>,
    link: SharedLink,
    commands: async_channel::Receiver<DeviceCommand>,
}

impl DeviceWorker {
    fn run(self) {
        debug!("Device worker for {} started", self.path);
        while let Ok(cmd) = self.commands.recv_blocking() {
            if matches!(cmd, DeviceCommand::Shutdown) {
                break;
            }
            self.handle_command(cmd);
        }
        self.close();
        debug!("Device worker for {} stopped", self.path);
    }

    fn handle_command(&self, cmd: DeviceCommand) {
        // Wrap in catch_unwind so a driver panic cannot kill the worker
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in device worker for {}: {:?}", self.path, e);
        }
    }

    fn handle_command_inner(&self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Open { baud, response } => {
                let result = self.open(baud);
                let _ = response.send(result);
            }
            DeviceCommand::Close { response } => {
                self.close();
                let _ = response.send(());
            }
            DeviceCommand::Shutdown => {}
        }
    }

    fn open(&self, baud: u32) -> AssetResult<()> {
        let mut link = self.link.lock();
        if link.is_some() {
            warn!("{} already open, reopening at {} baud", self.path, baud);
            link.take();
        }
        *link = Some(self.opener.open(&self.path, baud)?);
        info!("Opened {} at {} baud", self.path, baud);
        Ok(())
    }

    fn close(&self) {
        if self.link.lock().take().is_some() {
            info!("Closed {}", self.path);
        }
    }
}

/// Handle to a running device worker
pub struct DeviceWorkerHandle {
    path: String,
    commands: async_channel::Sender<DeviceCommand>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWorkerHandle {
    /// Spawn the worker thread `{name}-worker`
    pub fn spawn(
        name: &str,
        path: impl Into<String>,
        opener: Arc<dyn SerialOpener>,
        link: SharedLink,
    ) -> AssetResult<Self> {
        let path = path.into();
        let (tx, rx) = async_channel::unbounded();
        let worker = DeviceWorker {
            path: path.clone(),
            opener,
            link,
            commands: rx,
        };
        let thread = std::thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || worker.run())
            .map_err(|e| AssetError::Internal(format!("spawn device worker: {}", e)))?;
        Ok(Self {
            path,
            commands: tx,
            thread: Some(thread),
        })
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand,
    ) -> AssetResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send_blocking(build(tx)).map_err(|_| {
            AssetError::HardwareUnavailable(format!("device worker for {} is gone", self.path))
        })?;
        rx.blocking_recv().map_err(|_| {
            AssetError::Internal(format!("device worker for {} dropped a request", self.path))
        })
    }

    pub fn open(&self, baud: u32) -> AssetResult<()> {
        self.request(|response| DeviceCommand::Open { baud, response })?
    }

    pub fn close(&self) -> AssetResult<()> {
        self.request(|response| DeviceCommand::Close { response })
    }

    /// Stop the worker and wait for it; closes the device
    pub fn shutdown(&mut self) {
        let _ = self.commands.send_blocking(DeviceCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Device worker for {} panicked", self.path);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DeviceWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSerialOpener;

    fn worker(opener: &MockSerialOpener) -> (DeviceWorkerHandle, SharedLink) {
        let link: SharedLink = Arc::new(Mutex::new(None));
        let handle = DeviceWorkerHandle::spawn(
            "usb_serial-2",
            "/dev/ttyUSB0",
            Arc::new(opener.clone()),
            link.clone(),
        )
        .unwrap();
        (handle, link)
    }

    #[test]
    fn test_open_and_close() {
        let opener = MockSerialOpener::default();
        let (mut handle, link) = worker(&opener);

        handle.open(9600).unwrap();
        assert!(link.lock().is_some());
        assert_eq!(opener.baud("/dev/ttyUSB0"), Some(9600));

        handle.close().unwrap();
        assert!(link.lock().is_none());
        assert!(!opener.is_open("/dev/ttyUSB0"));

        handle.shutdown();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_open_failure_is_reported() {
        let opener = MockSerialOpener::default();
        opener.set_unavailable("/dev/ttyUSB0");
        let (handle, link) = worker(&opener);

        assert!(matches!(
            handle.open(115200),
            Err(AssetError::HardwareUnavailable(_))
        ));
        assert!(link.lock().is_none());
    }

    #[test]
    fn test_shutdown_closes_device() {
        let opener = MockSerialOpener::default();
        let (mut handle, _link) = worker(&opener);
        handle.open(115200).unwrap();

        handle.shutdown();
        assert!(!opener.is_open("/dev/ttyUSB0"));
        assert!(handle.close().is_err());
    }
}
