//! USB camera asset
//!
//! The camera delivers frames on its own callback thread. The callback only
//! enqueues the frame (dropping it when the queue is full) and returns, so
//! the driver is never blocked; a single streamer thread drains the queue and
//! performs every socket send.

use super::config::{AssetConfig, CameraConfig, KindConfig};
use super::{Asset, AssetCore, join_threads};
use crate::error::{AssetError, AssetResult};
use crate::hardware::{CameraTransport, Frame};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{Publisher, ThreadGroup};
use protocol::{AssetState, FrameRecord};
use std::net::IpAddr;
use tracing::{info, trace, warn};

/// Frames buffered between the camera callback and the streamer
pub const FRAME_QUEUE_DEPTH: usize = 5;

pub struct CameraAsset {
    core: AssetCore,
    transport: Box<dyn CameraTransport>,
    bind_host: IpAddr,
    queue: Option<async_channel::Sender<Frame>>,
    threads: Option<ThreadGroup>,
}

impl CameraAsset {
    /// Wrap an opened camera; the stream range is what the camera reports
    pub fn new(
        id: impl Into<String>,
        port_pub: u16,
        transport: Box<dyn CameraTransport>,
        bind_host: IpAddr,
    ) -> Self {
        let config = AssetConfig::new(
            KindConfig::Camera(CameraConfig::new(transport.supported_streams())),
            port_pub,
            None,
        );
        Self {
            core: AssetCore::new(id, config),
            transport,
            bind_host,
            queue: None,
            threads: None,
        }
    }

    fn camera_config(&self) -> AssetResult<&CameraConfig> {
        match &self.core.config().kind {
            KindConfig::Camera(c) => Ok(c),
            _ => Err(AssetError::UnknownConfigType),
        }
    }

    fn teardown(&mut self) {
        self.transport.stop_preview();
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
        join_threads(&mut self.threads);
    }
}

impl Asset for CameraAsset {
    fn core(&self) -> &AssetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AssetCore {
        &mut self.core
    }

    fn start(&mut self) -> AssetResult<()> {
        self.core.ensure_idle()?;
        let (stream, quality) = {
            let config = self.camera_config()?;
            (*config.stream.value(), *config.compression_quality.value())
        };
        if !self.transport.supported_streams().contains(&stream) {
            return Err(AssetError::HardwareUnavailable(format!(
                "{} does not support {}x{}@{} {}",
                self.core.name(),
                stream.width,
                stream.height,
                stream.fps,
                stream.pixel_format
            )));
        }

        let port = self.core.config().port_pub;
        let mut publisher = Publisher::bind((self.bind_host, port)).map_err(|e| {
            AssetError::Transport(format!("{}: bind port {}: {}", self.core.name(), port, e))
        })?;

        let (tx, rx) = async_channel::bounded::<Frame>(FRAME_QUEUE_DEPTH);
        let name = self.core.name();
        let mut group = self.core.thread_group();
        group
            .spawn(self.core.thread_name("streamer"), move |_token| {
                let mut seq = 0u64;
                while let Ok(frame) = rx.recv_blocking() {
                    let record = FrameRecord {
                        seq,
                        width: frame.width,
                        height: frame.height,
                        pixel_format: frame.pixel_format.to_string(),
                        data: BASE64.encode(&frame.data),
                    };
                    seq += 1;
                    if let Err(e) = publisher.send(&record) {
                        warn!("{}: publish failed: {}", name, e);
                    }
                }
            })
            .map_err(|e| AssetError::Internal(format!("spawn streamer: {}", e)))?;
        self.threads = Some(group);

        let sender = tx.clone();
        self.queue = Some(tx);
        let callback = Box::new(move |frame: Frame| {
            if sender.try_send(frame).is_err() {
                trace!("Frame queue full, dropping frame");
            }
        });
        if let Err(e) = self.transport.start_preview(&stream, quality, callback) {
            self.teardown();
            return Err(e);
        }

        self.core.set_state(AssetState::Streaming);
        info!(
            "{} streaming {}x{}@{} {} on port {}",
            self.core.name(),
            stream.width,
            stream.height,
            stream.fps,
            stream.pixel_format,
            port
        );
        Ok(())
    }

    fn stop(&mut self) -> AssetResult<()> {
        self.core.ensure_streaming()?;
        self.teardown();
        self.core.set_state(AssetState::Idle);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.core.state() == AssetState::Streaming {
            let _ = self.stop();
        }
        self.transport.close();
    }

    fn data_plane_threads(&self) -> usize {
        self.threads.as_ref().map_or(0, ThreadGroup::live_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCameraBackend;
    use crate::hardware::sim::synthetic_streams;
    use crate::hardware::{CameraBackend, PixelFormat};
    use common::Subscriber;
    use common::test_utils::free_port;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const PATH: &str = "001-004";

    fn frame() -> Frame {
        Frame {
            width: 160,
            height: 120,
            pixel_format: PixelFormat::Yuyv,
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_stream_range_comes_from_camera() {
        let backend = MockCameraBackend::default();
        let camera = CameraAsset::new("2", 12004, backend.open(PATH).unwrap(), LOCALHOST);
        let desc = camera.desc();
        assert_eq!(
            desc.get("stream"),
            Some(&serde_json::to_value(synthetic_streams()).unwrap())
        );
        assert_eq!(
            desc.get("compression_quality"),
            Some(&json!([10, 25, 50, 75, 80, 85, 90, 95, 100]))
        );
    }

    #[test]
    fn test_frames_are_published_in_order() {
        let backend = MockCameraBackend::default();
        let port = free_port();
        let mut camera = CameraAsset::new("2", port, backend.open(PATH).unwrap(), LOCALHOST);
        camera.start().unwrap();
        assert!(backend.is_previewing(PATH));

        let mut sub =
            Subscriber::connect((LOCALHOST, port).into(), Duration::from_secs(2)).unwrap();
        let first: FrameRecord = loop {
            assert!(backend.emit(PATH, frame()));
            if let Some(record) = sub.recv_record().unwrap() {
                break record;
            }
        };
        assert_eq!(first.pixel_format, "yuyv");
        assert_eq!(BASE64.decode(&first.data).unwrap(), vec![1, 2, 3, 4]);

        assert!(backend.emit(PATH, frame()));
        let next: FrameRecord = loop {
            if let Some(record) = sub.recv_record().unwrap() {
                break record;
            }
        };
        assert_eq!(next.seq, first.seq + 1);

        camera.stop().unwrap();
        assert!(!backend.is_previewing(PATH));
        assert_eq!(camera.data_plane_threads(), 0);
    }

    #[test]
    fn test_destroy_closes_camera() {
        let backend = MockCameraBackend::default();
        let mut camera = CameraAsset::new("2", free_port(), backend.open(PATH).unwrap(), LOCALHOST);
        camera.start().unwrap();
        camera.destroy();
        assert_eq!(camera.state(), AssetState::Idle);
        assert!(!backend.is_open(PATH));
    }
}
