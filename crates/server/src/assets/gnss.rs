//! GNSS asset: forwards NMEA sentences as raw records

use super::config::{AssetConfig, GnssConfig, KindConfig};
use super::{Asset, AssetCore, join_threads};
use crate::error::{AssetError, AssetResult};
use crate::hardware::NmeaSource;
use common::{Publisher, ThreadGroup};
use protocol::{AssetState, RawRecord};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, trace, warn};

pub const DEFAULT_GNSS_ID: &str = "gnss0";

/// Sentences buffered between the receiver and the publisher
const SENTENCE_QUEUE_DEPTH: usize = 64;

pub struct GnssAsset {
    core: AssetCore,
    source: Box<dyn NmeaSource>,
    bind_host: IpAddr,
    queue: Option<async_channel::Sender<String>>,
    threads: Option<ThreadGroup>,
}

impl GnssAsset {
    pub fn new(
        id: impl Into<String>,
        port_pub: u16,
        source: Box<dyn NmeaSource>,
        bind_host: IpAddr,
    ) -> Self {
        let config = AssetConfig::new(KindConfig::Gnss(GnssConfig), port_pub, None);
        Self {
            core: AssetCore::new(id, config),
            source,
            bind_host,
            queue: None,
            threads: None,
        }
    }

    fn close_queue(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
    }
}

impl Asset for GnssAsset {
    fn core(&self) -> &AssetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AssetCore {
        &mut self.core
    }

    fn start(&mut self) -> AssetResult<()> {
        self.core.ensure_idle()?;
        let port = self.core.config().port_pub;
        let mut publisher = Publisher::bind((self.bind_host, port)).map_err(|e| {
            AssetError::Transport(format!("{}: bind port {}: {}", self.core.name(), port, e))
        })?;

        let (tx, rx) = async_channel::bounded::<String>(SENTENCE_QUEUE_DEPTH);
        let name = self.core.name();
        let mut group = self.core.thread_group();
        group
            .spawn(self.core.thread_name("publisher"), move |_token| {
                // Closing the queue is the stop signal
                while let Ok(sentence) = rx.recv_blocking() {
                    if let Err(e) = publisher.send(&RawRecord::new(sentence)) {
                        warn!("{}: publish failed: {}", name, e);
                    }
                }
            })
            .map_err(|e| AssetError::Internal(format!("spawn publisher: {}", e)))?;

        let sender = tx.clone();
        let registered = self.source.register(Arc::new(move |sentence: String| {
            if sender.try_send(sentence).is_err() {
                trace!("GNSS queue full or closed, dropping sentence");
            }
        }));
        if let Err(e) = registered {
            tx.close();
            group.shutdown();
            return Err(e);
        }

        self.queue = Some(tx);
        self.threads = Some(group);
        self.core.set_state(AssetState::Streaming);
        info!("{} streaming on port {}", self.core.name(), port);
        Ok(())
    }

    fn stop(&mut self) -> AssetResult<()> {
        self.core.ensure_streaming()?;
        self.source.unregister();
        self.close_queue();
        join_threads(&mut self.threads);
        self.core.set_state(AssetState::Idle);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.core.state() == AssetState::Streaming {
            let _ = self.stop();
        }
        self.source.unregister();
        self.close_queue();
    }

    fn data_plane_threads(&self) -> usize {
        self.threads.as_ref().map_or(0, ThreadGroup::live_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockNmeaSource;
    use common::Subscriber;
    use common::test_utils::free_port;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_forwards_sentences() {
        let source = MockNmeaSource::default();
        let port = free_port();
        let mut gnss = GnssAsset::new(DEFAULT_GNSS_ID, port, Box::new(source.clone()), LOCALHOST);
        gnss.start().unwrap();

        let mut sub =
            Subscriber::connect((LOCALHOST, port).into(), Duration::from_secs(2)).unwrap();
        // The subscriber is accepted on the next send, so keep emitting
        let sentence = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let record: RawRecord = loop {
            assert!(source.emit(sentence));
            if let Some(record) = sub.recv_record().unwrap() {
                break record;
            }
        };
        assert_eq!(record.data, sentence);

        gnss.stop().unwrap();
        assert_eq!(gnss.data_plane_threads(), 0);
        assert!(!source.is_registered());
        assert_eq!(gnss.state(), AssetState::Idle);
    }

    #[test]
    fn test_desc_has_only_id() {
        let gnss = GnssAsset::new("gnss0", 1, Box::new(MockNmeaSource::default()), LOCALHOST);
        assert_eq!(gnss.desc().len(), 1);
    }
}
