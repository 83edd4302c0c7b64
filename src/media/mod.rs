#![forbid(unsafe_code)]

// Media engine adapter - the narrow surface the signaling core uses to reach
// the mediasoup workers. Nothing outside this module creates engine objects.

pub mod config;
pub mod types;

pub use config::{MediaConfig, RouterConfig, TransportConfig, WorkerConfig};
pub use types::{MediaError, MediaResult, TransportInfo};

use anyhow::Result;
use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use mediasoup::worker_manager::WorkerManager;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Voice activity detection parameters for the per-room level observer.
const VAD_MAX_ENTRIES: u16 = 10;
const VAD_THRESHOLD_DBFS: i8 = -80;
const VAD_INTERVAL_MS: u16 = 100;

/// Owns the worker pool and exposes the engine operations the signaling core
/// needs: routers, level observers, WebRTC transports, producers, consumers.
/// Engine objects close when their last handle is dropped.
pub struct MediaEngine {
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    config: Arc<MediaConfig>,
    // kept alive for the lifetime of the pool
    _worker_manager: WorkerManager,
}

impl MediaEngine {
    pub async fn new(config: MediaConfig) -> Result<Self> {
        let config = Arc::new(config);
        let manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(config.worker.num_workers);
        for index in 0..config.worker.num_workers {
            let worker = manager
                .create_worker(config.worker.to_worker_settings())
                .await
                .map_err(|e| MediaError::Worker(format!("failed to create worker {index}: {e}")))?;
            worker
                .on_dead(move |reason| {
                    error!("media worker {} died: {:?}", index, reason);
                })
                .detach();
            info!("created media worker {} ({})", index, worker.id());
            workers.push(worker);
        }
        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
            config,
            _worker_manager: manager,
        })
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Round-robin across the pool; occasional imbalance is acceptable.
    fn pick_worker(&self) -> &Worker {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// Creates the router backing a new room.
    pub async fn create_router(&self) -> MediaResult<Router> {
        let worker = self.pick_worker();
        let router = worker
            .create_router(self.config.router.to_router_options())
            .await
            .map_err(|e| MediaError::Router(format!("failed to create router: {e}")))?;
        debug!("created router {}", router.id());
        Ok(router)
    }

    /// Creates the audio level observer that drives producerSpeaking events.
    pub async fn create_level_observer(
        &self,
        router: &Router,
    ) -> MediaResult<AudioLevelObserver> {
        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = NonZeroU16::new(VAD_MAX_ENTRIES).expect("non-zero");
        options.threshold = VAD_THRESHOLD_DBFS;
        options.interval = VAD_INTERVAL_MS;
        router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| MediaError::Observer(format!("failed to create level observer: {e}")))
    }

    pub async fn attach_to_level_observer(
        &self,
        observer: &AudioLevelObserver,
        producer_id: ProducerId,
    ) -> MediaResult<()> {
        observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
            .map_err(|e| {
                MediaError::Observer(format!("failed to observe producer {producer_id}: {e}"))
            })
    }

    pub async fn create_webrtc_transport(
        &self,
        router: &Router,
    ) -> MediaResult<WebRtcTransport> {
        let transport = router
            .create_webrtc_transport(self.config.transport.to_transport_options())
            .await
            .map_err(|e| MediaError::Transport(format!("failed to create transport: {e}")))?;
        debug!("created transport {}", transport.id());
        Ok(transport)
    }

    pub async fn connect_transport(
        &self,
        transport: &WebRtcTransport,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| {
                MediaError::Transport(format!(
                    "failed to connect transport {}: {e}",
                    transport.id()
                ))
            })
    }

    pub async fn produce(
        &self,
        transport: &WebRtcTransport,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Producer> {
        transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("failed to produce: {e}")))
    }

    pub fn can_consume(
        &self,
        router: &Router,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        router.can_consume(producer_id, rtp_capabilities)
    }

    /// Consumes a producer on the peer's recv transport. Consumers start
    /// unpaused.
    pub async fn consume(
        &self,
        transport: &WebRtcTransport,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Consumer> {
        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = false;
        transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to consume {producer_id}: {e}")))
    }

    pub async fn pause_producer(&self, producer: &Producer) -> MediaResult<()> {
        producer
            .pause()
            .await
            .map_err(|e| MediaError::Producer(format!("failed to pause {}: {e}", producer.id())))
    }

    pub async fn resume_producer(&self, producer: &Producer) -> MediaResult<()> {
        producer
            .resume()
            .await
            .map_err(|e| MediaError::Producer(format!("failed to resume {}: {e}", producer.id())))
    }

    pub async fn pause_consumer(&self, consumer: &Consumer) -> MediaResult<()> {
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to pause {}: {e}", consumer.id())))
    }

    pub async fn resume_consumer(&self, consumer: &Consumer) -> MediaResult<()> {
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to resume {}: {e}", consumer.id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_worker_config() -> MediaConfig {
        MediaConfig {
            worker: WorkerConfig {
                num_workers: 1,
                ..WorkerConfig::default()
            },
            ..MediaConfig::default()
        }
    }

    #[tokio::test]
    async fn engine_starts_and_creates_a_router() {
        let engine = MediaEngine::new(single_worker_config()).await.unwrap();
        assert_eq!(engine.worker_count(), 1);

        let router = engine.create_router().await.unwrap();
        // the router advertises the Opus codec the rooms are configured with
        let caps = router.rtp_capabilities();
        assert!(!caps.codecs.is_empty());
    }

    #[tokio::test]
    async fn level_observer_and_transport_creation() {
        let engine = MediaEngine::new(single_worker_config()).await.unwrap();
        let router = engine.create_router().await.unwrap();

        let observer = engine.create_level_observer(&router).await;
        assert!(observer.is_ok());

        let transport = engine.create_webrtc_transport(&router).await.unwrap();
        assert!(!transport.ice_candidates().is_empty());
    }
}
