//! Spike recorder: bioelectric signal acquisition and spike-train analysis.
//! Library core: session wiring, input sources, sample pipeline, analyses.

pub mod analysis;
pub mod audio;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod repository;
pub mod source;
pub mod state_machine;

use std::sync::Arc;

use tracing::{info, warn};

use analysis::AnalysisCoordinator;
use audio::clock::SampleClock;
use audio::filters::InlineFilterChain;
use audio::ring_buffer::ProcessingBuffer;
use audio::SamplePipeline;
use config::SessionConfig;
use error::RepositoryError;
use events::EventBus;
use metrics::MetricsRegistry;
use repository::{AnalysisRepository, SqliteRepository};
use source::{DeviceSourceProvider, SourceProvider};
use state_machine::InputSourceManager;

/// Everything one recording session owns. Created at session start and torn
/// down with [`Session::shutdown`].
pub struct Session {
    pub config: SessionConfig,
    pub events: EventBus,
    pub metrics: Arc<MetricsRegistry>,
    pub pipeline: Arc<SamplePipeline>,
    pub sources: Arc<InputSourceManager>,
    pub analysis: Arc<AnalysisCoordinator>,
}

impl Session {
    /// Session configured from [`config::CONFIG_ENV_VAR`] (defaults when unset
    /// or unreadable), with tracing installed per its `log_json` flag.
    pub fn start_default() -> Result<Self, RepositoryError> {
        let loaded = SessionConfig::from_env();
        let config = match &loaded {
            Ok(Some(config)) => config.clone(),
            _ => SessionConfig::default(),
        };
        init_tracing(config.log_json);
        if let Err(e) = loaded {
            warn!(error = %e, "session config load failed, using defaults");
        }
        Self::start(config)
    }

    /// Session on the host audio devices, with the repository from `config`.
    pub fn start(config: SessionConfig) -> Result<Self, RepositoryError> {
        let provider = Arc::new(DeviceSourceProvider::new(config.acquisition.clone()));
        Self::with_provider(config, provider)
    }

    pub fn with_provider(config: SessionConfig, provider: Arc<dyn SourceProvider>) -> Result<Self, RepositoryError> {
        let repository: Arc<dyn AnalysisRepository> = match &config.database_path {
            Some(path) => Arc::new(SqliteRepository::open(path)?),
            None => Arc::new(SqliteRepository::open_in_memory()?),
        };
        Ok(Self::with_parts(config, provider, repository))
    }

    pub fn with_parts(
        config: SessionConfig,
        provider: Arc<dyn SourceProvider>,
        repository: Arc<dyn AnalysisRepository>,
    ) -> Self {
        let events = EventBus::new();
        let metrics = Arc::new(MetricsRegistry::new());

        let acquisition = &config.acquisition;
        let sample_rate = acquisition.microphone_sample_rate;
        let clock = Arc::new(SampleClock::new(sample_rate, 1));
        let buffer = Arc::new(ProcessingBuffer::new(acquisition.max_buffer_seconds, sample_rate, 1));
        let chain = InlineFilterChain::new(
            config.filters.clone(),
            config.am_detection.clone(),
            sample_rate,
            events.clone(),
        );
        let pipeline = Arc::new(SamplePipeline::new(
            acquisition.clone(),
            buffer,
            clock,
            chain,
            events.clone(),
            Arc::clone(&metrics),
        ));
        let sources = InputSourceManager::new(Arc::clone(&pipeline), provider, Arc::clone(&metrics));
        let analysis = Arc::new(AnalysisCoordinator::new(
            repository,
            config.analysis.clone(),
            events.clone(),
            Arc::clone(&metrics),
        ));

        info!(
            sample_rate,
            buffer_seconds = acquisition.max_buffer_seconds,
            persistent = config.database_path.is_some(),
            "session started"
        );
        Self {
            config,
            events,
            metrics,
            pipeline,
            sources,
            analysis,
        }
    }

    pub fn buffer(&self) -> &Arc<ProcessingBuffer> {
        self.pipeline.buffer()
    }

    pub fn clock(&self) -> &Arc<SampleClock> {
        self.pipeline.clock()
    }

    /// Stop the active source (finalizing any recording).
    pub fn shutdown(self) {
        self.sources.stop();
        info!(metrics = ?self.metrics.summary(), "session ended");
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `spike_recorder=debug` filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("spike_recorder=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_ok() {
        info!(json, "spike recorder tracing initialised");
    }
}
