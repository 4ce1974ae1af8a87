//! Load file → ensure spikes → run derived analysis.
//! The coordinator owns the one open [`AudioFile`], consults the repository for
//! spikes and trains, and caches the latest result of every derived analysis.
//! Loading a different file clears the cache and bumps the file generation;
//! results of tasks started before that are dropped when they finish.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    Analysis, AnalysisConfig, AnalysisListener, AnalysisStatus, AnalysisTask, AnalysisType, AutocorrelationAnalysis,
    AverageSpike, AverageSpikeAnalysis, CrossCorrelation, CrossCorrelationAnalysis, IsiAnalysis, SpikeFindingAnalysis,
    TrainHistogram,
};
use crate::audio::wav::AudioFile;
use crate::error::AnalysisError;
use crate::events::{Event, EventBus};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::repository::{
    AnalysisRepository, Spike, SpikeIndexValue, Threshold, ThresholdOrientation, Train, TrainIndices, TrainSpikes,
    TrainTimes,
};

#[derive(Default)]
struct ResultCache {
    generation: u64,
    autocorrelation: Vec<TrainHistogram>,
    isi: Vec<TrainHistogram>,
    cross_correlation: Vec<CrossCorrelation>,
    average_spikes: Vec<AverageSpike>,
}

impl ResultCache {
    fn reset(&mut self) {
        *self = Self {
            generation: self.generation + 1,
            ..Self::default()
        };
    }
}

/// State shared with running task listeners.
struct Shared {
    repository: Arc<dyn AnalysisRepository>,
    events: EventBus,
    metrics: Arc<MetricsRegistry>,
    cache: Mutex<ResultCache>,
    /// Files whose spikes are being found right now.
    finding: Mutex<HashSet<PathBuf>>,
}

impl Shared {
    fn publish(&self, analysis_type: AnalysisType, status: AnalysisStatus) {
        self.events.publish(Event::AnalysisDone { analysis_type, status });
    }
}

#[derive(Default)]
struct LoadedFile {
    path: Option<PathBuf>,
    file: Option<Arc<AudioFile>>,
}

pub struct AnalysisCoordinator {
    shared: Arc<Shared>,
    config: AnalysisConfig,
    loaded: Mutex<LoadedFile>,
}

impl AnalysisCoordinator {
    pub fn new(
        repository: Arc<dyn AnalysisRepository>,
        config: AnalysisConfig,
        events: EventBus,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                repository,
                events,
                metrics,
                cache: Mutex::new(ResultCache::default()),
                finding: Mutex::new(HashSet::new()),
            }),
            config,
            loaded: Mutex::new(LoadedFile::default()),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// The currently open file, if any.
    pub fn audio_file(&self) -> Option<Arc<AudioFile>> {
        self.loaded.lock().file.clone()
    }

    /// Make `path` the current file and return its cache generation.
    /// Switching files drops the open handle and every cached result.
    fn select(&self, path: &Path) -> u64 {
        let mut loaded = self.loaded.lock();
        let mut cache = self.shared.cache.lock();
        if loaded.path.as_deref() != Some(path) {
            debug!(path = %path.display(), "analysis file selected");
            loaded.path = Some(path.to_path_buf());
            loaded.file = None;
            cache.reset();
        }
        cache.generation
    }

    fn load(&self, path: &Path) -> Result<Arc<AudioFile>, AnalysisError> {
        self.select(path);
        let mut loaded = self.loaded.lock();
        if let Some(file) = &loaded.file {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(AudioFile::open(path)?);
        loaded.file = Some(Arc::clone(&file));
        Ok(file)
    }

    fn fail(&self, kind: AnalysisType, error: impl Into<AnalysisError>) -> AnalysisError {
        let error = error.into();
        warn!(analysis = %kind, error = %error, "analysis not started");
        self.shared.publish(kind, AnalysisStatus::Failed);
        error
    }

    fn unavailable(&self, kind: AnalysisType, what: &'static str) -> AnalysisError {
        debug!(analysis = %kind, missing = what, "analysis data unavailable");
        self.shared.publish(kind, AnalysisStatus::DataUnavailable);
        AnalysisError::DataUnavailable(what)
    }

    /// Detect and persist spikes for `path` unless the repository already
    /// holds them. `None` means nothing had to run: the spikes are stored, or
    /// an earlier call is still finding them.
    pub fn find_spikes(&self, path: &Path) -> Result<Option<JoinHandle<()>>, AnalysisError> {
        let kind = AnalysisType::FindSpikes;
        let file = self.load(path).map_err(|e| self.fail(kind, e))?;
        let mut finding = self.shared.finding.lock();
        if finding.contains(path) {
            debug!(path = %path.display(), "spikes already being found");
            return Ok(None);
        }
        let exists = self
            .shared
            .repository
            .spike_analysis_exists(path)
            .map_err(|e| self.fail(kind, e))?;
        if exists {
            debug!(path = %path.display(), "spikes already analysed");
            self.shared.publish(kind, AnalysisStatus::Completed);
            return Ok(None);
        }
        finding.insert(path.to_path_buf());
        drop(finding);

        let listener = SpikeListener {
            shared: Arc::clone(&self.shared),
            sample_rate: file.sample_rate(),
            started: Instant::now(),
        };
        let analysis = SpikeFindingAnalysis::new(file, self.config.spikes.clone());
        AnalysisTask::new(path, analysis).start(listener).map(Some).map_err(|e| {
            self.shared.finding.lock().remove(path);
            self.fail(kind, e)
        })
    }

    /// Start one analysis. Derived analyses need spike trains; without them
    /// the call reports [`AnalysisStatus::DataUnavailable`].
    pub fn start_analysis(&self, path: &Path, kind: AnalysisType) -> Result<Option<JoinHandle<()>>, AnalysisError> {
        let generation = self.select(path);
        let handle = match kind {
            AnalysisType::FindSpikes => return self.find_spikes(path),
            AnalysisType::Autocorrelation => {
                let trains = self.train_times(path, kind)?;
                let analysis = AutocorrelationAnalysis::new(trains, self.config.correlation.clone());
                self.run(path, generation, analysis, |cache, results| cache.autocorrelation = results)?
            }
            AnalysisType::Isi => {
                let trains = self.train_times(path, kind)?;
                let analysis = IsiAnalysis::new(trains, self.config.isi.clone());
                self.run(path, generation, analysis, |cache, results| cache.isi = results)?
            }
            AnalysisType::CrossCorrelation => {
                let trains = self.train_times(path, kind)?;
                let analysis = CrossCorrelationAnalysis::new(trains, self.config.correlation.clone());
                self.run(path, generation, analysis, |cache, results| cache.cross_correlation = results)?
            }
            AnalysisType::AverageSpike => {
                let file = self.load(path).map_err(|e| self.fail(kind, e))?;
                let trains = self.train_indices(path, kind)?;
                let analysis = AverageSpikeAnalysis::new(file, trains, self.config.average_spike.clone());
                self.run(path, generation, analysis, |cache, results| cache.average_spikes = results)?
            }
        };
        Ok(Some(handle))
    }

    fn train_times(&self, path: &Path, kind: AnalysisType) -> Result<Vec<TrainTimes>, AnalysisError> {
        let trains = self
            .shared
            .repository
            .spike_times_by_trains(path)
            .map_err(|e| self.fail(kind, e))?;
        if trains.is_empty() {
            return Err(self.unavailable(kind, "spike train"));
        }
        Ok(trains)
    }

    fn train_indices(&self, path: &Path, kind: AnalysisType) -> Result<Vec<TrainIndices>, AnalysisError> {
        let trains = self
            .shared
            .repository
            .spike_indices_by_trains(path)
            .map_err(|e| self.fail(kind, e))?;
        if trains.is_empty() {
            return Err(self.unavailable(kind, "spike train"));
        }
        Ok(trains)
    }

    /// Spawn `analysis`; its results are cached only while `generation` is current.
    fn run<A: Analysis>(
        &self,
        path: &Path,
        generation: u64,
        analysis: A,
        store: fn(&mut ResultCache, Vec<A::Output>),
    ) -> Result<JoinHandle<()>, AnalysisError> {
        let kind = analysis.analysis_type();
        let listener = CachingListener {
            shared: Arc::clone(&self.shared),
            kind,
            generation,
            started: Instant::now(),
            store,
        };
        AnalysisTask::new(path, analysis)
            .start(listener)
            .map_err(|e| self.fail(kind, e))
    }

    pub fn autocorrelation(&self) -> Vec<TrainHistogram> {
        self.shared.cache.lock().autocorrelation.clone()
    }

    pub fn isi(&self) -> Vec<TrainHistogram> {
        self.shared.cache.lock().isi.clone()
    }

    pub fn cross_correlation(&self) -> Vec<CrossCorrelation> {
        self.shared.cache.lock().cross_correlation.clone()
    }

    pub fn average_spikes(&self) -> Vec<AverageSpike> {
        self.shared.cache.lock().average_spikes.clone()
    }

    pub fn spike_analysis_exists(&self, path: &Path) -> Result<bool, AnalysisError> {
        Ok(self.shared.repository.spike_analysis_exists(path)?)
    }

    pub fn spikes_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<SpikeIndexValue>, AnalysisError> {
        Ok(self.shared.repository.spikes_for_range(path, channel, start, end)?)
    }

    /// Spikes of every train on `channel` with `start ≤ index < end`, by train order.
    pub fn spikes_by_trains_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<TrainSpikes>, AnalysisError> {
        Ok(self
            .shared
            .repository
            .spikes_by_trains_for_range(path, channel, start, end)?)
    }

    /// New train with zero thresholds on every channel. Returns its index.
    pub fn add_spike_train(&self, path: &Path, channel_count: u16) -> Result<u32, AnalysisError> {
        let order = self.shared.repository.add_spike_analysis_train(path, channel_count)?;
        info!(path = %path.display(), order, "spike train added");
        Ok(order)
    }

    pub fn remove_spike_train(&self, path: &Path, index: u32) -> Result<(), AnalysisError> {
        self.shared.repository.remove_spike_analysis_train(path, index)?;
        info!(path = %path.display(), order = index, "spike train removed");
        Ok(())
    }

    pub fn set_threshold(
        &self,
        path: &Path,
        channel: u16,
        index: u32,
        orientation: ThresholdOrientation,
        value: i32,
    ) -> Result<Train, AnalysisError> {
        Ok(self
            .shared
            .repository
            .save_spike_analysis_train(path, channel, index, orientation, value)?)
    }

    pub fn spike_trains(&self, path: &Path) -> Result<Vec<Train>, AnalysisError> {
        Ok(self.shared.repository.spike_analysis_trains(path)?)
    }

    /// Left/right handles of every train on `channel`, by train order.
    pub fn spike_train_thresholds(&self, path: &Path, channel: u16) -> Result<Vec<Threshold>, AnalysisError> {
        Ok(self
            .shared
            .repository
            .spike_analysis_trains_by_channel(path, channel)?
            .iter()
            .map(Train::threshold)
            .collect())
    }
}

fn metric_name(kind: AnalysisType) -> &'static str {
    match kind {
        AnalysisType::FindSpikes => metric_names::FIND_SPIKES,
        AnalysisType::Autocorrelation => metric_names::AUTOCORRELATION,
        AnalysisType::Isi => metric_names::ISI,
        AnalysisType::CrossCorrelation => metric_names::CROSS_CORRELATION,
        AnalysisType::AverageSpike => metric_names::AVERAGE_SPIKE,
    }
}

/// Persists detected spikes. Spikes are keyed by path, so they are stored
/// even when another file was loaded meanwhile.
struct SpikeListener {
    shared: Arc<Shared>,
    sample_rate: u32,
    started: Instant,
}

impl AnalysisListener<Spike> for SpikeListener {
    fn on_analysis_done(&self, path: &Path, results: Vec<Spike>) {
        let elapsed_us = self.started.elapsed().as_micros() as f64;
        self.shared.metrics.record(metric_names::FIND_SPIKES, elapsed_us);
        let saved = self.shared.repository.save_spike_analysis(path, self.sample_rate, &results);
        self.shared.finding.lock().remove(path);
        match saved {
            Ok(()) => {
                info!(path = %path.display(), spikes = results.len(), elapsed_us, "spikes_found");
                self.shared.publish(AnalysisType::FindSpikes, AnalysisStatus::Completed);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to store spikes");
                self.shared.publish(AnalysisType::FindSpikes, AnalysisStatus::Failed);
            }
        }
    }

    fn on_analysis_failed(&self, path: &Path, _error: AnalysisError) {
        self.shared.finding.lock().remove(path);
        self.shared.publish(AnalysisType::FindSpikes, AnalysisStatus::Failed);
    }
}

struct CachingListener<T> {
    shared: Arc<Shared>,
    kind: AnalysisType,
    generation: u64,
    started: Instant,
    store: fn(&mut ResultCache, Vec<T>),
}

impl<T: Send + 'static> AnalysisListener<T> for CachingListener<T> {
    fn on_analysis_done(&self, path: &Path, results: Vec<T>) {
        let elapsed_us = self.started.elapsed().as_micros() as f64;
        self.shared.metrics.record(metric_name(self.kind), elapsed_us);
        let count = results.len();
        {
            let mut cache = self.shared.cache.lock();
            if cache.generation != self.generation {
                debug!(analysis = %self.kind, path = %path.display(), "stale analysis result dropped");
                return;
            }
            (self.store)(&mut cache, results);
        }
        info!(analysis = %self.kind, path = %path.display(), results = count, elapsed_us, "analysis_done");
        self.shared.publish(self.kind, AnalysisStatus::Completed);
    }

    fn on_analysis_failed(&self, path: &Path, _error: AnalysisError) {
        if self.shared.cache.lock().generation != self.generation {
            debug!(analysis = %self.kind, path = %path.display(), "stale analysis failure dropped");
            return;
        }
        self.shared.publish(self.kind, AnalysisStatus::Failed);
    }
}
