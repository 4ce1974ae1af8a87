//! Offline analyses over recorded files.
//! Every analysis runs once, on its own thread, and reports either its results
//! or an error; there is no retry and no cancellation.

pub mod average_spike;
pub mod coordinator;
pub mod correlation;
pub mod isi;
pub mod spikes;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as cb;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AnalysisError;

pub use average_spike::{AverageSpike, AverageSpikeAnalysis, AverageSpikeConfig};
pub use coordinator::AnalysisCoordinator;
pub use correlation::{AutocorrelationAnalysis, CorrelationConfig, CrossCorrelation, CrossCorrelationAnalysis};
pub use isi::{IsiAnalysis, IsiConfig};
pub use spikes::{SpikeFindingAnalysis, SpikeFindingConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisType {
    FindSpikes,
    Autocorrelation,
    Isi,
    CrossCorrelation,
    AverageSpike,
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisType::FindSpikes => write!(f, "find-spikes"),
            AnalysisType::Autocorrelation => write!(f, "autocorrelation"),
            AnalysisType::Isi => write!(f, "isi"),
            AnalysisType::CrossCorrelation => write!(f, "cross-correlation"),
            AnalysisType::AverageSpike => write!(f, "average-spike"),
        }
    }
}

/// Outcome reported with every finished analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnalysisStatus {
    Completed,
    Failed,
    /// The prerequisite (spikes, trains) does not exist yet.
    DataUnavailable,
}

/// One train on one channel, as stored by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrainId {
    pub order: u32,
    pub channel: u16,
}

/// Per-train histogram (autocorrelation, ISI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainHistogram {
    pub train: TrainId,
    pub counts: Vec<u32>,
}

/// Tunables of every analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalysisConfig {
    pub spikes: SpikeFindingConfig,
    pub correlation: CorrelationConfig,
    pub isi: IsiConfig,
    pub average_spike: AverageSpikeConfig,
}

/// A one-shot computation producing a list of results.
pub trait Analysis: Send + 'static {
    type Output: Send + 'static;

    fn analysis_type(&self) -> AnalysisType;

    fn process(&mut self) -> Result<Vec<Self::Output>, AnalysisError>;
}

/// Receives the outcome of an [`AnalysisTask`] on the task's thread.
pub trait AnalysisListener<T>: Send + 'static {
    fn on_analysis_done(&self, path: &Path, results: Vec<T>);

    fn on_analysis_failed(&self, path: &Path, error: AnalysisError);
}

pub struct AnalysisTask<A: Analysis> {
    path: PathBuf,
    analysis: A,
}

impl<A: Analysis> AnalysisTask<A> {
    pub fn new(path: impl Into<PathBuf>, analysis: A) -> Self {
        Self {
            path: path.into(),
            analysis,
        }
    }

    /// Run on a new named thread and report to `listener`. A panic inside
    /// `process` is reported as a failure.
    pub fn start<L>(self, listener: L) -> Result<JoinHandle<()>, AnalysisError>
    where
        L: AnalysisListener<A::Output>,
    {
        let Self { path, mut analysis } = self;
        let kind = analysis.analysis_type();
        std::thread::Builder::new()
            .name(format!("analysis-{kind}"))
            .spawn(move || {
                debug!(analysis = %kind, path = %path.display(), "analysis started");
                match run_catching(&mut analysis) {
                    Ok(results) => listener.on_analysis_done(&path, results),
                    Err(e) => {
                        warn!(analysis = %kind, path = %path.display(), error = %e, "analysis failed");
                        listener.on_analysis_failed(&path, e);
                    }
                }
            })
            .map_err(AnalysisError::Spawn)
    }

    /// Run on a new thread and hand back a single-shot result handle.
    pub fn spawn(self) -> Result<AnalysisHandle<A::Output>, AnalysisError> {
        let (tx, rx) = cb::bounded(1);
        self.start(ChannelListener { tx })?;
        Ok(AnalysisHandle { rx })
    }
}

fn run_catching<A: Analysis>(analysis: &mut A) -> Result<Vec<A::Output>, AnalysisError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| analysis.process())) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(AnalysisError::Panicked(message))
        }
    }
}

type TaskResult<T> = Result<Vec<T>, AnalysisError>;

struct ChannelListener<T> {
    tx: cb::Sender<TaskResult<T>>,
}

impl<T: Send + 'static> AnalysisListener<T> for ChannelListener<T> {
    fn on_analysis_done(&self, _path: &Path, results: Vec<T>) {
        let _ = self.tx.send(Ok(results));
    }

    fn on_analysis_failed(&self, _path: &Path, error: AnalysisError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Single-shot receiver for a spawned analysis.
pub struct AnalysisHandle<T> {
    rx: cb::Receiver<TaskResult<T>>,
}

impl<T> AnalysisHandle<T> {
    pub fn wait(self) -> TaskResult<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(AnalysisError::Panicked("analysis thread exited without a result".into())))
    }

    /// `None` when the analysis has not finished within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(cb::RecvTimeoutError::Timeout) => None,
            Err(cb::RecvTimeoutError::Disconnected) => Some(Err(AnalysisError::Panicked(
                "analysis thread exited without a result".into(),
            ))),
        }
    }
}
