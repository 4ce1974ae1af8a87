//! Sample pipeline: producer batch → inline filters → ring buffer → recorder.
//! Producers run on their own threads and hand batches to a [`SampleSink`];
//! every batch is written to the buffer under one lock so readers never see
//! half of it.

pub mod am;
pub mod clock;
pub mod filters;
pub mod recorder;
pub mod ring_buffer;
pub mod wav;

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::GenerationGuard;
use crate::config::AcquisitionConfig;
use crate::error::{RecordingError, SourceError};
use crate::events::{Event, EventBus};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::source::SourceFault;
use clock::SampleClock;
use filters::{FilterSettings, InlineFilterChain};
use recorder::{RecordingSummary, RecordingWriter};
use ring_buffer::ProcessingBuffer;

/// Extra stage between the inline filters and the ring buffer. Its output is
/// only buffered; recordings keep the filtered stream.
pub trait SampleProcessor: Send {
    fn process(&mut self, samples: &[i16]) -> Vec<i16>;
}

pub struct SamplePipeline {
    buffer: Arc<ProcessingBuffer>,
    clock: Arc<SampleClock>,
    chain: Mutex<InlineFilterChain>,
    processor: Mutex<Option<Box<dyn SampleProcessor>>>,
    recorder: Mutex<Option<RecordingWriter>>,
    events: EventBus,
    metrics: Arc<MetricsRegistry>,
    config: AcquisitionConfig,
}

impl SamplePipeline {
    pub fn new(
        config: AcquisitionConfig,
        buffer: Arc<ProcessingBuffer>,
        clock: Arc<SampleClock>,
        chain: InlineFilterChain,
        events: EventBus,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            buffer,
            clock,
            chain: Mutex::new(chain),
            processor: Mutex::new(None),
            recorder: Mutex::new(None),
            events,
            metrics,
            config,
        }
    }

    pub fn buffer(&self) -> &Arc<ProcessingBuffer> {
        &self.buffer
    }

    pub fn clock(&self) -> &Arc<SampleClock> {
        &self.clock
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Streamed batch (microphone, USB): filtered, buffered and recorded.
    pub fn push(&self, samples: &[i16]) {
        let span = self.metrics.span(metric_names::BATCH_PROCESSED);
        let filtered = self.chain.lock().process(samples);
        match self.processor.lock().as_mut() {
            Some(processor) => self.buffer.write(&processor.process(&filtered)),
            None => self.buffer.write(&filtered),
        }
        self.record(&filtered);
        span.finish();
    }

    /// Playback batch ending at `last_byte_position` in the file's sample data.
    pub fn push_at(&self, samples: &[i16], last_byte_position: u64) {
        let filtered = self.chain.lock().process(samples);
        match self.processor.lock().as_mut() {
            Some(processor) => self.buffer.write_at(&processor.process(&filtered), last_byte_position),
            None => self.buffer.write_at(&filtered, last_byte_position),
        }
    }

    /// Playback batch shown while scrubbing: buffered as read from the file,
    /// bypassing AM detection, the filters and the processor.
    pub fn push_preview_at(&self, samples: &[i16], last_byte_position: u64) {
        self.buffer.write_at(samples, last_byte_position);
    }

    pub fn set_sample_processor(&self, processor: Box<dyn SampleProcessor>) {
        debug!("sample processor set");
        *self.processor.lock() = Some(processor);
    }

    pub fn clear_sample_processor(&self) {
        debug!("sample processor cleared");
        *self.processor.lock() = None;
    }

    pub fn has_sample_processor(&self) -> bool {
        self.processor.lock().is_some()
    }

    /// Switch the stream format. The buffer and filter state start over.
    pub fn set_format(&self, sample_rate: u32, channels: u16) {
        if !self.clock.set_format(sample_rate, channels) {
            warn!(sample_rate, "ignoring zero sample rate");
            return;
        }
        self.buffer.resize(sample_rate, channels);
        self.chain.lock().set_sample_rate(sample_rate);
        self.events.publish(Event::SampleRateChanged { sample_rate });
    }

    pub fn clear_buffer(&self) {
        self.buffer.clear();
    }

    pub fn set_filter_settings(&self, settings: FilterSettings) {
        info!(?settings, "filter settings changed");
        self.chain.lock().set_settings(settings);
    }

    pub fn filter_settings(&self) -> FilterSettings {
        self.chain.lock().settings().clone()
    }

    pub fn is_am_modulation_detected(&self) -> bool {
        self.chain.lock().is_am_modulation_detected()
    }

    /// Start recording the stream at its current format. A no-op returning the
    /// current file when a recording is already running.
    pub fn start_recording(&self) -> Result<PathBuf, RecordingError> {
        if let Some(writer) = self.recorder.lock().as_ref() {
            return Ok(writer.path().to_path_buf());
        }
        let writer = RecordingWriter::new(
            &self.config.recordings_dir,
            self.clock.sample_rate(),
            self.clock.channels(),
            self.config.recording_queue_capacity,
            self.config.recording_queue_policy,
        )?;
        Ok(self.start_recording_with(writer))
    }

    /// Record into `writer`. A running recording is kept and `writer` is
    /// finalized unused.
    pub fn start_recording_with(&self, writer: RecordingWriter) -> PathBuf {
        let mut recorder = self.recorder.lock();
        if let Some(running) = recorder.as_ref() {
            return running.path().to_path_buf();
        }
        let path = writer.path().to_path_buf();
        *recorder = Some(writer);
        self.events.publish(Event::RecordingStarted { path: path.clone() });
        path
    }

    /// Finish the running recording, if any.
    pub fn stop_recording(&self) -> Option<RecordingSummary> {
        let writer = self.recorder.lock().take()?;
        let path = writer.path().to_path_buf();
        match writer.request_stop() {
            Ok(summary) => {
                info!(path = %path.display(), samples = summary.samples_written, overruns = summary.overruns, "recording stopped");
                self.events.publish(Event::RecordingStopped { path, error: None });
                Some(summary)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "recording did not finish cleanly");
                self.events.publish(Event::RecordingStopped {
                    path,
                    error: Some(e.to_string()),
                });
                None
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_some()
    }

    fn record(&self, samples: &[i16]) {
        let mut recorder = self.recorder.lock();
        let Some(writer) = recorder.as_mut() else {
            return;
        };
        let span = self.metrics.span(metric_names::RECORDING_ENQUEUE);
        let result = writer.write_audio(samples);
        span.finish();
        match result {
            Ok(()) => self.events.publish(Event::RecordingProgress {
                samples: writer.audio_length(),
                sample_rate: self.clock.sample_rate(),
            }),
            Err(e) => {
                warn!(error = %e, "recording write failed, stopping recording");
                if let Some(writer) = recorder.take() {
                    let path = writer.path().to_path_buf();
                    drop(writer);
                    self.events.publish(Event::RecordingStopped {
                        path,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }
}

/// Write handle given to the active producer. Writes from a retired producer
/// (older generation or cancelled token) are dropped.
#[derive(Clone)]
pub struct SampleSink {
    pipeline: Arc<SamplePipeline>,
    guard: GenerationGuard,
    faults: cb::Sender<SourceFault>,
}

impl SampleSink {
    pub fn new(pipeline: Arc<SamplePipeline>, guard: GenerationGuard, faults: cb::Sender<SourceFault>) -> Self {
        Self {
            pipeline,
            guard,
            faults,
        }
    }

    /// Returns false when the producer has been retired and should exit.
    pub fn push(&self, samples: &[i16]) -> bool {
        if !self.guard.should_continue() {
            return false;
        }
        self.pipeline.push(samples);
        true
    }

    pub fn push_at(&self, samples: &[i16], last_byte_position: u64) -> bool {
        if !self.guard.should_continue() {
            return false;
        }
        self.pipeline.push_at(samples, last_byte_position);
        true
    }

    pub fn push_preview_at(&self, samples: &[i16], last_byte_position: u64) -> bool {
        if !self.guard.should_continue() {
            return false;
        }
        self.pipeline.push_preview_at(samples, last_byte_position);
        true
    }

    /// Publish on behalf of the producer; dropped once it is retired.
    pub fn publish(&self, event: Event) {
        if self.guard.should_continue() {
            self.pipeline.events().publish(event);
        }
    }

    /// Hand a failure to the supervisor, which stops the source.
    pub fn report_fault(&self, error: SourceError) {
        let fault = SourceFault {
            generation: self.guard.my_generation(),
            error,
        };
        if self.faults.send(fault).is_err() {
            warn!("source supervisor gone, fault dropped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.guard.should_continue()
    }

    /// Unguarded bus, for notifications a producer sends while shutting down.
    pub fn events(&self) -> &EventBus {
        self.pipeline.events()
    }

    pub fn token(&self) -> &CancellationToken {
        self.guard.token()
    }

    pub fn clock(&self) -> &Arc<SampleClock> {
        self.pipeline.clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::am::AmDetectionConfig;
    use crate::cancellation::SourceGeneration;

    fn pipeline(dir: &str) -> Arc<SamplePipeline> {
        let config = AcquisitionConfig {
            recordings_dir: std::env::temp_dir().join(format!("spike_recorder_pipe_{}_{dir}", std::process::id())),
            ..Default::default()
        };
        let events = EventBus::new();
        let clock = Arc::new(SampleClock::new(10_000, 1));
        let buffer = Arc::new(ProcessingBuffer::new(1.0, 10_000, 1));
        let chain = InlineFilterChain::new(FilterSettings::default(), AmDetectionConfig::default(), 10_000, events.clone());
        Arc::new(SamplePipeline::new(config, buffer, clock, chain, events, Arc::new(MetricsRegistry::new())))
    }

    #[test]
    fn retired_sink_writes_are_dropped() {
        let pipeline = pipeline("retired");
        let generations = SourceGeneration::new();
        let (tx, _rx) = cb::unbounded();
        let old = SampleSink::new(Arc::clone(&pipeline), generations.cancel_and_advance(), tx.clone());
        assert!(old.push(&[1, 2, 3]));

        let current = SampleSink::new(Arc::clone(&pipeline), generations.cancel_and_advance(), tx);
        assert!(!old.push(&[9, 9]));
        assert!(current.push(&[4]));
        assert_eq!(pipeline.buffer().read_latest(10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn recording_progress_is_published() {
        let pipeline = pipeline("progress");
        let rx = pipeline.events().subscribe();
        let path = pipeline.start_recording().unwrap();
        assert_eq!(pipeline.start_recording().unwrap(), path);

        pipeline.push(&[0; 100]);
        pipeline.push(&[0; 100]);
        let summary = pipeline.stop_recording().unwrap();
        assert_eq!(summary.samples_written, 200);
        assert!(!pipeline.is_recording());

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.first(), Some(&Event::RecordingStarted { path: path.clone() }));
        assert!(events.contains(&Event::RecordingProgress { samples: 200, sample_rate: 10_000 }));
        assert_eq!(events.last(), Some(&Event::RecordingStopped { path, error: None }));
        let _ = std::fs::remove_dir_all(&pipeline.config().recordings_dir);
    }

    struct Doubler;

    impl SampleProcessor for Doubler {
        fn process(&mut self, samples: &[i16]) -> Vec<i16> {
            samples.iter().map(|s| s.saturating_mul(2)).collect()
        }
    }

    #[test]
    fn processor_output_is_buffered_but_not_recorded() {
        let pipeline = pipeline("processor");
        pipeline.set_sample_processor(Box::new(Doubler));
        let path = pipeline.start_recording().unwrap();
        pipeline.push(&[3, -4]);
        assert_eq!(pipeline.buffer().read_latest(2), vec![6, -8]);

        pipeline.clear_sample_processor();
        assert!(!pipeline.has_sample_processor());
        pipeline.push(&[5]);
        assert_eq!(pipeline.buffer().read_latest(1), vec![5]);

        pipeline.stop_recording().unwrap();
        let recorded = wav::AudioFile::open(&path).unwrap().read_frames(0, 10).unwrap();
        assert_eq!(recorded, vec![3, -4, 5]);
        let _ = std::fs::remove_dir_all(&pipeline.config().recordings_dir);
    }

    #[test]
    fn format_change_resizes_and_announces() {
        let pipeline = pipeline("format");
        let rx = pipeline.events().subscribe();
        pipeline.push(&[1; 50]);
        pipeline.set_format(44_100, 2);
        assert!(pipeline.buffer().is_empty());
        assert_eq!(pipeline.buffer().capacity(), 88_200);
        assert_eq!(rx.try_recv().unwrap(), Event::SampleRateChanged { sample_rate: 44_100 });
    }
}
