//! Input source state machine: None ↔ Microphone | UsbSerial | Playback.
//! Exactly one source is active. Every transition stops the recording, stops
//! the previous source (blocking until its thread released the device), clears
//! the ring buffer and reconfigures the sample clock before the next source starts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::filters::FilterSettings;
use crate::audio::recorder::RecordingSummary;
use crate::audio::ring_buffer::ProcessingBuffer;
use crate::audio::{SamplePipeline, SampleProcessor, SampleSink};
use crate::cancellation::SourceGeneration;
use crate::error::{RecordingError, SourceError};
use crate::events::Event;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::source::playback::{PlaybackControl, PlaybackSource};
use crate::source::usb::{UsbDeviceInfo, UsbEvent};
use crate::source::{HardwareType, InputSource, InputSourceState, SourceFault, SourceProvider};

struct ActiveSource {
    state: InputSourceState,
    source: Option<Box<dyn InputSource>>,
    playback: Option<Arc<PlaybackControl>>,
    usb_device: Option<String>,
}

pub struct InputSourceManager {
    pipeline: Arc<SamplePipeline>,
    provider: Arc<dyn SourceProvider>,
    generations: SourceGeneration,
    /// Bumped by every start or stop request; a start whose preparation
    /// finished after a newer request is abandoned.
    requests: AtomicU64,
    active: Mutex<ActiveSource>,
    state_tx: watch::Sender<InputSourceState>,
    state_rx: watch::Receiver<InputSourceState>,
    faults: cb::Sender<SourceFault>,
    metrics: Arc<MetricsRegistry>,
}

impl InputSourceManager {
    /// Create the manager and its supervisor thread, which turns producer
    /// faults into an implicit `stop`.
    pub fn new(
        pipeline: Arc<SamplePipeline>,
        provider: Arc<dyn SourceProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(InputSourceState::None);
        let (faults, fault_rx) = cb::unbounded();
        let manager = Arc::new(Self {
            pipeline,
            provider,
            generations: SourceGeneration::new(),
            requests: AtomicU64::new(0),
            active: Mutex::new(ActiveSource {
                state: InputSourceState::None,
                source: None,
                playback: None,
                usb_device: None,
            }),
            state_tx,
            state_rx,
            faults,
            metrics,
        });

        let weak = Arc::downgrade(&manager);
        let spawned = std::thread::Builder::new()
            .name("source-supervisor".into())
            .spawn(move || supervise(weak, fault_rx));
        if let Err(e) = spawned {
            warn!(error = %e, "source supervisor not started, faults will not stop sources");
        }
        manager
    }

    pub fn state(&self) -> InputSourceState {
        self.active.lock().state
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<InputSourceState> {
        self.state_rx.clone()
    }

    pub fn buffer(&self) -> &Arc<ProcessingBuffer> {
        self.pipeline.buffer()
    }

    pub fn start_microphone(&self) -> Result<(), SourceError> {
        let source = self.provider.open_microphone()?;
        self.activate(source, None, None)
    }

    pub fn start_usb(&self, device_id: &str) -> Result<(), SourceError> {
        let source = self.provider.open_usb(device_id)?;
        self.activate(source, None, Some(device_id.to_string()))
    }

    /// Replay `path`. With `autoplay` false the file is loaded paused at frame 0.
    pub fn start_playback(&self, path: &Path, autoplay: bool) -> Result<(), SourceError> {
        let source = PlaybackSource::open(path, self.pipeline.config().playback_batch_frames, autoplay)?;
        let control = source.control();
        self.activate(Box::new(source), Some(control), None)
    }

    /// Deactivate the current source, if any.
    pub fn stop(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        if active.state == InputSourceState::None {
            return;
        }
        let from = active.state;
        self.deactivate(&mut active);
        self.set_state(&mut active, InputSourceState::None);
        info!(from = %from, to = %InputSourceState::None, "source_transition");
    }

    fn activate(
        &self,
        mut source: Box<dyn InputSource>,
        playback: Option<Arc<PlaybackControl>>,
        usb_device: Option<String>,
    ) -> Result<(), SourceError> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let to = source.kind();
        if let Err(e) = source.prepare(self.pipeline.events()) {
            warn!(source = %to, error = %e, "source not prepared");
            self.pipeline.events().publish(Event::SourceFailed {
                state: to,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let mut active = self.active.lock();
        if self.requests.load(Ordering::SeqCst) != request {
            debug!(source = %to, "source start superseded");
            return Err(SourceError::Superseded(to.to_string()));
        }
        let span = self.metrics.span(metric_names::SOURCE_SWITCH);
        let from = active.state;
        self.deactivate(&mut active);

        let clock = self.pipeline.clock();
        let previous_format = (clock.sample_rate(), clock.channels());
        self.pipeline.set_format(source.sample_rate(), source.channels());
        let guard = self.generations.cancel_and_advance();
        let sink = SampleSink::new(Arc::clone(&self.pipeline), guard, self.faults.clone());
        if let Err(e) = source.start(sink) {
            warn!(source = %to, error = %e, "source failed to start");
            self.generations.cancel_current();
            self.pipeline.set_format(previous_format.0, previous_format.1);
            self.pipeline.clear_buffer();
            self.set_state(&mut active, InputSourceState::None);
            self.pipeline.events().publish(Event::SourceFailed {
                state: to,
                reason: e.to_string(),
            });
            return Err(e);
        }

        active.source = Some(source);
        active.playback = playback;
        active.usb_device = usb_device;
        self.set_state(&mut active, to);
        let elapsed_us = span.finish();
        info!(from = %from, to = %to, elapsed_us, "source_transition");
        Ok(())
    }

    fn deactivate(&self, active: &mut ActiveSource) {
        self.pipeline.stop_recording();
        self.generations.cancel_current();
        if let Some(mut source) = active.source.take() {
            source.stop();
        }
        active.playback = None;
        active.usb_device = None;
        self.pipeline.clear_buffer();
    }

    fn set_state(&self, active: &mut ActiveSource, state: InputSourceState) {
        let changed = active.state != state;
        active.state = state;
        if changed {
            let _ = self.state_tx.send(state);
            self.pipeline.events().publish(Event::InputSourceChanged { state });
        }
    }

    fn handle_fault(&self, fault: SourceFault) {
        let mut active = self.active.lock();
        if fault.generation != self.generations.current_generation() || active.state == InputSourceState::None {
            debug!(generation = fault.generation, error = %fault.error, "ignoring fault from retired source");
            return;
        }
        let state = active.state;
        warn!(source = %state, error = %fault.error, "source failed, stopping");
        self.deactivate(&mut active);
        self.set_state(&mut active, InputSourceState::None);
        drop(active);
        self.pipeline.events().publish(Event::SourceFailed {
            state,
            reason: fault.error.to_string(),
        });
    }

    // Playback control

    /// Pause or resume playback. No-op outside playback.
    pub fn toggle_playback(&self, play: bool) {
        let Some(control) = self.active.lock().playback.clone() else {
            return;
        };
        if !control.set_playing(play) {
            return;
        }
        let event = if play {
            Event::PlaybackStarted {
                length: None,
                sample_rate: control.sample_rate(),
            }
        } else {
            Event::PlaybackStopped { completed: false }
        };
        self.pipeline.events().publish(event);
    }

    /// Move playback to `frame` (clamped to the file length).
    pub fn seek_playback(&self, frame: u64) {
        if let Some(control) = self.active.lock().playback.as_ref() {
            control.seek(frame);
        }
    }

    /// Enter scrub mode: pacing stops and every seek shows the unfiltered
    /// batch ending at its target. No-op outside playback.
    pub fn start_playback_seek(&self) {
        if let Some(control) = self.active.lock().playback.as_ref() {
            if control.set_seeking(true) {
                debug!("playback seek started");
            }
        }
    }

    /// Leave scrub mode; playback continues from the last seek target if playing.
    pub fn stop_playback_seek(&self) {
        if let Some(control) = self.active.lock().playback.as_ref() {
            if control.set_seeking(false) {
                debug!(position = control.position(), "playback seek ended");
            }
        }
    }

    pub fn is_seeking(&self) -> bool {
        self.active.lock().playback.as_ref().is_some_and(|c| c.is_seeking())
    }

    pub fn playback_progress(&self) -> u64 {
        self.active.lock().playback.as_ref().map_or(0, |c| c.position())
    }

    pub fn playback_length(&self) -> u64 {
        self.active.lock().playback.as_ref().map_or(0, |c| c.length())
    }

    pub fn is_playing(&self) -> bool {
        self.active.lock().playback.as_ref().is_some_and(|c| c.is_playing())
    }

    // Recording

    /// Record the active source, starting the microphone when nothing is active.
    pub fn start_recording(&self) -> Result<PathBuf, RecordingError> {
        match self.state() {
            InputSourceState::Playback => return Err(RecordingError::NotRecordable("playing back a file")),
            InputSourceState::None => self.start_microphone()?,
            InputSourceState::Microphone | InputSourceState::UsbSerial => {}
        }
        self.pipeline.start_recording()
    }

    pub fn stop_recording(&self) -> Option<RecordingSummary> {
        self.pipeline.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.pipeline.is_recording()
    }

    // USB

    pub fn handle_usb_event(&self, event: UsbEvent) {
        debug!(?event, "usb_event");
        let events = self.pipeline.events();
        match event {
            UsbEvent::Attached { .. } => events.publish(Event::UsbConnection { connected: true }),
            UsbEvent::Detached { device_id } => {
                if self.active_usb_device().as_deref() == Some(device_id.as_str()) {
                    self.stop();
                }
                events.publish(Event::UsbConnection { connected: false });
            }
            UsbEvent::PermissionGranted { .. } => events.publish(Event::UsbPermission { granted: true }),
            UsbEvent::PermissionDenied { .. } => events.publish(Event::UsbPermission { granted: false }),
            UsbEvent::DataTransferStarted { device_id } => {
                if self.active_usb_device().as_deref() != Some(device_id.as_str()) {
                    if let Err(e) = self.start_usb(&device_id) {
                        warn!(device = %device_id, error = %e, "USB start on data transfer failed");
                    }
                }
            }
            UsbEvent::DataTransferEnded { device_id } => {
                if self.active_usb_device().as_deref() == Some(device_id.as_str()) {
                    self.stop();
                }
            }
        }
    }

    pub fn usb_devices(&self) -> Vec<UsbDeviceInfo> {
        self.provider.usb_devices()
    }

    pub fn usb_device_count(&self) -> usize {
        self.usb_devices().len()
    }

    /// Hardware type of the active source (`Unknown` unless a USB board reported one).
    pub fn hardware_type(&self) -> HardwareType {
        self.active
            .lock()
            .source
            .as_ref()
            .map_or(HardwareType::Unknown, |s| s.hardware_type())
    }

    pub fn is_active_usb_of_type(&self, hardware_type: HardwareType) -> bool {
        self.state() == InputSourceState::UsbSerial && self.hardware_type() == hardware_type
    }

    fn active_usb_device(&self) -> Option<String> {
        self.active.lock().usb_device.clone()
    }

    // Filters

    /// Install a buffer-only stage after the inline filters.
    pub fn set_sample_processor(&self, processor: Box<dyn SampleProcessor>) {
        self.pipeline.set_sample_processor(processor);
    }

    pub fn clear_sample_processor(&self) {
        self.pipeline.clear_sample_processor();
    }

    pub fn set_filter_settings(&self, settings: FilterSettings) {
        self.pipeline.set_filter_settings(settings);
    }

    pub fn filter_settings(&self) -> FilterSettings {
        self.pipeline.filter_settings()
    }

    pub fn is_am_modulation_detected(&self) -> bool {
        self.pipeline.is_am_modulation_detected()
    }
}

impl Drop for InputSourceManager {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active.source.is_some() {
            self.deactivate(&mut active);
        }
    }
}

fn supervise(manager: Weak<InputSourceManager>, faults: cb::Receiver<SourceFault>) {
    for fault in faults.iter() {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_fault(fault);
    }
    debug!("source supervisor exiting");
}
