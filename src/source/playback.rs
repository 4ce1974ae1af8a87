//! Replay of a recorded WAV file, paced at the file's own rate.
//! Batches carry their byte offset in the file so the ring buffer can line them
//! up with the file (and drop its window after a seek).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{InputSource, InputSourceState};
use crate::audio::clock::SampleClock;
use crate::audio::wav::AudioFile;
use crate::audio::SampleSink;
use crate::error::SourceError;
use crate::events::Event;

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Shared transport state between the manager and the playback thread.
/// Positions and lengths are in frames.
pub struct PlaybackControl {
    playing: AtomicBool,
    seeking: AtomicBool,
    position: AtomicU64,
    seek_request: Mutex<Option<u64>>,
    length: u64,
    sample_rate: u32,
}

impl PlaybackControl {
    fn new(length: u64, sample_rate: u32, playing: bool) -> Self {
        Self {
            playing: AtomicBool::new(playing),
            seeking: AtomicBool::new(false),
            position: AtomicU64::new(0),
            seek_request: Mutex::new(None),
            length,
            sample_rate,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Returns true when the state changed.
    pub fn set_playing(&self, play: bool) -> bool {
        self.playing.swap(play, Ordering::AcqRel) != play
    }

    /// Enter or leave scrub mode. While seeking the thread stops advancing on
    /// its own and only shows the batch ending at each seek target, unfiltered.
    /// Returns true when the state changed.
    pub fn set_seeking(&self, seeking: bool) -> bool {
        self.seeking.swap(seeking, Ordering::AcqRel) != seeking
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    /// Clamped to the file length. Applied by the playback thread before its next batch.
    pub fn seek(&self, frame: u64) {
        let frame = frame.min(self.length);
        *self.seek_request.lock() = Some(frame);
        self.position.store(frame, Ordering::Release);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn take_seek(&self) -> Option<u64> {
        self.seek_request.lock().take()
    }
}

pub struct PlaybackSource {
    path: PathBuf,
    file: Arc<AudioFile>,
    control: Arc<PlaybackControl>,
    batch_frames: usize,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackSource {
    pub fn open(path: &Path, batch_frames: usize, autoplay: bool) -> Result<Self, SourceError> {
        let file = AudioFile::open(path).map_err(|e| SourceError::File(format!("{}: {e}", path.display())))?;
        let control = Arc::new(PlaybackControl::new(file.frame_count(), file.sample_rate(), autoplay));
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
            control,
            batch_frames: batch_frames.max(1),
            handle: None,
        })
    }

    pub fn control(&self) -> Arc<PlaybackControl> {
        Arc::clone(&self.control)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InputSource for PlaybackSource {
    fn kind(&self) -> InputSourceState {
        InputSourceState::Playback
    }

    fn sample_rate(&self) -> u32 {
        self.file.sample_rate()
    }

    fn channels(&self) -> u16 {
        self.file.channels()
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), SourceError> {
        let file = Arc::clone(&self.file);
        let control = Arc::clone(&self.control);
        let batch_frames = self.batch_frames;
        sink.publish(Event::PlaybackStarted {
            length: Some(control.length()),
            sample_rate: control.sample_rate(),
        });
        let handle = std::thread::Builder::new()
            .name("playback-reader".into())
            .spawn(move || run_playback(&file, &control, batch_frames, &sink))
            .map_err(|e| SourceError::Backend(format!("failed to spawn playback thread: {e}")))?;
        self.handle = Some(handle);
        info!(path = %self.path.display(), "playback started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(path = %self.path.display(), "playback thread joined");
        }
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_playback(file: &AudioFile, control: &PlaybackControl, batch_frames: usize, sink: &SampleSink) {
    let rate = f64::from(file.sample_rate().max(1));
    let channels = u64::from(file.channels());
    let mut position = 0u64;
    let mut deadline: Option<Instant> = None;

    while sink.is_active() {
        if let Some(frame) = control.take_seek() {
            position = frame;
            deadline = None;
            if control.is_seeking() {
                if !show_seek_preview(file, frame, batch_frames, sink) {
                    return;
                }
                continue;
            }
        }
        if control.is_seeking() || !control.is_playing() {
            deadline = None;
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let samples = match file.read_frames(position, batch_frames) {
            Ok(samples) => samples,
            Err(e) => {
                sink.report_fault(SourceError::File(e.to_string()));
                return;
            }
        };
        if samples.is_empty() {
            control.set_playing(false);
            control.seek(0);
            sink.publish(Event::PlaybackStopped { completed: true });
            info!("playback reached end of file");
            continue;
        }

        let frames = samples.len() as u64 / channels;
        let end_byte = SampleClock::byte_count((position + frames) * channels);
        if !sink.push_at(&samples, end_byte) {
            break;
        }
        position += frames;
        control.position.store(position, Ordering::Release);
        sink.publish(Event::PlaybackProgress {
            position,
            sample_rate: control.sample_rate(),
        });

        let now = Instant::now();
        let batch = Duration::from_secs_f64(frames as f64 / rate);
        let next = deadline.unwrap_or(now) + batch;
        if next > now {
            std::thread::sleep(next - now);
        }
        deadline = Some(next);
    }
}

/// Buffer the frames ending at `frame` without pacing or filtering.
/// Returns false when the producer should exit.
fn show_seek_preview(file: &AudioFile, frame: u64, batch_frames: usize, sink: &SampleSink) -> bool {
    let start = frame.saturating_sub(batch_frames as u64);
    let samples = match file.read_frames(start, (frame - start) as usize) {
        Ok(samples) => samples,
        Err(e) => {
            sink.report_fault(SourceError::File(e.to_string()));
            return false;
        }
    };
    let end_byte = SampleClock::byte_count(frame * u64::from(file.channels()));
    debug!(frame, samples = samples.len(), "seek preview");
    samples.is_empty() || sink.push_preview_at(&samples, end_byte)
}
