//! Recording writer: producer threads enqueue batches into a bounded queue and a
//! dedicated writer thread encodes them into a 16-bit PCM WAV file.
//! `hound` patches the RIFF and `data` length fields when the writer is finalized.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::RecordingError;

/// What `write_audio` does when the writer thread falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueueFullPolicy {
    /// Wait for room; no sample is ever lost.
    #[default]
    Block,
    /// Drop the incoming batch and count an overrun.
    DropNewest,
}

/// Outcome of a finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub samples_written: u64,
    pub overruns: u64,
}

type WriterResult = Result<u64, RecordingError>;

pub struct RecordingWriter {
    path: PathBuf,
    sample_rate: u32,
    tx: Option<cb::Sender<Vec<i16>>>,
    handle: Option<JoinHandle<WriterResult>>,
    policy: QueueFullPolicy,
    /// Samples accepted into the queue.
    queued: u64,
    overruns: u64,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingWriter {
    /// Create `dir` if needed, open a new timestamped file in it and start the writer thread.
    pub fn new(
        dir: &Path,
        sample_rate: u32,
        channels: u16,
        queue_capacity: usize,
        policy: QueueFullPolicy,
    ) -> Result<Self, RecordingError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| RecordingError::StorageUnavailable(format!("{}: {e}", dir.display())))?;
        let path = dir.join(recording_file_name());
        let file = File::create(&path)
            .map_err(|e| RecordingError::StorageUnavailable(format!("{}: {e}", path.display())))?;
        Self::with_output(path, BufWriter::new(file), sample_rate, channels, queue_capacity, policy)
    }

    /// Record into any seekable output. `path` names the recording in events
    /// and the summary.
    pub fn with_output<W>(
        path: PathBuf,
        output: W,
        sample_rate: u32,
        channels: u16,
        queue_capacity: usize,
        policy: QueueFullPolicy,
    ) -> Result<Self, RecordingError>
    where
        W: Write + Seek + Send + 'static,
    {
        let spec = hound::WavSpec {
            channels: channels.max(1),
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::new(output, spec)?;

        let (tx, rx) = cb::bounded::<Vec<i16>>(queue_capacity.max(1));
        let failure = Arc::new(Mutex::new(None));
        let thread_failure = Arc::clone(&failure);
        let thread_path = path.clone();
        let handle = std::thread::Builder::new()
            .name("recording-writer".into())
            .spawn(move || drain_queue(writer, rx, thread_failure, thread_path))
            .map_err(RecordingError::Spawn)?;

        info!(path = %path.display(), sample_rate, channels, "recording started");
        Ok(Self {
            path,
            sample_rate,
            tx: Some(tx),
            handle: Some(handle),
            policy,
            queued: 0,
            overruns: 0,
            failure,
        })
    }

    /// Queue a batch for writing. Fails once the writer thread has hit an I/O error.
    pub fn write_audio(&mut self, samples: &[i16]) -> Result<(), RecordingError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(RecordingError::Io(reason));
        }
        if samples.is_empty() {
            return Ok(());
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(RecordingError::Io("recording already stopped".into()));
        };
        match enqueue(tx, samples.to_vec(), self.policy) {
            Enqueued::Accepted => {
                self.queued += samples.len() as u64;
                Ok(())
            }
            Enqueued::Dropped => {
                self.overruns += 1;
                warn!(overruns = self.overruns, dropped = samples.len(), "recording queue full, batch dropped");
                Ok(())
            }
            Enqueued::Closed => {
                let reason = self
                    .failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "recording writer stopped".into());
                Err(RecordingError::Io(reason))
            }
        }
    }

    /// Samples accepted so far.
    pub fn audio_length(&self) -> u64 {
        self.queued
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Drain the queue, finalize the header and close the file.
    pub fn request_stop(mut self) -> Result<RecordingSummary, RecordingError> {
        let samples_written = self.finish()?;
        Ok(RecordingSummary {
            path: self.path.clone(),
            samples_written,
            overruns: self.overruns,
        })
    }

    fn finish(&mut self) -> WriterResult {
        drop(self.tx.take());
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(RecordingError::Io("recording writer thread panicked".into())),
        }
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.finish() {
                error!(path = %self.path.display(), error = %e, "recording finalize failed");
            }
        }
    }
}

enum Enqueued {
    Accepted,
    Dropped,
    Closed,
}

fn enqueue(tx: &cb::Sender<Vec<i16>>, batch: Vec<i16>, policy: QueueFullPolicy) -> Enqueued {
    match policy {
        QueueFullPolicy::Block => match tx.send(batch) {
            Ok(()) => Enqueued::Accepted,
            Err(_) => Enqueued::Closed,
        },
        QueueFullPolicy::DropNewest => match tx.try_send(batch) {
            Ok(()) => Enqueued::Accepted,
            Err(cb::TrySendError::Full(_)) => Enqueued::Dropped,
            Err(cb::TrySendError::Disconnected(_)) => Enqueued::Closed,
        },
    }
}

fn drain_queue<W: Write + Seek>(
    mut writer: hound::WavWriter<W>,
    rx: cb::Receiver<Vec<i16>>,
    failure: Arc<Mutex<Option<String>>>,
    path: PathBuf,
) -> WriterResult {
    let mut written = 0u64;
    for batch in rx.iter() {
        let mut batch_writer = writer.get_i16_writer(batch.len() as u32);
        for &sample in &batch {
            batch_writer.write_sample(sample);
        }
        if let Err(e) = batch_writer.flush() {
            error!(path = %path.display(), error = %e, "recording write failed");
            *failure.lock() = Some(e.to_string());
            return Err(RecordingError::Wav(e));
        }
        written += batch.len() as u64;
    }
    writer.finalize()?;
    debug!(path = %path.display(), samples = written, "recording finalized");
    Ok(written)
}

fn recording_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("BYB_Recording_{millis}.wav")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::{AudioFile, WavHeader};

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spike_recorder_rec_{}_{name}", std::process::id()))
    }

    #[test]
    fn recording_patches_data_length() {
        let dir = temp_dir("lengths");
        let mut writer = RecordingWriter::new(&dir, 10_000, 1, 4, QueueFullPolicy::Block).unwrap();
        for i in 0..3 {
            writer.write_audio(&[i as i16; 100]).unwrap();
        }
        assert_eq!(writer.audio_length(), 300);
        let summary = writer.request_stop().unwrap();
        assert_eq!(summary.samples_written, 300);
        assert_eq!(summary.overruns, 0);

        let mut file = File::open(&summary.path).unwrap();
        let header = WavHeader::read_from(&mut file).unwrap();
        assert_eq!(header.data_len, 600);
        assert_eq!(header.sample_rate, 10_000);

        let audio = AudioFile::open(&summary.path).unwrap();
        assert_eq!(audio.read_frames(100, 1).unwrap(), vec![1]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dropping_the_writer_still_finalizes() {
        let dir = temp_dir("drop");
        let path = {
            let mut writer = RecordingWriter::new(&dir, 44_100, 2, 4, QueueFullPolicy::Block).unwrap();
            writer.write_audio(&[7; 64]).unwrap();
            writer.path().to_path_buf()
        };
        let audio = AudioFile::open(&path).unwrap();
        assert_eq!(audio.frame_count(), 32);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unwritable_directory_is_storage_unavailable() {
        let blocker = temp_dir("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let err = RecordingWriter::new(&blocker.join("sub"), 10_000, 1, 4, QueueFullPolicy::Block)
            .err()
            .unwrap();
        assert!(matches!(err, RecordingError::StorageUnavailable(_)));
        let _ = std::fs::remove_file(&blocker);
    }

    #[test]
    fn drop_newest_discards_when_full() {
        let (tx, _rx) = cb::bounded(1);
        assert!(matches!(enqueue(&tx, vec![1], QueueFullPolicy::DropNewest), Enqueued::Accepted));
        assert!(matches!(enqueue(&tx, vec![2], QueueFullPolicy::DropNewest), Enqueued::Dropped));
    }

    #[test]
    fn closed_queue_is_reported() {
        let (tx, rx) = cb::bounded::<Vec<i16>>(1);
        drop(rx);
        assert!(matches!(enqueue(&tx, vec![1], QueueFullPolicy::Block), Enqueued::Closed));
    }
}
