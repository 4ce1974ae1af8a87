//! Error types for the acquisition pipeline and the analysis engine.
//! One enum per concern; nothing here is fatal to the process.

use thiserror::Error;

/// Failures raised by an input source (microphone, USB, playback).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("permission denied for device {0}")]
    PermissionDenied(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("playback file error: {0}")]
    File(String),

    #[error("{0} start superseded by a later source change")]
    Superseded(String),
}

/// Failures of the recording writer. They abort the recording only.
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("no writable storage available: {0}")]
    StorageUnavailable(String),

    #[error("recording I/O error: {0}")]
    Io(String),

    #[error("WAV encoder error: {0}")]
    Wav(#[from] hound::Error),

    #[error("recording is not possible while {0}")]
    NotRecordable(&'static str),

    #[error("no input source to record: {0}")]
    Source(#[from] SourceError),

    #[error("recording writer thread failed to start: {0}")]
    Spawn(std::io::Error),
}

/// Failures loading or reading a WAV file.
#[derive(Error, Debug)]
pub enum AudioFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} tag not present")]
    MissingChunk(&'static str),

    #[error("fmt.ByteRate field inconsistent (header {actual}, expected {expected})")]
    InconsistentByteRate { actual: u32, expected: u64 },

    #[error("fmt.BlockAlign field inconsistent (header {actual}, expected {expected})")]
    InconsistentBlockAlign { actual: u16, expected: u32 },

    #[error("unsupported WAV format: {0}")]
    Unsupported(String),

    #[error("wav data ends before expected ({available} of {declared} bytes)")]
    Truncated { declared: u64, available: u64 },

    #[error("WAV decoder error: {0}")]
    Decoder(#[from] hound::Error),
}

/// Failures of the analysis framework and the coordinator.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("audio file error: {0}")]
    AudioFile(#[from] AudioFileError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("no {0} data available")]
    DataUnavailable(&'static str),

    #[error("invalid analysis input: {0}")]
    InvalidInput(String),

    #[error("analysis panicked: {0}")]
    Panicked(String),

    #[error("analysis thread failed to start: {0}")]
    Spawn(std::io::Error),
}

/// Failures of the spike/train persistence layer.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no spike analysis for {0}")]
    UnknownAnalysis(String),

    #[error("no spike train {order} on channel {channel:?}")]
    UnknownTrain { order: u32, channel: Option<u16> },
}

/// Failures loading the session configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
