//! Microphone capture via cpal.
//! The stream is built on the reader thread and lives there until `stop`; the
//! cpal callback pushes each batch straight into the sink.

use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel as cb;
use tracing::{error, info};

use super::{InputSource, InputSourceState};
use crate::audio::SampleSink;
use crate::error::SourceError;

const STOP_POLL: Duration = Duration::from_millis(100);

pub struct CpalMicrophone {
    sample_rate: u32,
    channels: u16,
    stop_tx: Option<cb::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            stop_tx: None,
            handle: None,
        }
    }
}

impl InputSource for CpalMicrophone {
    fn kind(&self) -> InputSourceState {
        InputSourceState::Microphone
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), SourceError> {
        let (ready_tx, ready_rx) = cb::bounded::<Result<(), SourceError>>(1);
        let (stop_tx, stop_rx) = cb::bounded::<()>(1);
        let sample_rate = self.sample_rate;
        let channels = self.channels;

        let handle = std::thread::Builder::new()
            .name("microphone-reader".into())
            .spawn(move || {
                let stream = match open_stream(sample_rate, channels, sink.clone()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                loop {
                    match stop_rx.recv_timeout(STOP_POLL) {
                        Err(cb::RecvTimeoutError::Timeout) if !sink.token().is_cancelled() => continue,
                        _ => break,
                    }
                }
                drop(stream);
                info!("microphone capture stream closed");
            })
            .map_err(|e| SourceError::Backend(format!("failed to spawn microphone thread: {e}")))?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(SourceError::Backend("microphone thread exited early".into())));
        match started {
            Ok(()) => {
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(sample_rate: u32, channels: u16, sink: SampleSink) -> Result<cpal::Stream, SourceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SourceError::DeviceUnavailable("no audio input device available".into()))?;

    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let fault_sink = sink.clone();
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                sink.push(data);
            },
            move |err| {
                error!(error = %err, "audio capture error");
                let reason = err.to_string();
                fault_sink.report_fault(match err {
                    cpal::StreamError::DeviceNotAvailable => SourceError::Disconnected(reason),
                    _ => SourceError::Backend(reason),
                });
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => SourceError::DeviceUnavailable(e.to_string()),
            other => SourceError::Backend(format!("failed to build input stream: {other}")),
        })?;

    stream
        .play()
        .map_err(|e| SourceError::Backend(format!("failed to start audio stream: {e}")))?;
    info!(sample_rate, channels, "microphone capture stream started");

    Ok(stream)
}
