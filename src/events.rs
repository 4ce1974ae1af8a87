//! Typed notification channel.
//! Every subscriber owns an unbounded crossbeam receiver; `publish` never blocks
//! the producer thread. Order is FIFO per publishing thread.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel as cb;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::analysis::{AnalysisStatus, AnalysisType};
use crate::source::{HardwareType, InputSourceState};

/// Everything the core reports to the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    AnalysisDone {
        analysis_type: AnalysisType,
        status: AnalysisStatus,
    },
    SampleRateChanged {
        sample_rate: u32,
    },
    /// `length` is set when a file is loaded and `None` when a paused playback resumes.
    PlaybackStarted {
        length: Option<u64>,
        sample_rate: u32,
    },
    PlaybackProgress {
        position: u64,
        sample_rate: u32,
    },
    /// `completed` is false for a pause.
    PlaybackStopped {
        completed: bool,
    },
    RecordingStarted {
        path: PathBuf,
    },
    RecordingProgress {
        samples: u64,
        sample_rate: u32,
    },
    RecordingStopped {
        path: PathBuf,
        error: Option<String>,
    },
    UsbConnection {
        connected: bool,
    },
    UsbPermission {
        granted: bool,
    },
    UsbCommunication {
        active: bool,
    },
    HardwareTypeDetected {
        hardware_type: HardwareType,
    },
    AmModulationDetected {
        detected: bool,
    },
    InputSourceChanged {
        state: InputSourceState,
    },
    SourceFailed {
        state: InputSourceState,
        reason: String,
    },
}

/// Cloneable publish handle shared by every component of a session.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<cb::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> cb::Receiver<Event> {
        let (tx, rx) = cb::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        trace!(event = ?event, "event_published");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(Event::SampleRateChanged { sample_rate: 44_100 });
        bus.publish(Event::SampleRateChanged { sample_rate: 10_000 });

        for rx in [a, b] {
            assert_eq!(rx.try_recv().unwrap(), Event::SampleRateChanged { sample_rate: 44_100 });
            assert_eq!(rx.try_recv().unwrap(), Event::SampleRateChanged { sample_rate: 10_000 });
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::UsbConnection { connected: true });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), Event::UsbConnection { connected: true });
    }
}
