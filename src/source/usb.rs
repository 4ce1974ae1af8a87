//! USB-serial SpikerBox input.
//! The platform transport (enumeration, permission, serial I/O) sits behind
//! [`UsbTransport`] / [`UsbConnection`]; this module owns the reader thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HardwareType, InputSource, InputSourceState};
use crate::audio::SampleSink;
use crate::error::SourceError;
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDeviceInfo {
    pub id: String,
    pub hardware_type: HardwareType,
}

/// Out-of-band notifications from the platform USB layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Attached { device_id: String },
    Detached { device_id: String },
    PermissionGranted { device_id: String },
    PermissionDenied { device_id: String },
    DataTransferStarted { device_id: String },
    DataTransferEnded { device_id: String },
}

pub trait UsbTransport: Send + Sync {
    fn devices(&self) -> Vec<UsbDeviceInfo>;

    fn device_count(&self) -> usize {
        self.devices().len()
    }

    /// Blocks until the user answers. `Ok(false)` means denied.
    fn request_permission(&self, device_id: &str) -> Result<bool, SourceError>;

    fn open(&self, device_id: &str) -> Result<Box<dyn UsbConnection>, SourceError>;
}

/// Open serial connection to one board.
pub trait UsbConnection: Send {
    /// Type reported during enumeration, if any.
    fn known_hardware_type(&self) -> Option<HardwareType>;

    /// Query the board. May take a while; runs on the reader thread and must
    /// return soon after `cancel` fires.
    fn detect_hardware_type(&mut self, cancel: &CancellationToken) -> Result<HardwareType, SourceError>;

    fn start_transfer(&mut self) -> Result<(), SourceError>;

    /// Next batch of samples. An empty batch means nothing arrived within the
    /// transport's poll interval; an error means the device is gone.
    fn read_samples(&mut self) -> Result<Vec<i16>, SourceError>;

    fn pause(&mut self);

    fn resume(&mut self);

    fn close(&mut self);
}

pub struct UsbSerialSource {
    transport: Arc<dyn UsbTransport>,
    device_id: String,
    sample_rate: u32,
    hardware_type: Arc<Mutex<HardwareType>>,
    permitted: bool,
    handle: Option<JoinHandle<()>>,
}

impl UsbSerialSource {
    pub fn new(transport: Arc<dyn UsbTransport>, device_id: &str, sample_rate: u32) -> Self {
        Self {
            transport,
            device_id: device_id.to_string(),
            sample_rate,
            hardware_type: Arc::new(Mutex::new(HardwareType::Unknown)),
            permitted: false,
            handle: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl InputSource for UsbSerialSource {
    fn kind(&self) -> InputSourceState {
        InputSourceState::UsbSerial
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn hardware_type(&self) -> HardwareType {
        *self.hardware_type.lock()
    }

    fn prepare(&mut self, events: &EventBus) -> Result<(), SourceError> {
        let granted = self.transport.request_permission(&self.device_id)?;
        events.publish(Event::UsbPermission { granted });
        if !granted {
            return Err(SourceError::PermissionDenied(self.device_id.clone()));
        }
        self.permitted = true;
        Ok(())
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), SourceError> {
        if !self.permitted {
            self.prepare(sink.events())?;
        }

        let mut connection = self.transport.open(&self.device_id)?;
        let known = connection.known_hardware_type().filter(|hw| *hw != HardwareType::Unknown);
        if let Some(hardware_type) = known {
            *self.hardware_type.lock() = hardware_type;
            sink.publish(Event::HardwareTypeDetected { hardware_type });
        }

        if let Err(e) = connection.start_transfer() {
            connection.close();
            return Err(e);
        }
        sink.publish(Event::UsbCommunication { active: true });

        let hardware_type = Arc::clone(&self.hardware_type);
        let device_id = self.device_id.clone();
        let handle = std::thread::Builder::new()
            .name("usb-reader".into())
            .spawn(move || {
                if known.is_none() {
                    let detected = connection.detect_hardware_type(sink.token()).unwrap_or_else(|e| {
                        warn!(device = %device_id, error = %e, "hardware type detection failed");
                        HardwareType::Unknown
                    });
                    if sink.is_active() {
                        *hardware_type.lock() = detected;
                        sink.publish(Event::HardwareTypeDetected { hardware_type: detected });
                    }
                }
                if sink.is_active() {
                    connection.resume();
                    if read_loop(connection.as_mut(), &sink, &device_id) {
                        connection.pause();
                    }
                }
                connection.close();
                sink.events().publish(Event::UsbCommunication { active: false });
            })
            .map_err(|e| SourceError::Backend(format!("failed to spawn USB reader thread: {e}")))?;
        self.handle = Some(handle);
        info!(device = %self.device_id, "USB communication started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!(device = %self.device_id, "USB communication ended");
        }
    }
}

impl Drop for UsbSerialSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns false when the device failed rather than being retired.
fn read_loop(connection: &mut dyn UsbConnection, sink: &SampleSink, device_id: &str) -> bool {
    while sink.is_active() {
        match connection.read_samples() {
            Ok(samples) if samples.is_empty() => continue,
            Ok(samples) => {
                if !sink.push(&samples) {
                    break;
                }
            }
            Err(e) => {
                debug!(device = %device_id, error = %e, "USB read failed");
                sink.report_fault(e);
                return false;
            }
        }
    }
    true
}
