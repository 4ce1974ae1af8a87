//! Input sources. Exactly one is active at a time; the
//! [`InputSourceManager`](crate::state_machine::InputSourceManager) owns it.
//! Every source runs its producer on a dedicated thread and writes through a
//! [`SampleSink`].

pub mod microphone;
pub mod playback;
pub mod usb;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::SampleSink;
use crate::config::AcquisitionConfig;
use crate::error::SourceError;
use crate::events::EventBus;
use microphone::CpalMicrophone;
use usb::{UsbDeviceInfo, UsbSerialSource, UsbTransport};

/// Which source feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputSourceState {
    None,
    Microphone,
    UsbSerial,
    Playback,
}

impl std::fmt::Display for InputSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSourceState::None => write!(f, "None"),
            InputSourceState::Microphone => write!(f, "Microphone"),
            InputSourceState::UsbSerial => write!(f, "UsbSerial"),
            InputSourceState::Playback => write!(f, "Playback"),
        }
    }
}

/// SpikerBox board models reported by USB devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HardwareType {
    #[default]
    Unknown,
    Plant,
    Muscle,
    HeartAndBrain,
    MusclePro,
    NeuronPro,
}

impl HardwareType {
    /// Numeric code used by the board firmware (`-1` for unknown).
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => HardwareType::Plant,
            1 => HardwareType::Muscle,
            2 => HardwareType::HeartAndBrain,
            3 => HardwareType::MusclePro,
            4 => HardwareType::NeuronPro,
            _ => HardwareType::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            HardwareType::Unknown => -1,
            HardwareType::Plant => 0,
            HardwareType::Muscle => 1,
            HardwareType::HeartAndBrain => 2,
            HardwareType::MusclePro => 3,
            HardwareType::NeuronPro => 4,
        }
    }
}

/// Failure reported by a producer thread, tagged with the generation it ran under.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFault {
    pub generation: u64,
    pub error: SourceError,
}

pub trait InputSource: Send {
    fn kind(&self) -> InputSourceState;

    /// Stream rate the pipeline is configured with before `start`.
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16 {
        1
    }

    fn hardware_type(&self) -> HardwareType {
        HardwareType::Unknown
    }

    /// Blocking setup run before the manager commits to the switch, outside
    /// its lock (a permission prompt, for one).
    fn prepare(&mut self, _events: &EventBus) -> Result<(), SourceError> {
        Ok(())
    }

    /// Acquire the device and start the producer thread.
    fn start(&mut self, sink: SampleSink) -> Result<(), SourceError>;

    /// Stop producing. Returns once the producer thread has released the device.
    fn stop(&mut self);
}

/// Opens device-backed sources. Playback is file-backed and opened by the manager.
pub trait SourceProvider: Send + Sync {
    fn open_microphone(&self) -> Result<Box<dyn InputSource>, SourceError>;

    fn open_usb(&self, device_id: &str) -> Result<Box<dyn InputSource>, SourceError>;

    fn usb_devices(&self) -> Vec<UsbDeviceInfo> {
        Vec::new()
    }
}

/// Default provider: cpal microphone plus an optional USB transport.
pub struct DeviceSourceProvider {
    config: AcquisitionConfig,
    usb: Option<Arc<dyn UsbTransport>>,
}

impl DeviceSourceProvider {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config, usb: None }
    }

    pub fn with_usb_transport(mut self, transport: Arc<dyn UsbTransport>) -> Self {
        self.usb = Some(transport);
        self
    }
}

impl SourceProvider for DeviceSourceProvider {
    fn open_microphone(&self) -> Result<Box<dyn InputSource>, SourceError> {
        Ok(Box::new(CpalMicrophone::new(self.config.microphone_sample_rate, 1)))
    }

    fn open_usb(&self, device_id: &str) -> Result<Box<dyn InputSource>, SourceError> {
        let transport = self
            .usb
            .as_ref()
            .ok_or_else(|| SourceError::DeviceUnavailable("no USB transport configured".into()))?;
        Ok(Box::new(UsbSerialSource::new(
            Arc::clone(transport),
            device_id,
            self.config.usb_sample_rate,
        )))
    }

    fn usb_devices(&self) -> Vec<UsbDeviceInfo> {
        self.usb.as_ref().map(|t| t.devices()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_codes_match_firmware() {
        assert_eq!(HardwareType::from_code(-1), HardwareType::Unknown);
        assert_eq!(HardwareType::from_code(2), HardwareType::HeartAndBrain);
        assert_eq!(HardwareType::from_code(42), HardwareType::Unknown);
        assert_eq!(HardwareType::NeuronPro.code(), 4);
    }

    #[test]
    fn usb_without_transport_is_unavailable() {
        let provider = DeviceSourceProvider::new(AcquisitionConfig::default());
        assert!(matches!(provider.open_usb("ttyUSB0"), Err(SourceError::DeviceUnavailable(_))));
        assert!(provider.usb_devices().is_empty());
    }
}
