//! Hardware service trait definitions
//!
//! The capture/encode hardware is an opaque collaborator. Everything the core
//! needs from it goes through [`VideoHardware`]; the core never implements
//! the data path itself.

use super::types::{CaptureAttr, EncodeAttr, EncodedUnit, SensorDescriptor};
use crate::graph::model::CaptureOutput;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse failure reported by the hardware service
///
/// Hardware libraries typically return one generic failure code, so this only
/// records which call failed and on which index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareError {
    pub op: &'static str,
    pub index: Option<u32>,
    pub code: i32,
}

impl HardwareError {
    pub fn new(op: &'static str, index: Option<u32>, code: i32) -> Self {
        Self { op, index, code }
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}({}) failed with code {}", self.op, index, self.code),
            None => write!(f, "{} failed with code {}", self.op, self.code),
        }
    }
}

impl std::error::Error for HardwareError {}

/// Result type for hardware calls
pub type HwResult<T> = Result<T, HardwareError>;

/// Outcome of a failed poll
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// Nothing became available within the timeout
    #[error("poll timed out")]
    Timeout,

    #[error("{0}")]
    Fault(HardwareError),
}

/// Capture/encode hardware service
///
/// Implementations must be callable from the control thread and from stream
/// consumer threads at the same time. Only one thread polls a given encode
/// channel; the graph guarantees that.
pub trait VideoHardware: Send + Sync {
    /// Look up the attached sensor by name
    fn detect_sensor(&self, name: &str) -> HwResult<Option<SensorDescriptor>>;

    /// Register the sensor and bring up the media system
    fn system_init(&self, sensor: &SensorDescriptor) -> HwResult<()>;

    fn system_exit(&self) -> HwResult<()>;

    /// One-time ISP tuning enable, required before the first stream-on
    fn enable_tuning(&self) -> HwResult<()>;

    fn create_capture_channel(&self, index: u32, attr: &CaptureAttr) -> HwResult<()>;

    fn destroy_capture_channel(&self, index: u32) -> HwResult<()>;

    /// Apply new attributes to a stopped capture channel without recreating it
    fn reconfigure_capture_channel(&self, index: u32, attr: &CaptureAttr) -> HwResult<()>;

    fn start_streaming(&self, index: u32) -> HwResult<()>;

    fn stop_streaming(&self, index: u32) -> HwResult<()>;

    fn create_encode_group(&self, group: u32) -> HwResult<()>;

    fn destroy_encode_group(&self, group: u32) -> HwResult<()>;

    /// Create an encode channel and register it into `group`
    fn create_encode_channel(&self, group: u32, index: u32, attr: &EncodeAttr) -> HwResult<()>;

    /// Unregister an encode channel from its group and destroy it
    fn destroy_encode_channel(&self, index: u32) -> HwResult<()>;

    fn start_receiving(&self, index: u32) -> HwResult<()>;

    fn stop_receiving(&self, index: u32) -> HwResult<()>;

    fn bind_data_path(&self, output: CaptureOutput, group: u32) -> HwResult<()>;

    fn unbind_data_path(&self, output: CaptureOutput, group: u32) -> HwResult<()>;

    /// Block up to `timeout` for the next encoded unit of `index`
    fn poll_encoded_unit(&self, index: u32, timeout: Duration) -> Result<EncodedUnit, PollError>;

    /// Hand a polled unit back to the hardware service
    fn release_encoded_unit(&self, index: u32, unit: EncodedUnit) -> HwResult<()>;
}
