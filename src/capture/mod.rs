//! Capture/encode hardware seam
//!
//! This module provides the hardware service trait, the descriptors passed
//! through it, and an in-process simulated implementation.

pub mod simulated;
pub mod traits;
pub mod types;

// Re-export traits
pub use traits::{HardwareError, HwResult, PollError, VideoHardware};
pub use types::{
    CaptureAttr, EncodeAttr, EncodedUnit, FrameRate, PayloadType, RateControl, Resolution,
    SensorDescriptor,
};

pub use simulated::{HwOp, SimulatedHardware};
