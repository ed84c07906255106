//! Capture and encode descriptors
//!
//! Plain data passed between the graph and the hardware service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const R1080P: Resolution = Resolution::new(1920, 1080);
    pub const R960P: Resolution = Resolution::new(1280, 960);
    pub const R720P: Resolution = Resolution::new(1280, 720);
    pub const D1: Resolution = Resolution::new(720, 480);
    pub const VGA: Resolution = Resolution::new(640, 480);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether this resolution fits inside `other` on both axes
    pub fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    /// Non-zero and even on both axes
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Accepts a preset name (`960p`, `720p`, `1080p`, `d1`, `vga`) or `WxH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "1080p" => return Ok(Resolution::R1080P),
            "960p" => return Ok(Resolution::R960P),
            "720p" => return Ok(Resolution::R720P),
            "d1" => return Ok(Resolution::D1),
            "vga" => return Ok(Resolution::VGA),
            _ => {}
        }

        let (w, h) = lower
            .split_once('x')
            .ok_or_else(|| format!("unknown resolution '{s}'"))?;
        let width = w.parse::<u32>().map_err(|e| format!("bad width in '{s}': {e}"))?;
        let height = h.parse::<u32>().map_err(|e| format!("bad height in '{s}': {e}"))?;
        Ok(Resolution::new(width, height))
    }
}

/// Frame rate as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Whole frames per second, rounded up
    pub fn fps_ceil(&self) -> u32 {
        if self.den == 0 {
            return 0;
        }
        self.num.div_ceil(self.den)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(25, 1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Capture channel attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureAttr {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub buffer_count: u32,
}

impl CaptureAttr {
    pub fn new(resolution: Resolution, frame_rate: FrameRate, buffer_count: u32) -> Self {
        Self {
            resolution,
            frame_rate,
            buffer_count,
        }
    }
}

/// Encoded payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    H264,
    H265,
    Jpeg,
}

impl PayloadType {
    /// File extension for raw elementary streams of this payload
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadType::H264 => "h264",
            PayloadType::H265 => "h265",
            PayloadType::Jpeg => "mjpeg",
        }
    }
}

impl Default for PayloadType {
    fn default() -> Self {
        Self::H264
    }
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControl {
    Cbr,
    Vbr,
    Smart,
    FixQp,
}

impl Default for RateControl {
    fn default() -> Self {
        Self::Cbr
    }
}

/// Encode channel attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeAttr {
    pub payload: PayloadType,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub bitrate_kbps: u32,
    pub rate_control: RateControl,
    /// Frames between IDR frames
    pub gop_length: u32,
}

impl EncodeAttr {
    /// H.264 CBR defaults with a two second GOP
    pub fn h264_cbr(resolution: Resolution, frame_rate: FrameRate, bitrate_kbps: u32) -> Self {
        Self {
            payload: PayloadType::H264,
            resolution,
            frame_rate,
            bitrate_kbps,
            rate_control: RateControl::Cbr,
            gop_length: frame_rate.fps_ceil().saturating_mul(2),
        }
    }
}

/// Sensor information as reported by the hardware service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDescriptor {
    pub name: String,
    pub i2c_address: u8,
    pub max_resolution: Resolution,
}

/// One encoded access unit, owned by the hardware service until released
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedUnit {
    pub channel: u32,
    pub sequence: u64,
    pub timestamp_us: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl EncodedUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
