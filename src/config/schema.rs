//! Pipeline configuration schema
//!
//! Every field has a default; an empty JSON object describes the two-stream
//! 960p + D1 session that switches to 720p + VGA.

use crate::capture::types::{
    CaptureAttr, EncodeAttr, FrameRate, PayloadType, RateControl, Resolution,
};
use crate::graph::{CaptureOutput, GraphLimits};
use crate::recorder::consumer::ConsumerConfig;
use crate::recorder::switcher::{DependentEncode, SwitchRequest, SwitchStrategy};
use crate::utils::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Resolutions as `"1280x720"` or a preset name such as `"720p"`
mod resolution_format {
    use crate::capture::types::Resolution;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Resolution, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Resolution, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Channels
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    pub index: u32,
    #[serde(with = "resolution_format")]
    pub resolution: Resolution,
    #[serde(default)]
    pub frame_rate: FrameRate,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

fn default_buffer_count() -> u32 {
    3
}

impl CaptureConfig {
    pub fn attr(&self) -> CaptureAttr {
        CaptureAttr::new(self.resolution, self.frame_rate, self.buffer_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderConfig {
    pub index: u32,
    pub group: u32,
    /// This channel founds its group
    #[serde(default)]
    pub create_group: bool,
    #[serde(default)]
    pub payload: PayloadType,
    #[serde(with = "resolution_format")]
    pub resolution: Resolution,
    #[serde(default)]
    pub frame_rate: FrameRate,
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub rate_control: RateControl,
    /// Defaults to two seconds of frames
    #[serde(default)]
    pub gop_length: Option<u32>,
}

impl EncoderConfig {
    pub fn attr(&self) -> EncodeAttr {
        let mut attr = EncodeAttr::h264_cbr(self.resolution, self.frame_rate, self.bitrate_kbps);
        attr.payload = self.payload;
        attr.rate_control = self.rate_control;
        if let Some(gop) = self.gop_length {
            attr.gop_length = gop;
        }
        attr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub capture: u32,
    #[serde(default)]
    pub output: u32,
    pub group: u32,
}

impl BindingConfig {
    pub fn output(&self) -> CaptureOutput {
        CaptureOutput::new(self.capture, self.output)
    }
}

// =============================================================================
// Switch plan
// =============================================================================

/// Resolution switch performed mid-session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPlan {
    pub capture: u32,
    #[serde(with = "resolution_format")]
    pub resolution: Resolution,
    #[serde(default)]
    pub frame_rate: Option<FrameRate>,
    #[serde(default)]
    pub buffer_count: Option<u32>,
    #[serde(default)]
    pub strategy: SwitchStrategy,
    /// Target state of every encode channel fed by the capture channel
    pub encoders: Vec<EncoderConfig>,
    /// Edges for groups founded by the switch
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl SwitchPlan {
    pub fn to_request(&self) -> SwitchRequest {
        let dependents = self
            .encoders
            .iter()
            .map(|enc| DependentEncode {
                index: enc.index,
                attr: enc.attr(),
                group: enc.group,
                create_group: enc.create_group,
                bind_to: self
                    .bindings
                    .iter()
                    .find(|b| enc.create_group && b.group == enc.group)
                    .map(|b| b.output()),
            })
            .collect();

        SwitchRequest {
            capture_index: self.capture,
            resolution: self.resolution,
            frame_rate: self.frame_rate,
            buffer_count: self.buffer_count,
            dependents,
            strategy: self.strategy,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerSettings {
    pub poll_timeout_ms: u64,
    pub frame_limit: Option<u64>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            frame_limit: None,
        }
    }
}

impl ConsumerSettings {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            frame_limit: self.frame_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub sensor: String,
    pub captures: Vec<CaptureConfig>,
    pub encoders: Vec<EncoderConfig>,
    pub bindings: Vec<BindingConfig>,
    pub limits: GraphLimits,
    pub consumer: ConsumerSettings,
    /// Write each stream to `stream-<index>.<ext>` here
    pub output_dir: Option<PathBuf>,
    pub switch: Option<SwitchPlan>,
    /// Streaming time before and after the switch
    pub run_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let rate = FrameRate::new(25, 1);
        let encoder = |index, group, create_group, resolution, bitrate_kbps| EncoderConfig {
            index,
            group,
            create_group,
            payload: PayloadType::H264,
            resolution,
            frame_rate: rate,
            bitrate_kbps,
            rate_control: RateControl::Cbr,
            gop_length: None,
        };

        Self {
            sensor: "sc1035".to_string(),
            captures: vec![
                CaptureConfig {
                    index: 0,
                    resolution: Resolution::R960P,
                    frame_rate: rate,
                    buffer_count: 3,
                },
                CaptureConfig {
                    index: 1,
                    resolution: Resolution::VGA,
                    frame_rate: rate,
                    buffer_count: 4,
                },
            ],
            encoders: vec![
                encoder(0, 0, true, Resolution::R960P, 2000),
                encoder(1, 0, false, Resolution::D1, 1000),
            ],
            bindings: vec![BindingConfig {
                capture: 0,
                output: 0,
                group: 0,
            }],
            limits: GraphLimits::default(),
            consumer: ConsumerSettings::default(),
            output_dir: None,
            switch: Some(SwitchPlan {
                capture: 0,
                resolution: Resolution::R720P,
                frame_rate: None,
                buffer_count: None,
                strategy: SwitchStrategy::ReinitInPlace,
                encoders: vec![
                    encoder(0, 0, false, Resolution::R720P, 2000),
                    encoder(1, 1, true, Resolution::VGA, 1000),
                ],
                bindings: vec![BindingConfig {
                    capture: 1,
                    output: 0,
                    group: 1,
                }],
            }),
            run_secs: 5,
        }
    }
}

impl PipelineConfig {
    /// Structural checks that need no hardware
    ///
    /// Attribute ranges are checked again by the channel graph when the
    /// session is built.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.sensor.trim().is_empty() {
            return invalid("sensor name is empty");
        }
        if self.captures.is_empty() {
            return invalid("at least one capture channel is required");
        }

        let mut captures = BTreeSet::new();
        for capture in &self.captures {
            if !captures.insert(capture.index) {
                return invalid(format!("capture channel {} configured twice", capture.index));
            }
            if !capture.resolution.is_valid() || !capture.frame_rate.is_valid() {
                return invalid(format!(
                    "capture channel {}: invalid resolution or frame rate",
                    capture.index
                ));
            }
            if capture.buffer_count == 0 {
                return invalid(format!("capture channel {}: zero buffers", capture.index));
            }
        }

        let groups = Self::check_encoders(&self.encoders, &BTreeSet::new())?;
        Self::check_bindings(&self.bindings, &captures, &groups)?;

        if let Some(plan) = &self.switch {
            if !captures.contains(&plan.capture) {
                return invalid(format!("switch names unknown capture channel {}", plan.capture));
            }
            // Groups that survive the switch may be joined without being founded
            let existing: BTreeSet<u32> = groups.keys().copied().collect();
            let founded = Self::check_encoders(&plan.encoders, &existing)?;
            for (group, _) in founded.iter().filter(|(g, _)| !existing.contains(g)) {
                if !plan.bindings.iter().any(|b| b.group == *group) {
                    return invalid(format!("switch founds encode group {group} without a binding"));
                }
            }
            Self::check_bindings(&plan.bindings, &captures, &founded)?;
        }
        Ok(())
    }

    /// Returns group -> members; every group must be founded before it is joined
    fn check_encoders(
        encoders: &[EncoderConfig],
        existing: &BTreeSet<u32>,
    ) -> PipelineResult<BTreeMap<u32, Vec<u32>>> {
        let mut groups: BTreeMap<u32, Vec<u32>> =
            existing.iter().map(|g| (*g, Vec::new())).collect();
        let mut seen = BTreeSet::new();

        for enc in encoders {
            if !seen.insert(enc.index) {
                return invalid(format!("encode channel {} configured twice", enc.index));
            }
            if enc.create_group {
                if groups.contains_key(&enc.group) && !existing.contains(&enc.group) {
                    return invalid(format!("encode group {} founded twice", enc.group));
                }
                groups.entry(enc.group).or_default().push(enc.index);
            } else {
                match groups.get_mut(&enc.group) {
                    Some(members) => members.push(enc.index),
                    None => {
                        return invalid(format!(
                            "encode channel {} joins group {} before it is founded",
                            enc.index, enc.group
                        ))
                    }
                }
            }
            if enc.bitrate_kbps == 0 && enc.rate_control == RateControl::Cbr {
                return invalid(format!("encode channel {}: CBR needs a bitrate", enc.index));
            }
        }
        Ok(groups)
    }

    fn check_bindings(
        bindings: &[BindingConfig],
        captures: &BTreeSet<u32>,
        groups: &BTreeMap<u32, Vec<u32>>,
    ) -> PipelineResult<()> {
        let mut outputs = BTreeSet::new();
        for binding in bindings {
            if !captures.contains(&binding.capture) {
                return invalid(format!(
                    "binding names unknown capture channel {}",
                    binding.capture
                ));
            }
            if !groups.contains_key(&binding.group) {
                return invalid(format!("binding names unknown encode group {}", binding.group));
            }
            if !outputs.insert(binding.output()) {
                return invalid(format!("{} bound twice", binding.output()));
            }
        }
        Ok(())
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }
}

fn invalid<T>(message: impl Into<String>) -> PipelineResult<T> {
    Err(PipelineError::InvalidConfiguration(message.into()))
}
