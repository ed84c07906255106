//! Capture/encode channel graph
//!
//! Authoritative model of which capture channels, encode groups and encode
//! channels exist and how they are bound. Every mutating operation checks its
//! preconditions against this model before touching hardware, so a failure
//! reports a precise [`ErrorKind`](crate::utils::ErrorKind) instead of the
//! hardware's generic failure code, and leaves the graph unchanged.

use super::model::{
    BindEdge, CaptureChannel, CaptureOutput, ChannelHandle, ChannelKind, EncodeChannel,
    EncodeGroup, GraphSnapshot, StreamState,
};
use crate::capture::traits::VideoHardware;
use crate::capture::types::{CaptureAttr, EncodeAttr, FrameRate, RateControl, Resolution};
use crate::utils::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Index ranges accepted by the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphLimits {
    pub max_capture_channels: u32,
    pub max_outputs_per_capture: u32,
    pub max_groups: u32,
    pub max_encode_channels: u32,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_capture_channels: 3,
            max_outputs_per_capture: 1,
            max_groups: 6,
            max_encode_channels: 12,
        }
    }
}

pub struct ChannelGraph {
    hw: Arc<dyn VideoHardware>,
    limits: GraphLimits,
    sensor_max: Option<Resolution>,
    captures: BTreeMap<u32, CaptureChannel>,
    groups: BTreeMap<u32, EncodeGroup>,
    encoders: BTreeMap<u32, EncodeChannel>,
    edges: BTreeMap<CaptureOutput, u32>,
    next_seq: u64,
}

impl ChannelGraph {
    pub fn new(hw: Arc<dyn VideoHardware>) -> Self {
        Self::with_limits(hw, GraphLimits::default())
    }

    pub fn with_limits(hw: Arc<dyn VideoHardware>, limits: GraphLimits) -> Self {
        Self {
            hw,
            limits,
            sensor_max: None,
            captures: BTreeMap::new(),
            groups: BTreeMap::new(),
            encoders: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Hardware service this graph drives
    pub fn hardware(&self) -> &Arc<dyn VideoHardware> {
        &self.hw
    }

    pub fn limits(&self) -> &GraphLimits {
        &self.limits
    }

    /// Cap capture resolutions at what the detected sensor can deliver
    pub fn set_sensor_limit(&mut self, max: Option<Resolution>) {
        self.sensor_max = max;
    }

    fn stamp(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn check_range(kind: ChannelKind, index: u32, max: u32) -> PipelineResult<()> {
        if index >= max {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{kind} index {index} out of range (max {})",
                max.saturating_sub(1)
            )));
        }
        Ok(())
    }

    fn validate_frame_rate(what: &str, rate: &FrameRate) -> PipelineResult<()> {
        if !rate.is_valid() {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{what}: invalid frame rate {rate}"
            )));
        }
        Ok(())
    }

    /// Check capture attributes against the sensor before any hardware call
    pub fn validate_capture_attr(&self, index: u32, attr: &CaptureAttr) -> PipelineResult<()> {
        let what = format!("capture channel {index}");
        if !attr.resolution.is_valid() {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{what}: invalid resolution {}",
                attr.resolution
            )));
        }
        if let Some(max) = self.sensor_max {
            if !attr.resolution.fits_within(&max) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "{what}: {} exceeds sensor maximum {max}",
                    attr.resolution
                )));
            }
        }
        Self::validate_frame_rate(&what, &attr.frame_rate)?;
        if attr.buffer_count == 0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{what}: buffer count must be at least 1"
            )));
        }
        Ok(())
    }

    pub fn validate_encode_attr(&self, index: u32, attr: &EncodeAttr) -> PipelineResult<()> {
        let what = format!("encode channel {index}");
        if !attr.resolution.is_valid() {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{what}: invalid resolution {}",
                attr.resolution
            )));
        }
        Self::validate_frame_rate(&what, &attr.frame_rate)?;
        if attr.rate_control != RateControl::FixQp && attr.bitrate_kbps == 0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{what}: bitrate must be non-zero for {:?}",
                attr.rate_control
            )));
        }
        Ok(())
    }

    /// Every member of `group` must fit inside `source`
    fn check_members_fit(&self, group: u32, source: &Resolution) -> PipelineResult<()> {
        let Some(g) = self.groups.get(&group) else {
            return Ok(());
        };
        for member in &g.members {
            if let Some(enc) = self.encoders.get(member) {
                if !enc.attr.resolution.fits_within(source) {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "encode channel {} at {} cannot be fed from {source}",
                        member, enc.attr.resolution
                    )));
                }
            }
        }
        Ok(())
    }

    fn capture_ref(&self, index: u32) -> PipelineResult<&CaptureChannel> {
        self.captures.get(&index).ok_or(PipelineError::NotCreated {
            kind: ChannelKind::Capture,
            index,
        })
    }

    fn encoder_ref(&self, index: u32) -> PipelineResult<&EncodeChannel> {
        self.encoders.get(&index).ok_or(PipelineError::NotCreated {
            kind: ChannelKind::Encode,
            index,
        })
    }

    // =========================================================================
    // Capture channels
    // =========================================================================

    pub fn create_capture_channel(
        &mut self,
        index: u32,
        attr: CaptureAttr,
    ) -> PipelineResult<ChannelHandle> {
        Self::check_range(ChannelKind::Capture, index, self.limits.max_capture_channels)?;
        if self.captures.contains_key(&index) {
            return Err(PipelineError::AlreadyCreated {
                kind: ChannelKind::Capture,
                index,
            });
        }
        self.validate_capture_attr(index, &attr)?;

        self.hw.create_capture_channel(index, &attr)?;
        let created_seq = self.stamp();
        self.captures.insert(
            index,
            CaptureChannel {
                index,
                attr,
                state: StreamState::Stopped,
                created_seq,
            },
        );

        tracing::info!(
            "Created capture channel {} ({} @ {} fps, {} buffers)",
            index,
            attr.resolution,
            attr.frame_rate,
            attr.buffer_count
        );
        Ok(ChannelHandle {
            kind: ChannelKind::Capture,
            index,
        })
    }

    pub fn destroy_capture_channel(&mut self, index: u32) -> PipelineResult<()> {
        let capture = self.capture_ref(index)?;
        if let Some((_, group)) = self.edges.iter().find(|(o, _)| o.channel == index) {
            return Err(PipelineError::StillBound {
                index,
                group: *group,
            });
        }
        if capture.is_streaming() {
            return Err(PipelineError::StillStreaming { index });
        }

        self.hw.destroy_capture_channel(index)?;
        self.captures.remove(&index);

        tracing::info!("Destroyed capture channel {}", index);
        Ok(())
    }

    /// Change a stopped capture channel's resolution in place
    ///
    /// Frame rate and buffer count are kept unless overridden. Returns the
    /// attributes now in effect.
    pub fn reconfigure_capture_channel(
        &mut self,
        index: u32,
        resolution: Resolution,
        frame_rate: Option<FrameRate>,
        buffer_count: Option<u32>,
    ) -> PipelineResult<CaptureAttr> {
        let capture = self.capture_ref(index)?;
        if capture.is_streaming() {
            return Err(PipelineError::StillStreaming { index });
        }

        let attr = CaptureAttr {
            resolution,
            frame_rate: frame_rate.unwrap_or(capture.attr.frame_rate),
            buffer_count: buffer_count.unwrap_or(capture.attr.buffer_count),
        };
        self.validate_capture_attr(index, &attr)?;
        let bound: Vec<u32> = self
            .edges
            .iter()
            .filter(|(o, _)| o.channel == index)
            .map(|(_, g)| *g)
            .collect();
        for group in bound {
            self.check_members_fit(group, &resolution)?;
        }

        self.hw.reconfigure_capture_channel(index, &attr)?;
        if let Some(capture) = self.captures.get_mut(&index) {
            capture.attr = attr;
        }

        tracing::info!(
            "Reconfigured capture channel {} to {} @ {} fps, {} buffers",
            index,
            attr.resolution,
            attr.frame_rate,
            attr.buffer_count
        );
        Ok(attr)
    }

    /// Start streaming; a no-op if already streaming
    pub fn start_streaming(&mut self, index: u32) -> PipelineResult<()> {
        if self.capture_ref(index)?.is_streaming() {
            tracing::debug!("Capture channel {} already streaming", index);
            return Ok(());
        }
        self.hw.start_streaming(index)?;
        if let Some(capture) = self.captures.get_mut(&index) {
            capture.state = StreamState::Streaming;
        }
        tracing::debug!("Capture channel {} streaming", index);
        Ok(())
    }

    /// Stop streaming; a no-op if already stopped
    pub fn stop_streaming(&mut self, index: u32) -> PipelineResult<()> {
        if !self.capture_ref(index)?.is_streaming() {
            return Ok(());
        }
        self.hw.stop_streaming(index)?;
        if let Some(capture) = self.captures.get_mut(&index) {
            capture.state = StreamState::Stopped;
        }
        tracing::debug!("Capture channel {} stopped", index);
        Ok(())
    }

    // =========================================================================
    // Encode groups and channels
    // =========================================================================

    /// Create an encode channel in `group`
    ///
    /// With `create_group` the group is founded with this channel as its first
    /// member; otherwise the group must already exist.
    pub fn create_encode_channel(
        &mut self,
        group: u32,
        index: u32,
        attr: EncodeAttr,
        create_group: bool,
    ) -> PipelineResult<ChannelHandle> {
        Self::check_range(ChannelKind::Encode, index, self.limits.max_encode_channels)?;
        Self::check_range(ChannelKind::Group, group, self.limits.max_groups)?;
        if self.encoders.contains_key(&index) {
            return Err(PipelineError::AlreadyCreated {
                kind: ChannelKind::Encode,
                index,
            });
        }
        if create_group {
            if self.groups.contains_key(&group) {
                return Err(PipelineError::AlreadyCreated {
                    kind: ChannelKind::Group,
                    index: group,
                });
            }
        } else if !self.groups.contains_key(&group) {
            return Err(PipelineError::GroupNotFound { group });
        }
        self.validate_encode_attr(index, &attr)?;
        if let Some(output) = self.output_for_group(group) {
            if let Some(capture) = self.captures.get(&output.channel) {
                if !attr.resolution.fits_within(&capture.attr.resolution) {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "encode channel {index} at {} cannot be fed from {}",
                        attr.resolution, capture.attr.resolution
                    )));
                }
            }
        }

        if create_group {
            self.hw.create_encode_group(group)?;
        }
        if let Err(e) = self.hw.create_encode_channel(group, index, &attr) {
            if create_group {
                if let Err(undo) = self.hw.destroy_encode_group(group) {
                    tracing::warn!("Failed to undo creation of encode group {}: {}", group, undo);
                }
            }
            return Err(e.into());
        }

        if create_group {
            let created_seq = self.stamp();
            self.groups.insert(
                group,
                EncodeGroup {
                    id: group,
                    members: Vec::new(),
                    created_seq,
                },
            );
            tracing::info!("Created encode group {}", group);
        }
        let created_seq = self.stamp();
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.push(index);
        }
        self.encoders.insert(
            index,
            EncodeChannel {
                index,
                group,
                attr,
                receiving: false,
                consumer_attached: false,
                created_seq,
            },
        );

        tracing::info!(
            "Created encode channel {} in group {} ({:?} {} @ {} kbps)",
            index,
            group,
            attr.payload,
            attr.resolution,
            attr.bitrate_kbps
        );
        Ok(ChannelHandle {
            kind: ChannelKind::Encode,
            index,
        })
    }

    /// Destroy an encode channel, optionally destroying its group with it
    ///
    /// With `destroy_group` the channel must be the group's last member and the
    /// group must be unbound; both are checked before anything is destroyed.
    pub fn destroy_encode_channel(&mut self, index: u32, destroy_group: bool) -> PipelineResult<()> {
        let encoder = self.encoder_ref(index)?;
        if encoder.consumer_attached {
            return Err(PipelineError::ConsumerActive { index });
        }
        if encoder.receiving {
            return Err(PipelineError::StillReceiving { index });
        }
        let group = encoder.group;

        if destroy_group {
            let remaining = self
                .groups
                .get(&group)
                .map(|g| g.members.iter().filter(|m| **m != index).count())
                .unwrap_or(0);
            if remaining > 0 {
                return Err(PipelineError::GroupNotEmpty {
                    group,
                    members: remaining,
                });
            }
            if let Some(output) = self.output_for_group(group) {
                return Err(PipelineError::StillBound {
                    index: output.channel,
                    group,
                });
            }
        }

        self.hw.destroy_encode_channel(index)?;
        self.encoders.remove(&index);
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.retain(|m| *m != index);
        }
        tracing::info!("Destroyed encode channel {} (group {})", index, group);

        if destroy_group {
            self.destroy_encode_group(group)?;
        }
        Ok(())
    }

    /// Destroy an empty, unbound encode group
    pub fn destroy_encode_group(&mut self, group: u32) -> PipelineResult<()> {
        let g = self
            .groups
            .get(&group)
            .ok_or(PipelineError::GroupNotFound { group })?;
        if !g.is_empty() {
            return Err(PipelineError::GroupNotEmpty {
                group,
                members: g.members.len(),
            });
        }
        if let Some(output) = self.output_for_group(group) {
            return Err(PipelineError::StillBound {
                index: output.channel,
                group,
            });
        }

        self.hw.destroy_encode_group(group)?;
        self.groups.remove(&group);
        tracing::info!("Destroyed encode group {}", group);
        Ok(())
    }

    /// Switch an encode channel to receiving
    ///
    /// Refuses a channel that is already receiving, which keeps at most one
    /// consumer per channel.
    pub fn start_receiving(&mut self, index: u32) -> PipelineResult<()> {
        if self.encoder_ref(index)?.receiving {
            return Err(PipelineError::AlreadyReceiving { index });
        }
        self.hw.start_receiving(index)?;
        if let Some(enc) = self.encoders.get_mut(&index) {
            enc.receiving = true;
        }
        tracing::debug!("Encode channel {} receiving", index);
        Ok(())
    }

    /// Stop receiving; a no-op if already off
    ///
    /// Does not wait for the consumer; callers join it separately.
    pub fn stop_receiving(&mut self, index: u32) -> PipelineResult<()> {
        if !self.encoder_ref(index)?.receiving {
            return Ok(());
        }
        self.hw.stop_receiving(index)?;
        if let Some(enc) = self.encoders.get_mut(&index) {
            enc.receiving = false;
        }
        tracing::debug!("Encode channel {} stopped receiving", index);
        Ok(())
    }

    /// Mark a consumer as attached to a receiving channel
    pub fn attach_consumer(&mut self, index: u32) -> PipelineResult<()> {
        let enc = self.encoder_ref(index)?;
        if enc.consumer_attached {
            return Err(PipelineError::ConsumerActive { index });
        }
        if !enc.receiving {
            return Err(PipelineError::InvalidState(format!(
                "encode channel {index} is not receiving"
            )));
        }
        if let Some(enc) = self.encoders.get_mut(&index) {
            enc.consumer_attached = true;
        }
        Ok(())
    }

    /// Clear the consumer mark once its worker has been joined
    pub fn detach_consumer(&mut self, index: u32) {
        if let Some(enc) = self.encoders.get_mut(&index) {
            enc.consumer_attached = false;
        }
    }

    // =========================================================================
    // Bind edges
    // =========================================================================

    pub fn bind(&mut self, output: CaptureOutput, group: u32) -> PipelineResult<()> {
        if output.output >= self.limits.max_outputs_per_capture {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{output}: capture channels expose {} output(s)",
                self.limits.max_outputs_per_capture
            )));
        }
        let capture = self.capture_ref(output.channel)?;
        if let Some(existing) = self.edges.get(&output) {
            return Err(PipelineError::AlreadyBound {
                output,
                group: *existing,
            });
        }
        let g = self
            .groups
            .get(&group)
            .ok_or(PipelineError::GroupNotFound { group })?;
        if g.is_empty() {
            return Err(PipelineError::GroupEmpty { group });
        }
        if let Some(other) = self.output_for_group(group) {
            return Err(PipelineError::AlreadyBound {
                output: other,
                group,
            });
        }
        let source = capture.attr.resolution;
        self.check_members_fit(group, &source)?;

        self.hw.bind_data_path(output, group)?;
        self.edges.insert(output, group);

        tracing::info!("Bound {} -> encode group {}", output, group);
        Ok(())
    }

    pub fn unbind(&mut self, output: CaptureOutput, group: u32) -> PipelineResult<()> {
        if self.edges.get(&output) != Some(&group) {
            return Err(PipelineError::NotBound { output, group });
        }

        self.hw.unbind_data_path(output, group)?;
        self.edges.remove(&output);

        tracing::info!("Unbound {} -> encode group {}", output, group);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn capture_channel(&self, index: u32) -> Option<&CaptureChannel> {
        self.captures.get(&index)
    }

    pub fn encode_channel(&self, index: u32) -> Option<&EncodeChannel> {
        self.encoders.get(&index)
    }

    pub fn group(&self, group: u32) -> Option<&EncodeGroup> {
        self.groups.get(&group)
    }

    /// Group bound to `output`, if any
    pub fn edge_for_output(&self, output: CaptureOutput) -> Option<u32> {
        self.edges.get(&output).copied()
    }

    /// Capture output feeding `group`, if any
    pub fn output_for_group(&self, group: u32) -> Option<CaptureOutput> {
        self.edges
            .iter()
            .find(|(_, g)| **g == group)
            .map(|(o, _)| *o)
    }

    pub fn edges(&self) -> Vec<BindEdge> {
        self.edges
            .iter()
            .map(|(output, group)| BindEdge {
                output: *output,
                group: *group,
            })
            .collect()
    }

    /// Encode channels fed by any output of capture channel `index`
    pub fn dependents_of(&self, index: u32) -> Vec<u32> {
        self.edges
            .iter()
            .filter(|(o, _)| o.channel == index)
            .filter_map(|(_, g)| self.groups.get(g))
            .flat_map(|g| g.members.iter().copied())
            .collect()
    }

    /// Capture channel indices, oldest first
    pub fn captures_by_creation(&self) -> Vec<u32> {
        let mut list: Vec<&CaptureChannel> = self.captures.values().collect();
        list.sort_by_key(|c| c.created_seq);
        list.into_iter().map(|c| c.index).collect()
    }

    /// Encode channel indices, oldest first
    pub fn encoders_by_creation(&self) -> Vec<u32> {
        let mut list: Vec<&EncodeChannel> = self.encoders.values().collect();
        list.sort_by_key(|e| e.created_seq);
        list.into_iter().map(|e| e.index).collect()
    }

    /// Encode channels currently receiving
    pub fn receiving_encoders(&self) -> Vec<u32> {
        self.encoders
            .values()
            .filter(|e| e.receiving)
            .map(|e| e.index)
            .collect()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.groups.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
            && self.groups.is_empty()
            && self.encoders.is_empty()
            && self.edges.is_empty()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            captures: self.captures.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
            encoders: self.encoders.values().cloned().collect(),
            edges: self.edges(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{HwOp, SimulatedHardware};
    use crate::capture::traits::VideoHardware;
    use crate::utils::error::ErrorKind;

    fn setup() -> (Arc<SimulatedHardware>, ChannelGraph) {
        let hw = Arc::new(SimulatedHardware::new());
        let sensor = hw.detect_sensor("sc1035").unwrap().unwrap();
        hw.system_init(&sensor).unwrap();
        hw.enable_tuning().unwrap();
        let mut graph = ChannelGraph::new(hw.clone());
        graph.set_sensor_limit(Some(sensor.max_resolution));
        (hw, graph)
    }

    fn capture_attr(resolution: Resolution) -> CaptureAttr {
        CaptureAttr::new(resolution, FrameRate::new(25, 1), 3)
    }

    fn encode_attr(resolution: Resolution) -> EncodeAttr {
        EncodeAttr::h264_cbr(resolution, FrameRate::new(25, 1), 1000)
    }

    #[test]
    fn test_capture_create_destroy_cycle() {
        let (hw, mut graph) = setup();

        graph.create_capture_channel(0, capture_attr(Resolution::R960P)).unwrap();
        let err = graph
            .create_capture_channel(0, capture_attr(Resolution::VGA))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyCreated);

        graph.destroy_capture_channel(0).unwrap();
        assert!(graph.capture_channel(0).is_none());
        assert_eq!(
            graph.destroy_capture_channel(0).unwrap_err().kind(),
            ErrorKind::NotCreated
        );

        graph.create_capture_channel(0, capture_attr(Resolution::VGA)).unwrap();
        assert_eq!(hw.call_count(HwOp::CreateCapture, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::DestroyCapture, Some(0)), 1);
    }

    #[test]
    fn test_invalid_configuration_rejected_before_hardware() {
        let (hw, mut graph) = setup();

        let too_big = capture_attr(Resolution::R1080P);
        assert_eq!(
            graph.create_capture_channel(0, too_big).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
        let no_buffers = CaptureAttr::new(Resolution::VGA, FrameRate::new(25, 1), 0);
        assert_eq!(
            graph.create_capture_channel(0, no_buffers).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(
            graph
                .create_capture_channel(7, capture_attr(Resolution::VGA))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(hw.total_calls(HwOp::CreateCapture), 0);
    }

    #[test]
    fn test_destroy_capture_preconditions() {
        let (_hw, mut graph) = setup();
        graph.create_capture_channel(0, capture_attr(Resolution::R960P)).unwrap();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R960P), true)
            .unwrap();
        graph.bind(CaptureOutput::primary(0), 0).unwrap();
        graph.start_streaming(0).unwrap();

        assert_eq!(
            graph.destroy_capture_channel(0).unwrap_err().kind(),
            ErrorKind::StillBound
        );
        graph.unbind(CaptureOutput::primary(0), 0).unwrap();
        assert_eq!(
            graph.destroy_capture_channel(0).unwrap_err().kind(),
            ErrorKind::StillStreaming
        );
        graph.stop_streaming(0).unwrap();
        graph.destroy_capture_channel(0).unwrap();
    }

    #[test]
    fn test_bind_unbind_rebind() {
        let (_hw, mut graph) = setup();
        let out = CaptureOutput::primary(0);
        graph.create_capture_channel(0, capture_attr(Resolution::R960P)).unwrap();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R960P), true)
            .unwrap();
        graph
            .create_encode_channel(1, 1, encode_attr(Resolution::D1), true)
            .unwrap();

        graph.bind(out, 0).unwrap();
        let err = graph.bind(out, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBound);
        assert_eq!(graph.bind(out, 0).unwrap_err().kind(), ErrorKind::AlreadyBound);

        graph.unbind(out, 0).unwrap();
        assert_eq!(graph.unbind(out, 0).unwrap_err().kind(), ErrorKind::NotBound);
        graph.bind(out, 0).unwrap();
        assert_eq!(graph.edge_for_output(out), Some(0));
    }

    #[test]
    fn test_bind_requires_members() {
        let (_hw, mut graph) = setup();
        graph.create_capture_channel(0, capture_attr(Resolution::R960P)).unwrap();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R960P), true)
            .unwrap();
        graph.destroy_encode_channel(0, false).unwrap();

        assert_eq!(
            graph.bind(CaptureOutput::primary(0), 0).unwrap_err().kind(),
            ErrorKind::GroupEmpty
        );
        assert_eq!(
            graph.bind(CaptureOutput::primary(0), 4).unwrap_err().kind(),
            ErrorKind::GroupNotFound
        );
    }

    #[test]
    fn test_bind_rejects_upscaling_member() {
        let (_hw, mut graph) = setup();
        graph.create_capture_channel(1, capture_attr(Resolution::VGA)).unwrap();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R720P), true)
            .unwrap();
        assert_eq!(
            graph.bind(CaptureOutput::primary(1), 0).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[test]
    fn test_group_membership_and_destruction() {
        let (hw, mut graph) = setup();
        assert_eq!(
            graph
                .create_encode_channel(0, 1, encode_attr(Resolution::D1), false)
                .unwrap_err()
                .kind(),
            ErrorKind::GroupNotFound
        );

        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R960P), true)
            .unwrap();
        graph
            .create_encode_channel(0, 1, encode_attr(Resolution::D1), false)
            .unwrap();
        assert_eq!(graph.group(0).unwrap().members, vec![0, 1]);

        let err = graph.destroy_encode_channel(0, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GroupNotEmpty);
        assert!(graph.encode_channel(0).is_some());

        graph.destroy_encode_channel(1, false).unwrap();
        graph.destroy_encode_channel(0, true).unwrap();
        assert!(graph.group(0).is_none());
        assert_eq!(hw.call_count(HwOp::DestroyGroup, Some(0)), 1);
    }

    #[test]
    fn test_group_survives_without_destroy_flag() {
        let (_hw, mut graph) = setup();
        graph
            .create_encode_channel(2, 0, encode_attr(Resolution::VGA), true)
            .unwrap();
        graph.destroy_encode_channel(0, false).unwrap();
        assert!(graph.group(2).unwrap().is_empty());

        graph
            .create_encode_channel(2, 3, encode_attr(Resolution::VGA), false)
            .unwrap();
        assert_eq!(graph.group(2).unwrap().members, vec![3]);
    }

    #[test]
    fn test_group_creation_undone_when_channel_create_faults() {
        let (hw, mut graph) = setup();
        hw.inject_fault(HwOp::CreateEncode, Some(0));

        let err = graph
            .create_encode_channel(0, 0, encode_attr(Resolution::VGA), true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(graph.group(0).is_none());
        assert_eq!(hw.call_count(HwOp::DestroyGroup, Some(0)), 1);

        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::VGA), true)
            .unwrap();
    }

    #[test]
    fn test_receiving_guards_destroy_and_consumers() {
        let (_hw, mut graph) = setup();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::VGA), true)
            .unwrap();

        assert_eq!(
            graph.attach_consumer(0).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        graph.start_receiving(0).unwrap();
        assert_eq!(
            graph.start_receiving(0).unwrap_err().kind(),
            ErrorKind::AlreadyReceiving
        );
        graph.attach_consumer(0).unwrap();
        assert_eq!(
            graph.attach_consumer(0).unwrap_err().kind(),
            ErrorKind::ConsumerActive
        );

        assert_eq!(
            graph.destroy_encode_channel(0, true).unwrap_err().kind(),
            ErrorKind::ConsumerActive
        );
        graph.detach_consumer(0);
        assert_eq!(
            graph.destroy_encode_channel(0, true).unwrap_err().kind(),
            ErrorKind::StillReceiving
        );
        graph.stop_receiving(0).unwrap();
        graph.destroy_encode_channel(0, true).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_reconfigure_preserves_rate_and_buffers() {
        let (hw, mut graph) = setup();
        let attr = CaptureAttr::new(Resolution::R960P, FrameRate::new(30, 2), 4);
        graph.create_capture_channel(0, attr).unwrap();
        graph.start_streaming(0).unwrap();

        assert_eq!(
            graph
                .reconfigure_capture_channel(0, Resolution::R720P, None, None)
                .unwrap_err()
                .kind(),
            ErrorKind::StillStreaming
        );

        graph.stop_streaming(0).unwrap();
        let applied = graph
            .reconfigure_capture_channel(0, Resolution::R720P, None, None)
            .unwrap();
        assert_eq!(applied.frame_rate, FrameRate::new(30, 2));
        assert_eq!(applied.buffer_count, 4);
        assert_eq!(applied.resolution, Resolution::R720P);
        assert_eq!(hw.capture_attr(0).unwrap(), applied);

        let overridden = graph
            .reconfigure_capture_channel(0, Resolution::VGA, Some(FrameRate::new(15, 1)), Some(2))
            .unwrap();
        assert_eq!(overridden.frame_rate, FrameRate::new(15, 1));
        assert_eq!(overridden.buffer_count, 2);
    }

    #[test]
    fn test_dependents_and_creation_order() {
        let (_hw, mut graph) = setup();
        graph.create_capture_channel(1, capture_attr(Resolution::VGA)).unwrap();
        graph.create_capture_channel(0, capture_attr(Resolution::R960P)).unwrap();
        graph
            .create_encode_channel(0, 0, encode_attr(Resolution::R960P), true)
            .unwrap();
        graph
            .create_encode_channel(0, 1, encode_attr(Resolution::D1), false)
            .unwrap();
        graph.bind(CaptureOutput::primary(0), 0).unwrap();

        assert_eq!(graph.dependents_of(0), vec![0, 1]);
        assert!(graph.dependents_of(1).is_empty());
        assert_eq!(graph.captures_by_creation(), vec![1, 0]);
        assert_eq!(graph.encoders_by_creation(), vec![0, 1]);

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.groups[0].members, vec![0, 1]);
    }
}
