//! Live resolution switching
//!
//! Moves one capture channel, and the encode channels it feeds, to a new
//! resolution while every other stream keeps running. The switch is a phase
//! state machine over the channel graph:
//!
//! ```text
//! Requested -> Stopped -> Drained -> Released -> Unbound
//!           -> Reconfigured -> Rebuilt -> Bound -> Streaming
//! ```
//!
//! A failed phase leaves the graph as the last successful call left it.
//! Calling [`ResolutionSwitcher::run`] again resumes at the failed phase; each
//! phase skips work the graph shows is already done.

use super::consumer::{ConsumerRegistry, ConsumerReport};
use crate::capture::types::{CaptureAttr, EncodeAttr, FrameRate, Resolution};
use crate::graph::{CaptureOutput, ChannelGraph, ChannelKind};
use crate::utils::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the capture channel itself changes resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchStrategy {
    /// Stop, apply new attributes to the same channel, restart
    #[default]
    ReinitInPlace,
    /// Destroy the channel and create it again at the new resolution
    Recreate,
}

impl std::str::FromStr for SwitchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reinit" | "reinit-in-place" | "reinitinplace" => Ok(SwitchStrategy::ReinitInPlace),
            "recreate" => Ok(SwitchStrategy::Recreate),
            other => Err(format!("unknown switch strategy: {other}")),
        }
    }
}

/// Target state of one encode channel after the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentEncode {
    pub index: u32,
    pub attr: EncodeAttr,
    pub group: u32,
    /// Found `group` instead of joining it
    #[serde(default)]
    pub create_group: bool,
    /// Capture output a founded group is bound to
    #[serde(default)]
    pub bind_to: Option<CaptureOutput>,
}

/// A requested resolution change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub capture_index: u32,
    pub resolution: Resolution,
    #[serde(default)]
    pub frame_rate: Option<FrameRate>,
    #[serde(default)]
    pub buffer_count: Option<u32>,
    pub dependents: Vec<DependentEncode>,
    #[serde(default)]
    pub strategy: SwitchStrategy,
}

/// Last completed phase of a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchPhase {
    /// Accepted, nothing touched
    Requested,
    /// Capture channel stopped streaming
    Stopped,
    /// Dependent consumers joined and receiving switched off
    Drained,
    /// Old dependent encode channels destroyed
    Released,
    /// Old bind edges removed and retired groups destroyed
    Unbound,
    /// Capture channel at the new resolution
    Reconfigured,
    /// Dependent encode channels created at their new attributes
    Rebuilt,
    /// Bind edges in place
    Bound,
    /// Capture streaming and dependents receiving again
    Streaming,
}

impl SwitchPhase {
    fn next(self) -> Option<SwitchPhase> {
        use SwitchPhase::*;
        match self {
            Requested => Some(Stopped),
            Stopped => Some(Drained),
            Drained => Some(Released),
            Released => Some(Unbound),
            Unbound => Some(Reconfigured),
            Reconfigured => Some(Rebuilt),
            Rebuilt => Some(Bound),
            Bound => Some(Streaming),
            Streaming => None,
        }
    }
}

impl std::fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What a completed switch did
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchOutcome {
    pub capture: CaptureAttr,
    pub previous: Resolution,
    /// Encode channels now receiving; callers respawn their consumers
    pub rebuilt: Vec<u32>,
    pub retired_groups: Vec<u32>,
    pub founded_groups: Vec<u32>,
    /// Existing groups fed by another capture that dependents moved into
    pub joined_groups: Vec<u32>,
    /// Reports of the consumers stopped during the drain
    pub drained: Vec<ConsumerReport>,
}

/// Fixed facts gathered before the first mutation
#[derive(Debug, Clone)]
struct SwitchLayout {
    previous: CaptureAttr,
    target: CaptureAttr,
    /// Edges leaving the capture channel when the switch started
    old_edges: Vec<(CaptureOutput, u32)>,
    /// Members of those groups
    old_members: Vec<u32>,
    /// Old groups some dependent rejoins
    kept_groups: BTreeSet<u32>,
    /// Old groups no dependent rejoins
    retired_groups: BTreeSet<u32>,
    /// Founded groups and the output each binds to
    founded: BTreeMap<u32, CaptureOutput>,
    /// Existing groups outside the switch that dependents join, with their feed
    joined: BTreeMap<u32, Option<CaptureOutput>>,
}

/// Executes one [`SwitchRequest`] against a channel graph
pub struct ResolutionSwitcher {
    request: SwitchRequest,
    phase: SwitchPhase,
    plan: Option<SwitchLayout>,
    capture_destroyed: bool,
    drained: Vec<ConsumerReport>,
}

impl ResolutionSwitcher {
    pub fn new(request: SwitchRequest) -> Self {
        Self {
            request,
            phase: SwitchPhase::Requested,
            plan: None,
            capture_destroyed: false,
            drained: Vec::new(),
        }
    }

    pub fn request(&self) -> &SwitchRequest {
        &self.request
    }

    /// Last completed phase
    pub fn phase(&self) -> SwitchPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == SwitchPhase::Streaming
    }

    /// Run the remaining phases
    ///
    /// `on_phase` is called after each completed phase.
    pub fn run(
        &mut self,
        graph: &mut ChannelGraph,
        consumers: &mut ConsumerRegistry,
        on_phase: &mut dyn FnMut(SwitchPhase),
    ) -> PipelineResult<SwitchOutcome> {
        if self.plan.is_none() {
            let plan = self.prepare(graph)?;
            tracing::info!(
                "Switching capture channel {} from {} to {} ({:?})",
                self.request.capture_index,
                plan.previous.resolution,
                plan.target.resolution,
                self.request.strategy
            );
            self.plan = Some(plan);
        }

        while let Some(next) = self.phase.next() {
            if let Err(e) = self.execute(next, graph, consumers) {
                tracing::error!(
                    "Switch of capture channel {} failed entering {}: {}",
                    self.request.capture_index,
                    next,
                    e
                );
                return Err(e);
            }
            self.phase = next;
            tracing::debug!(
                "Switch of capture channel {} reached {}",
                self.request.capture_index,
                next
            );
            on_phase(next);
        }

        self.outcome(graph)
    }

    fn plan(&self) -> PipelineResult<&SwitchLayout> {
        self.plan
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("switch has not been planned".to_string()))
    }

    // =========================================================================
    // Pre-flight
    // =========================================================================

    /// Validate the whole request against the current graph
    fn prepare(&self, graph: &ChannelGraph) -> PipelineResult<SwitchLayout> {
        let req = &self.request;
        let capture = graph
            .capture_channel(req.capture_index)
            .ok_or(PipelineError::NotCreated {
                kind: ChannelKind::Capture,
                index: req.capture_index,
            })?;

        let previous = capture.attr;
        let target = CaptureAttr {
            resolution: req.resolution,
            frame_rate: req.frame_rate.unwrap_or(previous.frame_rate),
            buffer_count: req.buffer_count.unwrap_or(previous.buffer_count),
        };
        graph.validate_capture_attr(req.capture_index, &target)?;

        let old_edges: Vec<(CaptureOutput, u32)> = graph
            .edges()
            .into_iter()
            .filter(|e| e.output.channel == req.capture_index)
            .map(|e| (e.output, e.group))
            .collect();
        let old_groups: BTreeSet<u32> = old_edges.iter().map(|(_, g)| *g).collect();
        let old_members = graph.dependents_of(req.capture_index);

        let mut seen = BTreeSet::new();
        for dep in &req.dependents {
            if !seen.insert(dep.index) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "encode channel {} listed twice",
                    dep.index
                )));
            }
            if graph.encode_channel(dep.index).is_some() && !old_members.contains(&dep.index) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "encode channel {} is not fed by capture channel {}",
                    dep.index, req.capture_index
                )));
            }
            graph.validate_encode_attr(dep.index, &dep.attr)?;
        }
        if let Some(missing) = old_members.iter().find(|m| !seen.contains(m)) {
            return Err(PipelineError::InvalidConfiguration(format!(
                "encode channel {missing} is fed by capture channel {} but has no target",
                req.capture_index
            )));
        }

        let mut kept_groups = BTreeSet::new();
        let mut founded: BTreeMap<u32, CaptureOutput> = BTreeMap::new();
        let mut joined: BTreeMap<u32, Option<CaptureOutput>> = BTreeMap::new();
        for dep in &req.dependents {
            if dep.create_group {
                if graph.group(dep.group).is_some() {
                    return Err(PipelineError::AlreadyCreated {
                        kind: ChannelKind::Group,
                        index: dep.group,
                    });
                }
                let output = dep.bind_to.ok_or_else(|| {
                    PipelineError::InvalidConfiguration(format!(
                        "encode group {} is founded without a capture output to bind",
                        dep.group
                    ))
                })?;
                if founded.insert(dep.group, output).is_some() {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "encode group {} founded twice",
                        dep.group
                    )));
                }
            } else if old_groups.contains(&dep.group) {
                kept_groups.insert(dep.group);
            } else if graph.group(dep.group).is_some() {
                joined.insert(dep.group, graph.output_for_group(dep.group));
            } else if !founded.contains_key(&dep.group) {
                return Err(PipelineError::GroupNotFound { group: dep.group });
            }
        }
        let retired_groups: BTreeSet<u32> = old_groups.difference(&kept_groups).copied().collect();

        // Outputs the switch frees up
        let freed: BTreeSet<CaptureOutput> = old_edges
            .iter()
            .filter(|(_, g)| retired_groups.contains(g))
            .map(|(o, _)| *o)
            .collect();
        let mut claimed = BTreeSet::new();
        for (group, output) in &founded {
            let source = if output.channel == req.capture_index {
                target.resolution
            } else {
                graph
                    .capture_channel(output.channel)
                    .map(|c| c.attr.resolution)
                    .ok_or(PipelineError::NotCreated {
                        kind: ChannelKind::Capture,
                        index: output.channel,
                    })?
            };
            if let Some(existing) = graph.edge_for_output(*output) {
                if !freed.contains(output) {
                    return Err(PipelineError::AlreadyBound {
                        output: *output,
                        group: existing,
                    });
                }
            }
            if !claimed.insert(*output) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "{output} claimed by more than one founded group"
                )));
            }
            Self::check_fit(&req.dependents, *group, &source)?;
        }
        for group in &kept_groups {
            Self::check_fit(&req.dependents, *group, &target.resolution)?;
        }
        for (group, output) in &joined {
            // An unbound group has no source to fit yet
            let Some(output) = output else { continue };
            let source = graph
                .capture_channel(output.channel)
                .map(|c| c.attr.resolution)
                .ok_or(PipelineError::NotCreated {
                    kind: ChannelKind::Capture,
                    index: output.channel,
                })?;
            Self::check_fit(&req.dependents, *group, &source)?;
        }

        Ok(SwitchLayout {
            previous,
            target,
            old_edges,
            old_members,
            kept_groups,
            retired_groups,
            founded,
            joined,
        })
    }

    fn check_fit(dependents: &[DependentEncode], group: u32, source: &Resolution) -> PipelineResult<()> {
        for dep in dependents.iter().filter(|d| d.group == group) {
            if !dep.attr.resolution.fits_within(source) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "encode channel {} at {} cannot be fed from {}",
                    dep.index, dep.attr.resolution, source
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Phases
    // =========================================================================

    fn execute(
        &mut self,
        phase: SwitchPhase,
        graph: &mut ChannelGraph,
        consumers: &mut ConsumerRegistry,
    ) -> PipelineResult<()> {
        let capture = self.request.capture_index;
        match phase {
            SwitchPhase::Requested => Ok(()),
            SwitchPhase::Stopped => {
                if graph.capture_channel(capture).is_some() {
                    graph.stop_streaming(capture)?;
                }
                Ok(())
            }
            SwitchPhase::Drained => self.drain(graph, consumers),
            SwitchPhase::Released => self.release(graph),
            SwitchPhase::Unbound => self.unbind(graph),
            SwitchPhase::Reconfigured => self.reconfigure(graph),
            SwitchPhase::Rebuilt => self.rebuild(graph),
            SwitchPhase::Bound => self.rebind(graph),
            SwitchPhase::Streaming => self.resume(graph),
        }
    }

    fn drain(&mut self, graph: &mut ChannelGraph, consumers: &mut ConsumerRegistry) -> PipelineResult<()> {
        let members = self.plan()?.old_members.clone();

        let attached: Vec<u32> = members
            .iter()
            .copied()
            .filter(|m| consumers.is_active(*m))
            .collect();
        if !attached.is_empty() {
            let reports = consumers.stop(graph, &attached);
            self.drained.extend(reports);
        }

        for index in members {
            if graph.encode_channel(index).is_some() {
                graph.stop_receiving(index)?;
            }
        }
        Ok(())
    }

    fn release(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        let plan = self.plan()?;
        let old_groups: BTreeSet<u32> = plan.old_edges.iter().map(|(_, g)| *g).collect();
        let members = plan.old_members.clone();

        // Newest first, groups left in place
        for index in members.into_iter().rev() {
            let belongs = graph
                .encode_channel(index)
                .map(|e| old_groups.contains(&e.group))
                .unwrap_or(false);
            if belongs {
                graph.destroy_encode_channel(index, false)?;
            }
        }
        Ok(())
    }

    fn unbind(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        let plan = self.plan()?.clone();
        let recreate = self.request.strategy == SwitchStrategy::Recreate;

        for (output, group) in &plan.old_edges {
            let retire = plan.retired_groups.contains(group);
            if (recreate || retire) && graph.edge_for_output(*output) == Some(*group) {
                graph.unbind(*output, *group)?;
            }
        }
        for group in &plan.retired_groups {
            if graph.group(*group).is_some() {
                graph.destroy_encode_group(*group)?;
            }
        }
        Ok(())
    }

    fn reconfigure(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        let capture = self.request.capture_index;
        let target = self.plan()?.target;

        match self.request.strategy {
            SwitchStrategy::ReinitInPlace => {
                graph.reconfigure_capture_channel(
                    capture,
                    target.resolution,
                    Some(target.frame_rate),
                    Some(target.buffer_count),
                )?;
            }
            SwitchStrategy::Recreate => {
                if !self.capture_destroyed {
                    if graph.capture_channel(capture).is_some() {
                        graph.destroy_capture_channel(capture)?;
                    }
                    self.capture_destroyed = true;
                }
                if graph.capture_channel(capture).is_none() {
                    graph.create_capture_channel(capture, target)?;
                }
            }
        }
        Ok(())
    }

    fn rebuild(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        for dep in &self.request.dependents {
            if let Some(existing) = graph.encode_channel(dep.index) {
                if existing.group == dep.group && existing.attr == dep.attr {
                    continue;
                }
                return Err(PipelineError::AlreadyCreated {
                    kind: ChannelKind::Encode,
                    index: dep.index,
                });
            }
            let found = dep.create_group && graph.group(dep.group).is_none();
            graph.create_encode_channel(dep.group, dep.index, dep.attr, found)?;
        }
        Ok(())
    }

    fn rebind(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        let plan = self.plan()?.clone();

        for (output, group) in &plan.old_edges {
            if plan.kept_groups.contains(group) && graph.edge_for_output(*output) != Some(*group) {
                graph.bind(*output, *group)?;
            }
        }
        for (group, output) in &plan.founded {
            if graph.edge_for_output(*output) != Some(*group) {
                graph.bind(*output, *group)?;
            }
        }
        Ok(())
    }

    fn resume(&mut self, graph: &mut ChannelGraph) -> PipelineResult<()> {
        let capture = self.request.capture_index;
        graph.start_streaming(capture)?;

        // Founded and joined groups may be fed by another capture
        let plan = self.plan()?;
        let other_sources: BTreeSet<u32> = plan
            .founded
            .values()
            .copied()
            .chain(plan.joined.values().flatten().copied())
            .map(|o| o.channel)
            .filter(|c| *c != capture)
            .collect();
        for source in other_sources {
            graph.start_streaming(source)?;
        }

        for dep in &self.request.dependents {
            let receiving = graph
                .encode_channel(dep.index)
                .map(|e| e.receiving)
                .unwrap_or(false);
            if !receiving {
                graph.start_receiving(dep.index)?;
            }
        }
        Ok(())
    }

    fn outcome(&self, graph: &ChannelGraph) -> PipelineResult<SwitchOutcome> {
        let plan = self.plan()?;
        let capture = graph
            .capture_channel(self.request.capture_index)
            .map(|c| c.attr)
            .unwrap_or(plan.target);

        tracing::info!(
            "Capture channel {} switched {} -> {}",
            self.request.capture_index,
            plan.previous.resolution,
            capture.resolution
        );
        Ok(SwitchOutcome {
            capture,
            previous: plan.previous.resolution,
            rebuilt: self.request.dependents.iter().map(|d| d.index).collect(),
            retired_groups: plan.retired_groups.iter().copied().collect(),
            founded_groups: plan.founded.keys().copied().collect(),
            joined_groups: plan.joined.keys().copied().collect(),
            drained: self.drained.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{HwOp, SimulatedHardware};
    use crate::capture::traits::VideoHardware;
    use crate::recorder::consumer::{ConsumerConfig, ConsumerExit};
    use crate::recorder::sink::NullSink;
    use crate::utils::error::ErrorKind;
    use std::sync::Arc;
    use std::time::Duration;

    const RATE: FrameRate = FrameRate::new(25, 1);

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout: Duration::from_millis(20),
            frame_limit: None,
        }
    }

    /// 960p + VGA captures, encoders 0 (960p) and 1 (D1) in group 0 on capture 0
    fn sample_graph() -> (Arc<SimulatedHardware>, ChannelGraph, ConsumerRegistry) {
        let hw = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(2)));
        let sensor = hw.detect_sensor("sc1035").unwrap().unwrap();
        hw.system_init(&sensor).unwrap();

        let mut graph = ChannelGraph::new(hw.clone());
        graph.set_sensor_limit(Some(sensor.max_resolution));
        graph
            .create_capture_channel(0, CaptureAttr::new(Resolution::R960P, RATE, 3))
            .unwrap();
        graph
            .create_capture_channel(1, CaptureAttr::new(Resolution::VGA, RATE, 4))
            .unwrap();
        graph
            .create_encode_channel(0, 0, EncodeAttr::h264_cbr(Resolution::R960P, RATE, 2000), true)
            .unwrap();
        graph
            .create_encode_channel(0, 1, EncodeAttr::h264_cbr(Resolution::D1, RATE, 1000), false)
            .unwrap();
        graph.bind(CaptureOutput::primary(0), 0).unwrap();
        hw.enable_tuning().unwrap();
        graph.start_streaming(0).unwrap();
        graph.start_streaming(1).unwrap();

        let mut consumers = ConsumerRegistry::new();
        for index in [0, 1] {
            graph.start_receiving(index).unwrap();
            consumers
                .spawn(&mut graph, index, Box::new(NullSink), config())
                .unwrap();
        }
        (hw, graph, consumers)
    }

    fn sample_request(strategy: SwitchStrategy) -> SwitchRequest {
        SwitchRequest {
            capture_index: 0,
            resolution: Resolution::R720P,
            frame_rate: None,
            buffer_count: None,
            dependents: vec![
                DependentEncode {
                    index: 0,
                    attr: EncodeAttr::h264_cbr(Resolution::R720P, RATE, 2000),
                    group: 0,
                    create_group: false,
                    bind_to: None,
                },
                DependentEncode {
                    index: 1,
                    attr: EncodeAttr::h264_cbr(Resolution::VGA, RATE, 1000),
                    group: 1,
                    create_group: true,
                    bind_to: Some(CaptureOutput::primary(1)),
                },
            ],
            strategy,
        }
    }

    #[test]
    fn test_reinit_in_place_preserves_rate_and_buffers() {
        let (hw, mut graph, mut consumers) = sample_graph();
        let mut phases = Vec::new();
        let mut switcher = ResolutionSwitcher::new(sample_request(SwitchStrategy::ReinitInPlace));

        let outcome = switcher
            .run(&mut graph, &mut consumers, &mut |p| phases.push(p))
            .unwrap();

        assert!(switcher.is_complete());
        assert_eq!(phases.first(), Some(&SwitchPhase::Stopped));
        assert_eq!(phases.last(), Some(&SwitchPhase::Streaming));
        assert_eq!(phases.len(), 8);

        let capture = graph.capture_channel(0).unwrap();
        assert_eq!(capture.attr.resolution, Resolution::R720P);
        assert_eq!(capture.attr.frame_rate, RATE);
        assert_eq!(capture.attr.buffer_count, 3);
        assert!(capture.is_streaming());
        assert_eq!(outcome.previous, Resolution::R960P);

        // Same channel, no destroy
        assert_eq!(hw.call_count(HwOp::CreateCapture, Some(0)), 1);
        assert_eq!(hw.call_count(HwOp::DestroyCapture, Some(0)), 0);
        assert_eq!(hw.call_count(HwOp::ReconfigureCapture, Some(0)), 1);
        // Kept group stays bound throughout
        assert_eq!(hw.total_calls(HwOp::Unbind), 0);

        assert_eq!(graph.edge_for_output(CaptureOutput::primary(0)), Some(0));
        assert_eq!(graph.edge_for_output(CaptureOutput::primary(1)), Some(1));
        assert_eq!(graph.encode_channel(1).unwrap().group, 1);
        assert_eq!(outcome.founded_groups, vec![1]);
        assert!(outcome.retired_groups.is_empty());
        assert_eq!(outcome.drained.len(), 2);
        assert!(outcome
            .drained
            .iter()
            .all(|r| r.exit == ConsumerExit::Stopped));
        assert!(graph.receiving_encoders().len() == 2);
        assert!(consumers.active().is_empty());

        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_overrides_replace_rate_and_buffers() {
        let (_hw, mut graph, mut consumers) = sample_graph();
        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        request.frame_rate = Some(FrameRate::new(15, 1));
        request.buffer_count = Some(2);

        ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();

        let attr = graph.capture_channel(0).unwrap().attr;
        assert_eq!(attr.frame_rate, FrameRate::new(15, 1));
        assert_eq!(attr.buffer_count, 2);
    }

    #[test]
    fn test_recreate_rebinds_kept_group() {
        let (hw, mut graph, mut consumers) = sample_graph();
        ResolutionSwitcher::new(sample_request(SwitchStrategy::Recreate))
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();

        assert_eq!(hw.call_count(HwOp::CreateCapture, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::DestroyCapture, Some(0)), 1);
        assert_eq!(hw.call_count(HwOp::Unbind, Some(0)), 1);
        assert_eq!(hw.call_count(HwOp::Bind, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::CreateEncode, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::DestroyEncode, Some(0)), 1);
        // Group 0 was never destroyed
        assert_eq!(hw.call_count(HwOp::DestroyGroup, Some(0)), 0);

        let capture = graph.capture_channel(0).unwrap();
        assert_eq!(capture.attr, CaptureAttr::new(Resolution::R720P, RATE, 3));
        assert!(hw.is_streaming(0));
        assert_eq!(hw.units_leaked(), 0);
    }

    #[test]
    fn test_unrelated_stream_undisturbed() {
        let (hw, mut graph, mut consumers) = sample_graph();

        // A third stream on capture 1
        add_capture1_stream(&mut graph, &mut consumers);

        let mut request = sample_request(SwitchStrategy::Recreate);
        request.dependents[1] = DependentEncode {
            index: 1,
            attr: EncodeAttr::h264_cbr(Resolution::VGA, RATE, 1000),
            group: 0,
            create_group: false,
            bind_to: None,
        };
        let outcome = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();

        assert_eq!(outcome.drained.len(), 2);
        assert!(consumers.is_active(2));
        assert!(outcome.drained.iter().all(|r| r.channel != 2));
        assert_eq!(hw.call_count(HwOp::StopStreaming, Some(1)), 0);
        assert_eq!(hw.call_count(HwOp::StopReceiving, Some(2)), 0);

        consumers.stop_all(&mut graph);
    }

    /// Adds encoder 2 in group 2, bound to capture 1, with a running consumer
    fn add_capture1_stream(graph: &mut ChannelGraph, consumers: &mut ConsumerRegistry) {
        graph
            .create_encode_channel(2, 2, EncodeAttr::h264_cbr(Resolution::VGA, RATE, 500), true)
            .unwrap();
        graph.bind(CaptureOutput::primary(1), 2).unwrap();
        graph.start_receiving(2).unwrap();
        consumers
            .spawn(graph, 2, Box::new(NullSink), config())
            .unwrap();
    }

    #[test]
    fn test_dependent_joins_group_on_other_capture() {
        let (hw, mut graph, mut consumers) = sample_graph();
        add_capture1_stream(&mut graph, &mut consumers);

        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        request.dependents[1] = DependentEncode {
            index: 1,
            attr: EncodeAttr::h264_cbr(Resolution::VGA, RATE, 1000),
            group: 2,
            create_group: false,
            bind_to: None,
        };
        let outcome = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();

        assert_eq!(outcome.joined_groups, vec![2]);
        assert!(outcome.founded_groups.is_empty());
        assert_eq!(graph.group(2).unwrap().members, vec![2, 1]);
        assert_eq!(graph.group(0).unwrap().members, vec![0]);
        assert_eq!(graph.encode_channel(1).unwrap().group, 2);
        assert!(graph.encode_channel(1).unwrap().receiving);

        // Group 2 stayed bound and its stream kept running
        assert_eq!(graph.edge_for_output(CaptureOutput::primary(1)), Some(2));
        assert_eq!(hw.call_count(HwOp::Unbind, Some(2)), 0);
        assert_eq!(hw.call_count(HwOp::StopStreaming, Some(1)), 0);
        assert!(consumers.is_active(2));
        assert!(hw.is_streaming(1));

        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_joined_group_must_fit_its_source() {
        let (hw, mut graph, mut consumers) = sample_graph();
        add_capture1_stream(&mut graph, &mut consumers);

        // D1 does not fit in capture 1's VGA
        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        request.dependents[1] = DependentEncode {
            index: 1,
            attr: EncodeAttr::h264_cbr(Resolution::D1, RATE, 1000),
            group: 2,
            create_group: false,
            bind_to: None,
        };
        let err = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(hw.is_streaming(0));
        assert_eq!(graph.encode_channel(1).unwrap().group, 0);

        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_missing_group_is_rejected() {
        let (_hw, mut graph, mut consumers) = sample_graph();
        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        request.dependents[1].group = 9;
        request.dependents[1].create_group = false;
        request.dependents[1].bind_to = None;

        let err = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GroupNotFound);
        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_retired_group_is_destroyed() {
        let (hw, mut graph, mut consumers) = sample_graph();
        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        // Both channels leave group 0 for a new group 3 on the same output
        for dep in request.dependents.iter_mut() {
            dep.group = 3;
            dep.create_group = false;
            dep.bind_to = None;
        }
        request.dependents[0].create_group = true;
        request.dependents[0].bind_to = Some(CaptureOutput::primary(0));

        let outcome = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();

        assert_eq!(outcome.retired_groups, vec![0]);
        assert!(graph.group(0).is_none());
        assert_eq!(hw.call_count(HwOp::DestroyGroup, Some(0)), 1);
        assert_eq!(graph.edge_for_output(CaptureOutput::primary(0)), Some(3));
        assert_eq!(graph.group(3).unwrap().members, vec![0, 1]);
    }

    #[test]
    fn test_preflight_rejects_uncovered_member() {
        let (hw, mut graph, mut consumers) = sample_graph();
        let mut request = sample_request(SwitchStrategy::Recreate);
        request.dependents.truncate(1);

        let err = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        // Nothing was touched
        assert!(hw.is_streaming(0));
        assert_eq!(consumers.active(), vec![0, 1]);
        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_preflight_rejects_oversized_resolution() {
        let (_hw, mut graph, mut consumers) = sample_graph();
        let mut request = sample_request(SwitchStrategy::ReinitInPlace);
        request.resolution = Resolution::R1080P;

        let err = ResolutionSwitcher::new(request)
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        consumers.stop_all(&mut graph);
    }

    #[test]
    fn test_failure_then_resume() {
        let (hw, mut graph, mut consumers) = sample_graph();
        let mut switcher = ResolutionSwitcher::new(sample_request(SwitchStrategy::Recreate));
        hw.inject_fault(HwOp::CreateEncode, Some(1));

        let err = switcher
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert_eq!(switcher.phase(), SwitchPhase::Reconfigured);
        // Encoder 0 made it, encoder 1 and its group did not
        assert!(graph.encode_channel(0).is_some());
        assert!(graph.encode_channel(1).is_none());
        assert!(graph.group(1).is_none());

        let outcome = switcher
            .run(&mut graph, &mut consumers, &mut |_| {})
            .unwrap();
        assert!(switcher.is_complete());
        assert_eq!(outcome.rebuilt, vec![0, 1]);
        assert_eq!(hw.call_count(HwOp::CreateEncode, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::CreateCapture, Some(0)), 2);
        assert_eq!(hw.call_count(HwOp::DestroyCapture, Some(0)), 1);
        assert_eq!(graph.encode_channel(1).unwrap().group, 1);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "recreate".parse::<SwitchStrategy>().unwrap(),
            SwitchStrategy::Recreate
        );
        assert_eq!(
            "reinit".parse::<SwitchStrategy>().unwrap(),
            SwitchStrategy::ReinitInPlace
        );
        assert!("rebuild".parse::<SwitchStrategy>().is_err());
    }
}
