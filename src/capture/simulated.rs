//! In-process simulated hardware service
//!
//! Keeps its own view of every hardware object, rejects invalid calls with a
//! single generic error code the way real media libraries do, and produces
//! synthetic encoded units for channels that are actually fed by a streaming
//! capture channel. Every call is counted so sessions can be audited.

use super::traits::{HardwareError, HwResult, PollError, VideoHardware};
use super::types::{CaptureAttr, EncodeAttr, EncodedUnit, Resolution, SensorDescriptor};
use crate::graph::model::CaptureOutput;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Generic failure code returned for any rejected call
pub const HW_FAILURE: i32 = -1;

/// Sensors known to the simulated service: name, I2C address, max output
pub const SENSOR_CATALOG: &[(&str, u8, Resolution)] = &[
    ("ov9712", 0x30, Resolution::R960P),
    ("ov9713", 0x30, Resolution::R960P),
    ("ov9750", 0x36, Resolution::R960P),
    ("ar0141", 0x10, Resolution::R960P),
    ("gc1004", 0x3c, Resolution::R960P),
    ("jxh42", 0x30, Resolution::R960P),
    ("sc1035", 0x30, Resolution::R960P),
    ("sc1045", 0x30, Resolution::R960P),
];

/// Names of all sensors in the catalog
pub fn supported_sensors() -> Vec<&'static str> {
    SENSOR_CATALOG.iter().map(|(name, _, _)| *name).collect()
}

/// Hardware operations, used as call-count keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HwOp {
    SystemInit,
    SystemExit,
    EnableTuning,
    CreateCapture,
    DestroyCapture,
    ReconfigureCapture,
    StartStreaming,
    StopStreaming,
    CreateGroup,
    DestroyGroup,
    CreateEncode,
    DestroyEncode,
    StartReceiving,
    StopReceiving,
    Bind,
    Unbind,
    Poll,
    Release,
}

impl HwOp {
    fn name(&self) -> &'static str {
        match self {
            HwOp::SystemInit => "system_init",
            HwOp::SystemExit => "system_exit",
            HwOp::EnableTuning => "enable_tuning",
            HwOp::CreateCapture => "create_capture_channel",
            HwOp::DestroyCapture => "destroy_capture_channel",
            HwOp::ReconfigureCapture => "reconfigure_capture_channel",
            HwOp::StartStreaming => "start_streaming",
            HwOp::StopStreaming => "stop_streaming",
            HwOp::CreateGroup => "create_encode_group",
            HwOp::DestroyGroup => "destroy_encode_group",
            HwOp::CreateEncode => "create_encode_channel",
            HwOp::DestroyEncode => "destroy_encode_channel",
            HwOp::StartReceiving => "start_receiving",
            HwOp::StopReceiving => "stop_receiving",
            HwOp::Bind => "bind_data_path",
            HwOp::Unbind => "unbind_data_path",
            HwOp::Poll => "poll_encoded_unit",
            HwOp::Release => "release_encoded_unit",
        }
    }
}

struct SimCapture {
    attr: CaptureAttr,
    streaming: bool,
}

struct SimEncoder {
    group: u32,
    attr: EncodeAttr,
    receiving: bool,
    next_sequence: u64,
    last_emit: Option<Instant>,
}

#[derive(Default)]
struct SimState {
    initialized: bool,
    tuning: bool,
    captures: HashMap<u32, SimCapture>,
    groups: HashMap<u32, Vec<u32>>,
    encoders: HashMap<u32, SimEncoder>,
    edges: HashMap<CaptureOutput, u32>,
    calls: BTreeMap<(HwOp, Option<u32>), u64>,
    outstanding: HashMap<u32, HashSet<u64>>,
    polled: u64,
    released: u64,
    leaked: u64,
    faults: Vec<(HwOp, Option<u32>)>,
}

impl SimState {
    fn record(&mut self, op: HwOp, index: Option<u32>) -> HwResult<()> {
        *self.calls.entry((op, index)).or_insert(0) += 1;

        let injected = self
            .faults
            .iter()
            .position(|(fop, findex)| *fop == op && (findex.is_none() || *findex == index));
        if let Some(pos) = injected {
            self.faults.remove(pos);
            tracing::debug!("Injected fault fired: {}({:?})", op.name(), index);
            return Err(HardwareError::new(op.name(), index, HW_FAILURE));
        }
        Ok(())
    }

    fn reject(op: HwOp, index: Option<u32>, why: &str) -> HardwareError {
        tracing::debug!("Simulated hardware rejected {}({:?}): {}", op.name(), index, why);
        HardwareError::new(op.name(), index, HW_FAILURE)
    }

    fn require_init(&self, op: HwOp, index: Option<u32>) -> HwResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Self::reject(op, index, "system not initialized"))
        }
    }

    /// Whether frames reach this encoder: its group is bound to a streaming capture
    fn is_fed(&self, index: u32) -> bool {
        let Some(encoder) = self.encoders.get(&index) else {
            return false;
        };
        if !encoder.receiving {
            return false;
        }
        self.edges
            .iter()
            .filter(|(_, group)| **group == encoder.group)
            .any(|(output, _)| {
                self.captures
                    .get(&output.channel)
                    .map(|c| c.streaming)
                    .unwrap_or(false)
            })
    }
}

/// Simulated capture/encode hardware
pub struct SimulatedHardware {
    state: ParkingMutex<SimState>,
    frame_interval: Duration,
    idle_step: Duration,
    epoch: Instant,
}

impl SimulatedHardware {
    /// Create a simulated service producing 25 frames per second
    pub fn new() -> Self {
        Self::with_frame_interval(Duration::from_millis(40))
    }

    /// Create a simulated service producing one unit per channel every `interval`
    pub fn with_frame_interval(interval: Duration) -> Self {
        Self {
            state: ParkingMutex::new(SimState::default()),
            frame_interval: interval,
            idle_step: interval.min(Duration::from_millis(5)).max(Duration::from_millis(1)),
            epoch: Instant::now(),
        }
    }

    /// Make the next matching call fail once. `None` matches any index.
    pub fn inject_fault(&self, op: HwOp, index: Option<u32>) {
        self.state.lock().faults.push((op, index));
    }

    /// Number of calls of `op` made for `index`
    pub fn call_count(&self, op: HwOp, index: Option<u32>) -> u64 {
        self.state.lock().calls.get(&(op, index)).copied().unwrap_or(0)
    }

    /// Total number of calls of `op` across all indices
    pub fn total_calls(&self, op: HwOp) -> u64 {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|((o, _), _)| *o == op)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Every `(op, index)` pair that was called, with its count
    pub fn calls(&self) -> Vec<(HwOp, Option<u32>, u64)> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|((op, index), count)| (*op, *index, *count))
            .collect()
    }

    /// Units polled but not yet released
    pub fn outstanding_units(&self) -> usize {
        self.state.lock().outstanding.values().map(|s| s.len()).sum()
    }

    pub fn units_polled(&self) -> u64 {
        self.state.lock().polled
    }

    pub fn units_released(&self) -> u64 {
        self.state.lock().released
    }

    /// Units abandoned because their channel was destroyed before release
    pub fn units_leaked(&self) -> u64 {
        self.state.lock().leaked
    }

    /// Number of live captures, groups and encoders
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.captures.len() + state.groups.len() + state.encoders.len()
    }

    pub fn is_streaming(&self, index: u32) -> bool {
        self.state
            .lock()
            .captures
            .get(&index)
            .map(|c| c.streaming)
            .unwrap_or(false)
    }

    pub fn capture_attr(&self, index: u32) -> Option<CaptureAttr> {
        self.state.lock().captures.get(&index).map(|c| c.attr)
    }

    fn synth_unit(&self, index: u32, encoder: &mut SimEncoder) -> EncodedUnit {
        let sequence = encoder.next_sequence;
        encoder.next_sequence += 1;

        let fps = encoder.attr.frame_rate.fps_ceil().max(1) as u64;
        let gop = encoder.attr.gop_length.max(1) as u64;
        let keyframe = sequence % gop == 0;
        let base = (encoder.attr.bitrate_kbps as u64 * 1000 / 8 / fps).clamp(64, 64 * 1024);
        let size = (if keyframe { base * 4 } else { base }) as usize;

        EncodedUnit {
            channel: index,
            sequence,
            timestamp_us: self.epoch.elapsed().as_micros() as i64,
            keyframe,
            data: vec![(sequence & 0xff) as u8; size],
        }
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoHardware for SimulatedHardware {
    fn detect_sensor(&self, name: &str) -> HwResult<Option<SensorDescriptor>> {
        let lower = name.to_ascii_lowercase();
        Ok(SENSOR_CATALOG
            .iter()
            .find(|(n, _, _)| *n == lower)
            .map(|(n, addr, max)| SensorDescriptor {
                name: n.to_string(),
                i2c_address: *addr,
                max_resolution: *max,
            }))
    }

    fn system_init(&self, sensor: &SensorDescriptor) -> HwResult<()> {
        let mut state = self.state.lock();
        state.record(HwOp::SystemInit, None)?;
        if state.initialized {
            return Err(SimState::reject(HwOp::SystemInit, None, "already initialized"));
        }
        state.initialized = true;
        tracing::debug!("Simulated system up with sensor {}", sensor.name);
        Ok(())
    }

    fn system_exit(&self) -> HwResult<()> {
        let mut state = self.state.lock();
        state.record(HwOp::SystemExit, None)?;
        if !state.captures.is_empty() || !state.encoders.is_empty() || !state.groups.is_empty() {
            return Err(SimState::reject(HwOp::SystemExit, None, "objects still alive"));
        }
        state.initialized = false;
        state.tuning = false;
        Ok(())
    }

    fn enable_tuning(&self) -> HwResult<()> {
        let mut state = self.state.lock();
        state.record(HwOp::EnableTuning, None)?;
        state.require_init(HwOp::EnableTuning, None)?;
        state.tuning = true;
        Ok(())
    }

    fn create_capture_channel(&self, index: u32, attr: &CaptureAttr) -> HwResult<()> {
        let op = HwOp::CreateCapture;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        state.require_init(op, Some(index))?;
        if state.captures.contains_key(&index) {
            return Err(SimState::reject(op, Some(index), "exists"));
        }
        state.captures.insert(
            index,
            SimCapture {
                attr: *attr,
                streaming: false,
            },
        );
        Ok(())
    }

    fn destroy_capture_channel(&self, index: u32) -> HwResult<()> {
        let op = HwOp::DestroyCapture;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        match state.captures.get(&index) {
            None => return Err(SimState::reject(op, Some(index), "missing")),
            Some(c) if c.streaming => return Err(SimState::reject(op, Some(index), "streaming")),
            Some(_) => {}
        }
        if state.edges.keys().any(|o| o.channel == index) {
            return Err(SimState::reject(op, Some(index), "bound"));
        }
        state.captures.remove(&index);
        Ok(())
    }

    fn reconfigure_capture_channel(&self, index: u32, attr: &CaptureAttr) -> HwResult<()> {
        let op = HwOp::ReconfigureCapture;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        match state.captures.get_mut(&index) {
            None => Err(SimState::reject(op, Some(index), "missing")),
            Some(c) if c.streaming => Err(SimState::reject(op, Some(index), "streaming")),
            Some(c) => {
                c.attr = *attr;
                Ok(())
            }
        }
    }

    fn start_streaming(&self, index: u32) -> HwResult<()> {
        let op = HwOp::StartStreaming;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        if !state.tuning {
            return Err(SimState::reject(op, Some(index), "tuning not enabled"));
        }
        match state.captures.get_mut(&index) {
            None => Err(SimState::reject(op, Some(index), "missing")),
            Some(c) => {
                c.streaming = true;
                Ok(())
            }
        }
    }

    fn stop_streaming(&self, index: u32) -> HwResult<()> {
        let op = HwOp::StopStreaming;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        match state.captures.get_mut(&index) {
            None => Err(SimState::reject(op, Some(index), "missing")),
            Some(c) => {
                c.streaming = false;
                Ok(())
            }
        }
    }

    fn create_encode_group(&self, group: u32) -> HwResult<()> {
        let op = HwOp::CreateGroup;
        let mut state = self.state.lock();
        state.record(op, Some(group))?;
        state.require_init(op, Some(group))?;
        if state.groups.contains_key(&group) {
            return Err(SimState::reject(op, Some(group), "exists"));
        }
        state.groups.insert(group, Vec::new());
        Ok(())
    }

    fn destroy_encode_group(&self, group: u32) -> HwResult<()> {
        let op = HwOp::DestroyGroup;
        let mut state = self.state.lock();
        state.record(op, Some(group))?;
        match state.groups.get(&group) {
            None => return Err(SimState::reject(op, Some(group), "missing")),
            Some(members) if !members.is_empty() => {
                return Err(SimState::reject(op, Some(group), "not empty"))
            }
            Some(_) => {}
        }
        if state.edges.values().any(|g| *g == group) {
            return Err(SimState::reject(op, Some(group), "bound"));
        }
        state.groups.remove(&group);
        Ok(())
    }

    fn create_encode_channel(&self, group: u32, index: u32, attr: &EncodeAttr) -> HwResult<()> {
        let op = HwOp::CreateEncode;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        state.require_init(op, Some(index))?;
        if state.encoders.contains_key(&index) {
            return Err(SimState::reject(op, Some(index), "exists"));
        }
        let Some(members) = state.groups.get_mut(&group) else {
            return Err(SimState::reject(op, Some(index), "group missing"));
        };
        members.push(index);
        state.encoders.insert(
            index,
            SimEncoder {
                group,
                attr: *attr,
                receiving: false,
                next_sequence: 0,
                last_emit: None,
            },
        );
        Ok(())
    }

    fn destroy_encode_channel(&self, index: u32) -> HwResult<()> {
        let op = HwOp::DestroyEncode;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        let group = match state.encoders.get(&index) {
            None => return Err(SimState::reject(op, Some(index), "missing")),
            Some(e) if e.receiving => return Err(SimState::reject(op, Some(index), "receiving")),
            Some(e) => e.group,
        };
        state.encoders.remove(&index);
        if let Some(members) = state.groups.get_mut(&group) {
            members.retain(|m| *m != index);
        }
        if let Some(pending) = state.outstanding.remove(&index) {
            if !pending.is_empty() {
                tracing::warn!("Encode channel {} destroyed with {} unreleased unit(s)", index, pending.len());
                state.leaked += pending.len() as u64;
            }
        }
        Ok(())
    }

    fn start_receiving(&self, index: u32) -> HwResult<()> {
        let op = HwOp::StartReceiving;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        match state.encoders.get_mut(&index) {
            None => Err(SimState::reject(op, Some(index), "missing")),
            Some(e) => {
                e.receiving = true;
                e.last_emit = None;
                Ok(())
            }
        }
    }

    fn stop_receiving(&self, index: u32) -> HwResult<()> {
        let op = HwOp::StopReceiving;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        match state.encoders.get_mut(&index) {
            None => Err(SimState::reject(op, Some(index), "missing")),
            Some(e) => {
                e.receiving = false;
                Ok(())
            }
        }
    }

    fn bind_data_path(&self, output: CaptureOutput, group: u32) -> HwResult<()> {
        let op = HwOp::Bind;
        let mut state = self.state.lock();
        state.record(op, Some(output.channel))?;
        if !state.captures.contains_key(&output.channel) || !state.groups.contains_key(&group) {
            return Err(SimState::reject(op, Some(output.channel), "endpoint missing"));
        }
        if state.edges.contains_key(&output) {
            return Err(SimState::reject(op, Some(output.channel), "output bound"));
        }
        state.edges.insert(output, group);
        Ok(())
    }

    fn unbind_data_path(&self, output: CaptureOutput, group: u32) -> HwResult<()> {
        let op = HwOp::Unbind;
        let mut state = self.state.lock();
        state.record(op, Some(output.channel))?;
        if state.edges.get(&output) != Some(&group) {
            return Err(SimState::reject(op, Some(output.channel), "not bound"));
        }
        state.edges.remove(&output);
        Ok(())
    }

    fn poll_encoded_unit(&self, index: u32, timeout: Duration) -> Result<EncodedUnit, PollError> {
        let deadline = Instant::now() + timeout;
        let mut first = true;

        loop {
            let wait = {
                let mut state = self.state.lock();
                if first {
                    state
                        .record(HwOp::Poll, Some(index))
                        .map_err(PollError::Fault)?;
                    first = false;
                }
                if !state.encoders.contains_key(&index) {
                    return Err(PollError::Fault(SimState::reject(
                        HwOp::Poll,
                        Some(index),
                        "missing",
                    )));
                }

                if state.is_fed(index) {
                    let now = Instant::now();
                    let interval = self.frame_interval;
                    let due = state
                        .encoders
                        .get(&index)
                        .and_then(|e| e.last_emit)
                        .map(|t| t + interval)
                        .unwrap_or(now);

                    if due <= now {
                        let Some(encoder) = state.encoders.get_mut(&index) else {
                            return Err(PollError::Timeout);
                        };
                        encoder.last_emit = Some(now);
                        let unit = self.synth_unit(index, encoder);
                        state.polled += 1;
                        state.outstanding.entry(index).or_default().insert(unit.sequence);
                        return Ok(unit);
                    }
                    due - now
                } else {
                    self.idle_step
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Timeout);
            }
            std::thread::sleep(wait.min(deadline - now));
        }
    }

    fn release_encoded_unit(&self, index: u32, unit: EncodedUnit) -> HwResult<()> {
        let op = HwOp::Release;
        let mut state = self.state.lock();
        state.record(op, Some(index))?;
        let known = state
            .outstanding
            .get_mut(&index)
            .map(|pending| pending.remove(&unit.sequence))
            .unwrap_or(false);
        if !known {
            return Err(SimState::reject(op, Some(index), "unknown unit"));
        }
        state.released += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::FrameRate;

    fn sensor() -> SensorDescriptor {
        SimulatedHardware::new()
            .detect_sensor("sc1035")
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_detect_sensor() {
        let hw = SimulatedHardware::new();
        assert_eq!(hw.detect_sensor("OV9712").unwrap().unwrap().i2c_address, 0x30);
        assert!(hw.detect_sensor("imx999").unwrap().is_none());
        assert_eq!(supported_sensors().len(), 8);
    }

    #[test]
    fn test_rejects_without_init() {
        let hw = SimulatedHardware::new();
        let attr = CaptureAttr::new(Resolution::VGA, FrameRate::default(), 3);
        let err = hw.create_capture_channel(0, &attr).unwrap_err();
        assert_eq!(err.code, HW_FAILURE);
        assert_eq!(hw.call_count(HwOp::CreateCapture, Some(0)), 1);
    }

    #[test]
    fn test_produces_units_only_when_fed() {
        let hw = SimulatedHardware::with_frame_interval(Duration::from_millis(1));
        hw.system_init(&sensor()).unwrap();
        hw.enable_tuning().unwrap();
        let cap = CaptureAttr::new(Resolution::VGA, FrameRate::default(), 3);
        hw.create_capture_channel(0, &cap).unwrap();
        hw.create_encode_group(0).unwrap();
        let enc = EncodeAttr::h264_cbr(Resolution::VGA, FrameRate::default(), 1000);
        hw.create_encode_channel(0, 0, &enc).unwrap();
        hw.start_receiving(0).unwrap();

        // Not bound yet: nothing flows
        assert_eq!(
            hw.poll_encoded_unit(0, Duration::from_millis(5)),
            Err(PollError::Timeout)
        );

        hw.bind_data_path(CaptureOutput::new(0, 0), 0).unwrap();
        hw.start_streaming(0).unwrap();
        let unit = hw.poll_encoded_unit(0, Duration::from_millis(100)).unwrap();
        assert!(unit.keyframe);
        assert_eq!(hw.outstanding_units(), 1);

        hw.release_encoded_unit(0, unit).unwrap();
        assert_eq!(hw.outstanding_units(), 0);
        assert_eq!(hw.units_released(), 1);
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let hw = SimulatedHardware::new();
        hw.inject_fault(HwOp::SystemInit, None);
        assert!(hw.system_init(&sensor()).is_err());
        assert!(hw.system_init(&sensor()).is_ok());
    }
}
