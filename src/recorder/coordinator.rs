//! Pipeline controller
//!
//! Sequences a whole session over the channel graph: detect sensor, build the
//! graph, stream, switch resolution, tear down. The controller owns no
//! invariants of its own; the graph checks every step.

use super::consumer::{ConsumerExit, ConsumerRegistry, ConsumerReport};
use super::sink::{CountingSink, FileSink, UnitSink};
use super::state::{PipelineEvent, SessionState, SessionSummary, SwitchRecord};
use super::switcher::{ResolutionSwitcher, SwitchOutcome, SwitchRequest};
use crate::capture::traits::VideoHardware;
use crate::capture::types::{EncodeAttr, SensorDescriptor};
use crate::config::PipelineConfig;
use crate::graph::{ChannelGraph, ChannelKind};
use crate::utils::error::{ErrorRecord, PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Builds the sink for each consumer
pub type SinkFactory = Box<dyn Fn(u32, &EncodeAttr) -> PipelineResult<Box<dyn UnitSink>> + Send>;

/// Sleep step of [`PipelineController::run_for`]
const RUN_TICK: Duration = Duration::from_millis(10);

/// Drives one capture/encode session
pub struct PipelineController {
    session_id: Uuid,

    /// Current session state
    state: Arc<RwLock<SessionState>>,

    config: PipelineConfig,

    graph: ChannelGraph,

    consumers: ConsumerRegistry,

    sensor: Option<SensorDescriptor>,

    system_up: bool,

    /// Tuning is enabled once, before the first stream-on
    tuning_enabled: bool,

    /// Switch left unfinished by a failure
    pending_switch: Option<ResolutionSwitcher>,

    sink_factory: Option<SinkFactory>,

    started_at: Option<DateTime<Utc>>,

    ended_at: Option<DateTime<Utc>>,

    switches: Vec<SwitchRecord>,

    errors: Vec<ErrorRecord>,

    /// Event broadcaster
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl PipelineController {
    pub fn new(hw: Arc<dyn VideoHardware>, config: PipelineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let graph = ChannelGraph::with_limits(hw, config.limits);
        Self {
            session_id: Uuid::new_v4(),
            state: Arc::new(RwLock::new(SessionState::Idle)),
            config,
            graph,
            consumers: ConsumerRegistry::new(),
            sensor: None,
            system_up: false,
            tuning_enabled: false,
            pending_switch: None,
            sink_factory: None,
            started_at: None,
            ended_at: None,
            switches: Vec::new(),
            errors: Vec::new(),
            event_tx,
        }
    }

    /// Replace the default sink selection
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = Some(factory);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn graph(&self) -> &ChannelGraph {
        &self.graph
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sensor(&self) -> Option<&SensorDescriptor> {
        self.sensor.as_ref()
    }

    /// Encode channels with a live consumer
    pub fn active_consumers(&self) -> Vec<u32> {
        self.consumers.active()
    }

    fn transition(&self, to: SessionState) -> PipelineResult<()> {
        let from = *self.state.read();
        if !from.can_transition_to(&to) {
            return Err(PipelineError::InvalidState(format!(
                "cannot go from {from} to {to}"
            )));
        }
        if from != to {
            *self.state.write() = to;
            tracing::debug!("Session {}: {} -> {}", self.session_id, from, to);
            let _ = self.event_tx.send(PipelineEvent::StateChanged { from, to });
        }
        Ok(())
    }

    fn require(&self, allowed: &[SessionState], what: &str) -> PipelineResult<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(PipelineError::InvalidState(format!("cannot {what} while {current}")))
        }
    }

    fn record_error(&mut self, error: &PipelineError) {
        let record = ErrorRecord::from(error);
        let _ = self.event_tx.send(PipelineEvent::Error(record.clone()));
        self.errors.push(record);
    }

    fn publish_reports(&self, reports: &[ConsumerReport]) {
        for report in reports {
            let _ = self
                .event_tx
                .send(PipelineEvent::ConsumerStopped(report.clone()));
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Detect the sensor, bring the system up and build the configured graph
    pub fn setup(&mut self) -> PipelineResult<()> {
        self.require(&[SessionState::Idle], "set up")?;
        if let Err(e) = self.build() {
            tracing::error!("Session setup failed: {}", e);
            self.record_error(&e);
            return Err(e);
        }
        self.transition(SessionState::Configured)?;
        tracing::info!("Session {} configured", self.session_id);
        Ok(())
    }

    fn build(&mut self) -> PipelineResult<()> {
        self.config.validate()?;

        let hw = self.graph.hardware().clone();
        let sensor = hw
            .detect_sensor(&self.config.sensor)?
            .ok_or_else(|| PipelineError::SensorNotFound(self.config.sensor.clone()))?;
        tracing::info!(
            "Detected sensor {} (max {})",
            sensor.name,
            sensor.max_resolution
        );

        hw.system_init(&sensor)?;
        self.system_up = true;
        self.graph.set_sensor_limit(Some(sensor.max_resolution));
        self.sensor = Some(sensor);

        for capture in &self.config.captures {
            self.graph.create_capture_channel(capture.index, capture.attr())?;
        }
        for encoder in &self.config.encoders {
            self.graph.create_encode_channel(
                encoder.group,
                encoder.index,
                encoder.attr(),
                encoder.create_group,
            )?;
        }
        for binding in &self.config.bindings {
            self.graph.bind(binding.output(), binding.group)?;
        }
        Ok(())
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Enable tuning, start every capture channel and spawn consumers
    pub fn start(&mut self) -> PipelineResult<()> {
        self.require(&[SessionState::Configured], "start")?;
        if let Err(e) = self.start_streams() {
            tracing::error!("Session start failed: {}", e);
            self.record_error(&e);
            return Err(e);
        }
        self.started_at = Some(Utc::now());
        self.transition(SessionState::Streaming)?;
        tracing::info!(
            "Session {} streaming with {} consumer(s)",
            self.session_id,
            self.consumers.active().len()
        );
        Ok(())
    }

    fn start_streams(&mut self) -> PipelineResult<()> {
        if !self.tuning_enabled {
            self.graph.hardware().enable_tuning()?;
            self.tuning_enabled = true;
        }
        for index in self.graph.captures_by_creation() {
            self.graph.start_streaming(index)?;
        }
        for index in self.graph.encoders_by_creation() {
            if !self.graph.encode_channel(index).map(|e| e.receiving).unwrap_or(false) {
                self.graph.start_receiving(index)?;
            }
            self.spawn_consumer(index)?;
        }
        Ok(())
    }

    fn make_sink(&self, index: u32, attr: &EncodeAttr) -> PipelineResult<Box<dyn UnitSink>> {
        if let Some(factory) = &self.sink_factory {
            return factory(index, attr);
        }
        match &self.config.output_dir {
            Some(dir) => Ok(Box::new(FileSink::create(dir, index, attr.payload)?)),
            None => Ok(Box::new(CountingSink::new())),
        }
    }

    fn spawn_consumer(&mut self, index: u32) -> PipelineResult<()> {
        let attr = self
            .graph
            .encode_channel(index)
            .map(|e| e.attr)
            .ok_or(PipelineError::NotCreated {
                kind: ChannelKind::Encode,
                index,
            })?;
        let sink = self.make_sink(index, &attr)?;
        let config = self.config.consumer.consumer_config();
        self.consumers.spawn(&mut self.graph, index, sink, config)?;
        let _ = self.event_tx.send(PipelineEvent::ConsumerStarted(index));
        Ok(())
    }

    /// Stream until `duration` elapses, `stop` is raised, or every consumer exits
    pub fn run_for(&mut self, duration: Duration, stop: &AtomicBool) -> PipelineResult<()> {
        self.require(&[SessionState::Streaming], "run")?;
        let deadline = Instant::now() + duration;

        tracing::info!("Streaming for up to {:?}", duration);
        while Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                tracing::info!("Stop requested");
                break;
            }
            if self.consumers.all_finished() {
                tracing::debug!("All consumers have exited");
                break;
            }
            std::thread::sleep(RUN_TICK.min(deadline.saturating_duration_since(Instant::now())));
        }

        let reaped = self.consumers.reap(&mut self.graph);
        self.publish_reports(&reaped);
        for report in &reaped {
            if let ConsumerExit::Faulted { message, .. } = &report.exit {
                tracing::warn!("Consumer {} faulted: {}", report.channel, message);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Resolution switch
    // =========================================================================

    /// Switch a capture channel's resolution while other streams keep running
    ///
    /// After a failure the session stays in `Switching`; calling this again
    /// with the same request resumes the unfinished switch.
    pub fn switch_resolution(&mut self, request: SwitchRequest) -> PipelineResult<SwitchOutcome> {
        self.require(
            &[SessionState::Streaming, SessionState::Switching],
            "switch resolution",
        )?;

        let mut switcher = match self.pending_switch.take() {
            Some(pending) if pending.request() == &request => {
                tracing::info!("Resuming switch from {}", pending.phase());
                pending
            }
            Some(pending) => {
                let error = PipelineError::InvalidState(format!(
                    "a switch of capture channel {} is unfinished",
                    pending.request().capture_index
                ));
                self.pending_switch = Some(pending);
                return Err(error);
            }
            None => ResolutionSwitcher::new(request),
        };
        self.transition(SessionState::Switching)?;

        let tx = self.event_tx.clone();
        let capture = switcher.request().capture_index;
        let result = switcher.run(&mut self.graph, &mut self.consumers, &mut |phase| {
            let _ = tx.send(PipelineEvent::SwitchPhase { capture, phase });
        });

        match result {
            Ok(outcome) => {
                self.publish_reports(&outcome.drained);
                for index in &outcome.rebuilt {
                    if let Err(e) = self.spawn_consumer(*index) {
                        self.record_error(&e);
                        return Err(e);
                    }
                }
                self.switches.push(SwitchRecord {
                    capture,
                    from: outcome.previous,
                    to: outcome.capture.resolution,
                    strategy: switcher.request().strategy,
                    rebuilt: outcome.rebuilt.clone(),
                    completed_at: Utc::now(),
                });
                self.transition(SessionState::Streaming)?;
                Ok(outcome)
            }
            Err(e) => {
                self.record_error(&e);
                self.pending_switch = Some(switcher);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Release everything in reverse creation order
    ///
    /// Skips whatever is already gone, so it also finishes a session left
    /// half built or half switched. Can be called again after a failure.
    pub fn teardown(&mut self) -> PipelineResult<SessionSummary> {
        self.transition(SessionState::TearingDown)?;
        tracing::info!("Tearing down session {}", self.session_id);

        if let Err(e) = self.release_all() {
            tracing::error!("Teardown failed: {}", e);
            self.record_error(&e);
            return Err(e);
        }

        self.pending_switch = None;
        self.ended_at = Some(Utc::now());
        let summary = self.summary();
        self.transition(SessionState::Idle)?;

        tracing::info!(
            "Session {} ended: {} switch(es), {} unit(s)",
            self.session_id,
            summary.switches.len(),
            summary.total_frames()
        );
        Ok(summary)
    }

    fn release_all(&mut self) -> PipelineResult<()> {
        let reports = self.consumers.stop_all(&mut self.graph);
        self.publish_reports(&reports);

        let encoders = self.graph.encoders_by_creation();
        for index in encoders.iter().rev() {
            self.graph.stop_receiving(*index)?;
        }
        let captures = self.graph.captures_by_creation();
        for index in captures.iter().rev() {
            self.graph.stop_streaming(*index)?;
        }
        for edge in self.graph.edges().into_iter().rev() {
            self.graph.unbind(edge.output, edge.group)?;
        }

        for index in encoders.into_iter().rev() {
            let last_member = self
                .graph
                .encode_channel(index)
                .and_then(|e| self.graph.group(e.group))
                .map(|g| g.members.len() == 1)
                .unwrap_or(false);
            self.graph.destroy_encode_channel(index, last_member)?;
        }
        // Groups whose members were destroyed by a failed switch
        for group in self.graph.group_ids().into_iter().rev() {
            self.graph.destroy_encode_group(group)?;
        }
        for index in captures.into_iter().rev() {
            self.graph.destroy_capture_channel(index)?;
        }

        if self.system_up {
            self.graph.hardware().system_exit()?;
            self.system_up = false;
            self.tuning_enabled = false;
        }
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Setup, stream, optional configured switch, stream, teardown
    ///
    /// On failure the session is still torn down before the error returns.
    pub fn run_session(&mut self, stop: &AtomicBool) -> PipelineResult<SessionSummary> {
        let duration = self.config.run_duration();
        let plan = self.config.switch.clone();

        let streamed = self.setup().and_then(|_| self.start()).and_then(|_| {
            self.run_for(duration, stop)?;
            if let Some(plan) = plan {
                if !stop.load(Ordering::Relaxed) {
                    self.switch_resolution(plan.to_request())?;
                    self.run_for(duration, stop)?;
                }
            }
            Ok(())
        });

        match streamed {
            Ok(()) => self.teardown(),
            Err(e) => {
                if let Err(cleanup) = self.teardown() {
                    tracing::error!("Cleanup after failure also failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Summary of the session so far
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            sensor: self.sensor.as_ref().map(|s| s.name.clone()),
            started_at: self.started_at,
            ended_at: self.ended_at,
            switches: self.switches.clone(),
            consumers: self.consumers.reports().to_vec(),
            graph: self.graph.snapshot(),
            errors: self.errors.clone(),
        }
    }
}
