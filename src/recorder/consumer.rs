//! Stream consumers
//!
//! One worker thread per receiving encode channel. The worker polls the
//! hardware for encoded units, hands each one to a sink and releases it
//! before polling again. Cancellation is a flag checked only at the top of
//! the loop, so a unit that has been polled is always released before the
//! worker exits.

use super::sink::UnitSink;
use crate::capture::traits::{PollError, VideoHardware};
use crate::graph::ChannelGraph;
use crate::utils::error::{ErrorKind, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// Upper bound on one poll; also bounds how long a join waits
    pub poll_timeout: Duration,
    /// Stop cleanly after this many units
    pub frame_limit: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            frame_limit: None,
        }
    }
}

/// How a consumer ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConsumerExit {
    /// Observed cancellation or reached its frame limit
    Stopped,
    /// A poll, release or sink call failed
    Faulted { kind: ErrorKind, message: String },
}

impl ConsumerExit {
    fn faulted(error: &PipelineError) -> Self {
        ConsumerExit::Faulted {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ConsumerExit::Stopped)
    }
}

/// Final accounting of one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReport {
    pub channel: u32,
    pub frames: u64,
    pub bytes: u64,
    pub timeouts: u64,
    pub exit: ConsumerExit,
}

/// The polling loop for one encode channel
pub struct StreamConsumer {
    index: u32,
    hw: Arc<dyn VideoHardware>,
    sink: Box<dyn UnitSink>,
    config: ConsumerConfig,
    cancel: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl StreamConsumer {
    pub fn new(
        index: u32,
        hw: Arc<dyn VideoHardware>,
        sink: Box<dyn UnitSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            index,
            hw,
            sink,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run the loop on a dedicated `stream-<index>` thread
    pub fn spawn(self) -> PipelineResult<ConsumerHandle> {
        let index = self.index;
        let cancel = self.cancel.clone();
        let frames = self.frames.clone();

        let thread = std::thread::Builder::new()
            .name(format!("stream-{index}"))
            .spawn(move || self.run())?;

        tracing::info!("Stream consumer started for encode channel {}", index);
        Ok(ConsumerHandle {
            index,
            cancel,
            frames,
            thread: Some(thread),
        })
    }

    /// Drain the channel until cancelled, limited or faulted
    pub fn run(mut self) -> ConsumerReport {
        let mut bytes = 0u64;
        let mut timeouts = 0u64;

        let exit = loop {
            if self.cancel.load(Ordering::Acquire) {
                break ConsumerExit::Stopped;
            }
            let count = self.frames.load(Ordering::Relaxed);
            if self.config.frame_limit.is_some_and(|limit| count >= limit) {
                tracing::debug!("Encode channel {} reached frame limit {}", self.index, count);
                break ConsumerExit::Stopped;
            }

            let unit = match self.hw.poll_encoded_unit(self.index, self.config.poll_timeout) {
                Ok(unit) => unit,
                Err(PollError::Timeout) => {
                    timeouts += 1;
                    continue;
                }
                Err(PollError::Fault(e)) => {
                    let error = PipelineError::from(e);
                    tracing::error!("Polling encode channel {} failed: {}", self.index, error);
                    break ConsumerExit::faulted(&error);
                }
            };

            let size = unit.len() as u64;
            let consumed = self.sink.consume(&unit);
            let released = self.hw.release_encoded_unit(self.index, unit);

            if let Err(e) = consumed {
                tracing::error!("Sink for encode channel {} failed: {}", self.index, e);
                break ConsumerExit::faulted(&e);
            }
            if let Err(e) = released {
                let error = PipelineError::from(e);
                tracing::error!("Releasing unit on encode channel {} failed: {}", self.index, error);
                break ConsumerExit::faulted(&error);
            }

            bytes += size;
            let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 100 == 0 {
                tracing::debug!("Encode channel {}: {} units, {} bytes", self.index, count, bytes);
            }
        };

        if let Err(e) = self.sink.finish() {
            tracing::warn!("Closing sink for encode channel {} failed: {}", self.index, e);
        }

        let report = ConsumerReport {
            channel: self.index,
            frames: self.frames.load(Ordering::Relaxed),
            bytes,
            timeouts,
            exit,
        };
        tracing::info!(
            "Stream consumer for encode channel {} exited: {:?} after {} units",
            report.channel,
            report.exit,
            report.frames
        );
        report
    }
}

/// Control handle for a running consumer thread
pub struct ConsumerHandle {
    index: u32,
    cancel: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<ConsumerReport>>,
}

impl ConsumerHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Request a stop; observed before the next poll
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Whether the worker has exited on its own
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Wait for the worker to exit
    pub fn join(mut self) -> ConsumerReport {
        self.join_inner()
    }

    fn join_inner(&mut self) -> ConsumerReport {
        let fallback = |index: u32, frames: u64, message: &str| ConsumerReport {
            channel: index,
            frames,
            bytes: 0,
            timeouts: 0,
            exit: ConsumerExit::Faulted {
                kind: ErrorKind::InvalidState,
                message: message.to_string(),
            },
        };

        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(report) => report,
                Err(_) => {
                    tracing::error!("Stream consumer for encode channel {} panicked", self.index);
                    fallback(self.index, self.frames(), "consumer thread panicked")
                }
            },
            None => fallback(self.index, self.frames(), "consumer already joined"),
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel();
            let _ = self.join_inner();
        }
    }
}

/// All consumers of a session, keyed by encode channel
///
/// Keeps the graph's consumer marks in sync with the threads it owns.
#[derive(Default)]
pub struct ConsumerRegistry {
    handles: Vec<ConsumerHandle>,
    finished: Vec<ConsumerReport>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach and start a consumer for a receiving encode channel
    pub fn spawn(
        &mut self,
        graph: &mut ChannelGraph,
        index: u32,
        sink: Box<dyn UnitSink>,
        config: ConsumerConfig,
    ) -> PipelineResult<()> {
        graph.attach_consumer(index)?;
        let consumer = StreamConsumer::new(index, graph.hardware().clone(), sink, config);
        match consumer.spawn() {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                graph.detach_consumer(index);
                Err(e)
            }
        }
    }

    /// Cancel then join the consumers of `indices`
    ///
    /// All are cancelled before any is joined, newest first, so the total wait
    /// is bounded by one poll timeout rather than one per consumer.
    pub fn stop(&mut self, graph: &mut ChannelGraph, indices: &[u32]) -> Vec<ConsumerReport> {
        for handle in self.handles.iter().filter(|h| indices.contains(&h.index)) {
            handle.cancel();
        }

        let mut reports = Vec::new();
        let mut kept = Vec::new();
        for handle in self.handles.drain(..).rev() {
            if indices.contains(&handle.index) {
                let index = handle.index;
                let report = handle.join();
                graph.detach_consumer(index);
                reports.push(report);
            } else {
                kept.push(handle);
            }
        }
        kept.reverse();
        self.handles = kept;

        self.finished.extend(reports.iter().cloned());
        reports
    }

    /// Cancel and join every consumer
    pub fn stop_all(&mut self, graph: &mut ChannelGraph) -> Vec<ConsumerReport> {
        let indices = self.active();
        self.stop(graph, &indices)
    }

    /// Join consumers that already exited on their own
    pub fn reap(&mut self, graph: &mut ChannelGraph) -> Vec<ConsumerReport> {
        let done: Vec<u32> = self
            .handles
            .iter()
            .filter(|h| h.is_finished())
            .map(|h| h.index)
            .collect();
        if done.is_empty() {
            return Vec::new();
        }
        self.stop(graph, &done)
    }

    pub fn is_active(&self, index: u32) -> bool {
        self.handles.iter().any(|h| h.index == index)
    }

    /// Indices with a live handle, in spawn order
    pub fn active(&self) -> Vec<u32> {
        self.handles.iter().map(|h| h.index).collect()
    }

    pub fn all_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Units consumed so far by a live consumer
    pub fn frames(&self, index: u32) -> Option<u64> {
        self.handles
            .iter()
            .find(|h| h.index == index)
            .map(|h| h.frames())
    }

    /// Reports of every consumer joined so far
    pub fn reports(&self) -> &[ConsumerReport] {
        &self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{HwOp, SimulatedHardware};
    use crate::capture::types::{
        CaptureAttr, EncodeAttr, EncodedUnit, FrameRate, Resolution,
    };
    use crate::graph::CaptureOutput;
    use crate::recorder::sink::{CountingSink, NullSink};
    use std::time::Instant;

    fn fed_channel(interval_ms: u64) -> (Arc<SimulatedHardware>, ChannelGraph) {
        let hw = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(
            interval_ms,
        )));
        let sensor = hw.detect_sensor("sc1035").unwrap().unwrap();
        hw.system_init(&sensor).unwrap();
        hw.enable_tuning().unwrap();

        let mut graph = ChannelGraph::new(hw.clone());
        let rate = FrameRate::new(25, 1);
        graph
            .create_capture_channel(0, CaptureAttr::new(Resolution::VGA, rate, 3))
            .unwrap();
        graph
            .create_encode_channel(0, 0, EncodeAttr::h264_cbr(Resolution::VGA, rate, 500), true)
            .unwrap();
        graph.bind(CaptureOutput::primary(0), 0).unwrap();
        graph.start_streaming(0).unwrap();
        graph.start_receiving(0).unwrap();
        (hw, graph)
    }

    fn short_config() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout: Duration::from_millis(20),
            frame_limit: None,
        }
    }

    #[test]
    fn test_frame_limit_stops_cleanly() {
        let (hw, graph) = fed_channel(1);
        let sink = CountingSink::new();
        let counters = sink.counters();
        let config = ConsumerConfig {
            frame_limit: Some(10),
            ..short_config()
        };

        let report = StreamConsumer::new(0, graph.hardware().clone(), Box::new(sink), config).run();

        assert_eq!(report.exit, ConsumerExit::Stopped);
        assert_eq!(report.frames, 10);
        assert_eq!(counters.units(), 10);
        assert_eq!(hw.units_polled(), 10);
        assert_eq!(hw.units_released(), 10);
        assert_eq!(hw.outstanding_units(), 0);
    }

    #[test]
    fn test_cancel_releases_every_polled_unit() {
        let (hw, graph) = fed_channel(1);
        let handle = StreamConsumer::new(0, graph.hardware().clone(), Box::new(NullSink), short_config())
            .spawn()
            .unwrap();

        let start = Instant::now();
        while handle.frames() < 5 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        let report = handle.join();

        assert!(report.exit.is_clean());
        assert!(report.frames >= 5);
        assert_eq!(hw.units_polled(), hw.units_released());
        assert_eq!(hw.call_count(HwOp::Release, Some(0)), report.frames);
        assert_eq!(hw.outstanding_units(), 0);
    }

    /// Sink that requests cancellation while it holds a unit
    struct CancelInside {
        cancel: Arc<AtomicBool>,
    }

    impl UnitSink for CancelInside {
        fn consume(&mut self, _unit: &EncodedUnit) -> PipelineResult<()> {
            self.cancel.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn test_cancel_during_unit_is_deferred() {
        let (hw, graph) = fed_channel(1);
        let flag = Arc::new(AtomicBool::new(false));
        let mut consumer = StreamConsumer::new(
            0,
            graph.hardware().clone(),
            Box::new(NullSink),
            short_config(),
        );
        consumer.cancel = flag.clone();
        consumer.sink = Box::new(CancelInside { cancel: flag });

        let report = consumer.run();

        assert_eq!(report.exit, ConsumerExit::Stopped);
        assert_eq!(report.frames, 1);
        assert_eq!(hw.units_polled(), 1);
        assert_eq!(hw.units_released(), 1);
    }

    #[test]
    fn test_timeouts_are_retried_until_cancelled() {
        let (hw, mut graph) = fed_channel(1);
        graph.stop_streaming(0).unwrap();

        let handle = StreamConsumer::new(0, graph.hardware().clone(), Box::new(NullSink), short_config())
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(70));
        handle.cancel();
        let report = handle.join();

        assert!(report.exit.is_clean());
        assert_eq!(report.frames, 0);
        assert!(report.timeouts >= 1);
        assert_eq!(hw.units_polled(), 0);
    }

    #[test]
    fn test_poll_fault_surfaces() {
        let (hw, graph) = fed_channel(1);
        hw.inject_fault(HwOp::Poll, Some(0));

        let report =
            StreamConsumer::new(0, graph.hardware().clone(), Box::new(NullSink), short_config()).run();

        match report.exit {
            ConsumerExit::Faulted { kind, .. } => assert_eq!(kind, ErrorKind::HardwareFault),
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(hw.call_count(HwOp::Poll, Some(0)), 1);
    }

    /// Sink that always fails
    struct BrokenSink;

    impl UnitSink for BrokenSink {
        fn consume(&mut self, _unit: &EncodedUnit) -> PipelineResult<()> {
            Err(PipelineError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_sink_failure_still_releases_unit() {
        let (hw, graph) = fed_channel(1);
        let report =
            StreamConsumer::new(0, graph.hardware().clone(), Box::new(BrokenSink), short_config()).run();

        assert!(!report.exit.is_clean());
        assert_eq!(hw.units_polled(), 1);
        assert_eq!(hw.units_released(), 1);
        assert_eq!(hw.outstanding_units(), 0);
    }

    #[test]
    fn test_registry_tracks_graph_marks() {
        let (hw, mut graph) = fed_channel(1);
        let mut registry = ConsumerRegistry::new();

        registry
            .spawn(&mut graph, 0, Box::new(NullSink), short_config())
            .unwrap();
        assert!(graph.encode_channel(0).unwrap().consumer_attached);
        assert_eq!(
            registry
                .spawn(&mut graph, 0, Box::new(NullSink), short_config())
                .unwrap_err()
                .kind(),
            ErrorKind::ConsumerActive
        );

        std::thread::sleep(Duration::from_millis(20));
        let reports = registry.stop_all(&mut graph);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].exit.is_clean());
        assert!(!graph.encode_channel(0).unwrap().consumer_attached);
        assert!(registry.active().is_empty());
        assert_eq!(registry.reports().len(), 1);
        assert_eq!(hw.outstanding_units(), 0);
    }

    #[test]
    fn test_registry_reaps_limited_consumers() {
        let (_hw, mut graph) = fed_channel(1);
        let mut registry = ConsumerRegistry::new();
        let config = ConsumerConfig {
            frame_limit: Some(3),
            ..short_config()
        };
        registry
            .spawn(&mut graph, 0, Box::new(NullSink), config)
            .unwrap();

        let start = Instant::now();
        while !registry.all_finished() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(2));
        }
        let reaped = registry.reap(&mut graph);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].frames, 3);
        assert!(!registry.is_active(0));
    }
}
