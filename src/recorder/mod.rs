//! Session orchestration
//!
//! This module drives live streams over the channel graph:
//! - StreamConsumer workers that drain encode channels into a UnitSink
//! - ResolutionSwitcher for live resolution changes
//! - PipelineController to sequence a whole session

pub mod consumer;
pub mod coordinator;
pub mod sink;
pub mod state;
pub mod switcher;

pub use consumer::{
    ConsumerConfig, ConsumerExit, ConsumerHandle, ConsumerRegistry, ConsumerReport, StreamConsumer,
};
pub use coordinator::{PipelineController, SinkFactory};
pub use sink::{CountingSink, FileSink, NullSink, SinkCounters, UnitSink};
pub use state::{PipelineEvent, SessionState, SessionSummary, SwitchRecord};
pub use switcher::{
    DependentEncode, ResolutionSwitcher, SwitchOutcome, SwitchPhase, SwitchRequest, SwitchStrategy,
};
