//! capture-graph - live capture/encode pipelines that change shape while running.
//!
//! This is the library crate behind the `capture-graph` binary. It provides
//! the channel graph, resolution switching, stream consumers and the session
//! controller, all driven through the [`capture::VideoHardware`] trait.

pub mod capture;
pub mod config;
pub mod graph;
pub mod recorder;
pub mod utils;

pub use capture::{SimulatedHardware, VideoHardware};
pub use config::PipelineConfig;
pub use graph::ChannelGraph;
pub use recorder::{PipelineController, ResolutionSwitcher, SessionSummary};
pub use utils::{ErrorKind, PipelineError, PipelineResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging from `RUST_LOG`
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capture_graph=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
