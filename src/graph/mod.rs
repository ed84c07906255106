//! Capture/encode channel graph
//!
//! - `model`: node and edge records
//! - `channel_graph`: the invariant-checking graph manager

pub mod channel_graph;
pub mod model;

pub use channel_graph::{ChannelGraph, GraphLimits};
pub use model::{
    BindEdge, CaptureChannel, CaptureOutput, ChannelHandle, ChannelKind, EncodeChannel,
    EncodeGroup, GraphSnapshot, StreamState,
};
