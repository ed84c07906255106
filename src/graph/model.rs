//! Channel graph records
//!
//! Nodes are keyed by index; edges are keyed by the capture output they
//! start from. Nothing here holds a reference to another record.

use crate::capture::types::{CaptureAttr, EncodeAttr};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of graph node an index refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Capture,
    Encode,
    Group,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Capture => write!(f, "capture"),
            ChannelKind::Encode => write!(f, "encode"),
            ChannelKind::Group => write!(f, "group"),
        }
    }
}

/// Handle returned by channel creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub kind: ChannelKind,
    pub index: u32,
}

/// One output of a capture channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureOutput {
    pub channel: u32,
    pub output: u32,
}

impl CaptureOutput {
    pub const fn new(channel: u32, output: u32) -> Self {
        Self { channel, output }
    }

    /// Output 0 of a capture channel
    pub const fn primary(channel: u32) -> Self {
        Self::new(channel, 0)
    }
}

impl fmt::Display for CaptureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture{}.out{}", self.channel, self.output)
    }
}

/// Capture channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureChannel {
    pub index: u32,
    pub attr: CaptureAttr,
    pub state: StreamState,
    /// Monotonic creation stamp, used for reverse-order teardown
    pub created_seq: u64,
}

impl CaptureChannel {
    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeGroup {
    pub id: u32,
    /// Members in creation order
    pub members: Vec<u32>,
    pub created_seq: u64,
}

impl EncodeGroup {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeChannel {
    pub index: u32,
    pub group: u32,
    pub attr: EncodeAttr,
    pub receiving: bool,
    pub consumer_attached: bool,
    pub created_seq: u64,
}

/// Directed data-path edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindEdge {
    pub output: CaptureOutput,
    pub group: u32,
}

/// Point-in-time copy of the whole graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub captures: Vec<CaptureChannel>,
    pub groups: Vec<EncodeGroup>,
    pub encoders: Vec<EncodeChannel>,
    pub edges: Vec<BindEdge>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
            && self.groups.is_empty()
            && self.encoders.is_empty()
            && self.edges.is_empty()
    }
}
