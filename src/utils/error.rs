//! Error types and handling
//!
//! Common error types used across the pipeline. Every precondition failure
//! carries the indices involved so a caller can tell which step broke.

use crate::capture::traits::HardwareError;
use crate::graph::model::{CaptureOutput, ChannelKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{kind} channel {index} already created")]
    AlreadyCreated { kind: ChannelKind, index: u32 },

    #[error("{kind} channel {index} not created")]
    NotCreated { kind: ChannelKind, index: u32 },

    #[error("capture channel {index} is still streaming")]
    StillStreaming { index: u32 },

    #[error("capture channel {index} is still bound to encode group {group}")]
    StillBound { index: u32, group: u32 },

    #[error("capture output {output} is already bound to encode group {group}")]
    AlreadyBound { output: CaptureOutput, group: u32 },

    #[error("capture output {output} is not bound to encode group {group}")]
    NotBound { output: CaptureOutput, group: u32 },

    #[error("encode group {group} has no members")]
    GroupEmpty { group: u32 },

    #[error("encode group {group} still has {members} member(s)")]
    GroupNotEmpty { group: u32, members: usize },

    #[error("encode group {group} not found")]
    GroupNotFound { group: u32 },

    #[error("encode channel {index} is still receiving")]
    StillReceiving { index: u32 },

    #[error("encode channel {index} is already receiving")]
    AlreadyReceiving { index: u32 },

    #[error("encode channel {index} has an active stream consumer")]
    ConsumerActive { index: u32 },

    #[error("poll on encode channel {index} timed out")]
    Timeout { index: u32 },

    #[error("hardware fault: {0}")]
    HardwareFault(#[from] HardwareError),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("sensor not found: {0}")]
    SensorNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Coarse classification of a [`PipelineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AlreadyCreated,
    NotCreated,
    StillStreaming,
    StillBound,
    AlreadyBound,
    NotBound,
    GroupEmpty,
    GroupNotEmpty,
    GroupNotFound,
    StillReceiving,
    AlreadyReceiving,
    ConsumerActive,
    Timeout,
    HardwareFault,
    InvalidConfiguration,
    SensorNotFound,
    InvalidState,
    Io,
    Config,
}

impl ErrorKind {
    /// Stable code used in logs and summaries
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyCreated => "ALREADY_CREATED",
            ErrorKind::NotCreated => "NOT_CREATED",
            ErrorKind::StillStreaming => "STILL_STREAMING",
            ErrorKind::StillBound => "STILL_BOUND",
            ErrorKind::AlreadyBound => "ALREADY_BOUND",
            ErrorKind::NotBound => "NOT_BOUND",
            ErrorKind::GroupEmpty => "GROUP_EMPTY",
            ErrorKind::GroupNotEmpty => "GROUP_NOT_EMPTY",
            ErrorKind::GroupNotFound => "GROUP_NOT_FOUND",
            ErrorKind::StillReceiving => "STILL_RECEIVING",
            ErrorKind::AlreadyReceiving => "ALREADY_RECEIVING",
            ErrorKind::ConsumerActive => "CONSUMER_ACTIVE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::HardwareFault => "HARDWARE_FAULT",
            ErrorKind::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorKind::SensorNotFound => "SENSOR_NOT_FOUND",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::Io => "IO_ERROR",
            ErrorKind::Config => "CONFIG_ERROR",
        }
    }

    /// Whether an operation failing with this kind may simply be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }
}

impl PipelineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::AlreadyCreated { .. } => ErrorKind::AlreadyCreated,
            PipelineError::NotCreated { .. } => ErrorKind::NotCreated,
            PipelineError::StillStreaming { .. } => ErrorKind::StillStreaming,
            PipelineError::StillBound { .. } => ErrorKind::StillBound,
            PipelineError::AlreadyBound { .. } => ErrorKind::AlreadyBound,
            PipelineError::NotBound { .. } => ErrorKind::NotBound,
            PipelineError::GroupEmpty { .. } => ErrorKind::GroupEmpty,
            PipelineError::GroupNotEmpty { .. } => ErrorKind::GroupNotEmpty,
            PipelineError::GroupNotFound { .. } => ErrorKind::GroupNotFound,
            PipelineError::StillReceiving { .. } => ErrorKind::StillReceiving,
            PipelineError::AlreadyReceiving { .. } => ErrorKind::AlreadyReceiving,
            PipelineError::ConsumerActive { .. } => ErrorKind::ConsumerActive,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::HardwareFault(_) => ErrorKind::HardwareFault,
            PipelineError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            PipelineError::SensorNotFound(_) => ErrorKind::SensorNotFound,
            PipelineError::InvalidState(_) => ErrorKind::InvalidState,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Serializable error record for summaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for ErrorRecord {
    fn from(error: &PipelineError) -> Self {
        ErrorRecord {
            code: error.kind().code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_code() {
        let err = PipelineError::GroupNotEmpty { group: 0, members: 2 };
        assert_eq!(err.kind(), ErrorKind::GroupNotEmpty);
        assert_eq!(err.kind().code(), "GROUP_NOT_EMPTY");
        assert_eq!(err.to_string(), "encode group 0 still has 2 member(s)");
    }

    #[test]
    fn test_hardware_fault_conversion() {
        let hw = HardwareError::new("start_streaming", Some(1), -1);
        let err: PipelineError = hw.into();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(!err.kind().is_transient());

        let record = ErrorRecord::from(&err);
        assert_eq!(record.code, "HARDWARE_FAULT");
        assert!(record.message.contains("start_streaming"));
    }
}
