//! Encoded unit sinks
//!
//! A sink receives each unit a stream consumer polls, before the unit goes
//! back to the hardware service. Sinks borrow the unit; they never own it.

use crate::capture::types::{EncodedUnit, PayloadType};
use crate::utils::error::PipelineResult;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Destination for encoded units
pub trait UnitSink: Send {
    /// Handle one unit. The unit is released right after this returns.
    fn consume(&mut self, unit: &EncodedUnit) -> PipelineResult<()>;

    /// Called once when the consumer exits
    fn finish(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Discards every unit
#[derive(Debug, Default)]
pub struct NullSink;

impl UnitSink for NullSink {
    fn consume(&mut self, _unit: &EncodedUnit) -> PipelineResult<()> {
        Ok(())
    }
}

/// Shared counters, readable while the consumer runs
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub units: AtomicU64,
    pub bytes: AtomicU64,
    pub keyframes: AtomicU64,
}

impl SinkCounters {
    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes.load(Ordering::Relaxed)
    }
}

/// Counts units, bytes and keyframes
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    counters: Arc<SinkCounters>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for reading the counters from another thread
    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }
}

impl UnitSink for CountingSink {
    fn consume(&mut self, unit: &EncodedUnit) -> PipelineResult<()> {
        self.counters.units.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(unit.len() as u64, Ordering::Relaxed);
        if unit.keyframe {
            self.counters.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Appends raw payloads to `stream-<channel>.<ext>`
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    units: u64,
}

impl FileSink {
    /// Open (append) the stream file for `channel` inside `output_dir`
    pub fn create(output_dir: &Path, channel: u32, payload: PayloadType) -> PipelineResult<Self> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(Self::file_name(channel, payload));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!("Writing encode channel {} to {:?}", channel, path);
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            units: 0,
        })
    }

    pub fn file_name(channel: u32, payload: PayloadType) -> String {
        format!("stream-{channel}.{}", payload.extension())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UnitSink for FileSink {
    fn consume(&mut self, unit: &EncodedUnit) -> PipelineResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(&unit.data)?;
            self.units += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            tracing::info!("Closed {:?} after {} unit(s)", self.path, self.units);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(sequence: u64, keyframe: bool, len: usize) -> EncodedUnit {
        EncodedUnit {
            channel: 0,
            sequence,
            timestamp_us: 0,
            keyframe,
            data: vec![0xAB; len],
        }
    }

    #[test]
    fn test_counting_sink() {
        let mut sink = CountingSink::new();
        let counters = sink.counters();
        sink.consume(&unit(0, true, 100)).unwrap();
        sink.consume(&unit(1, false, 20)).unwrap();

        assert_eq!(counters.units(), 2);
        assert_eq!(counters.bytes(), 120);
        assert_eq!(counters.keyframes(), 1);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempdir().unwrap();

        let mut sink = FileSink::create(dir.path(), 3, PayloadType::H264).unwrap();
        sink.consume(&unit(0, true, 10)).unwrap();
        sink.consume(&unit(1, false, 5)).unwrap();
        sink.finish().unwrap();

        let path = dir.path().join("stream-3.h264");
        assert_eq!(sink.path(), path.as_path());
        assert_eq!(std::fs::read(&path).unwrap().len(), 15);

        // Reopening keeps what was written before
        let mut again = FileSink::create(dir.path(), 3, PayloadType::H264).unwrap();
        again.consume(&unit(2, false, 5)).unwrap();
        again.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 20);
    }
}
