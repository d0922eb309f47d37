//! Persistence Sink
//!
//! After every completed cycle the bridge hands one [`SensorRecord`] to a
//! [`PersistenceSink`]. The record carries the decoded frame plus the flags
//! actually in force that cycle: under normal authority those are the
//! frame's own output groups, under override they are the actuator image
//! read back from the PLC. The dashboard and any downstream analytics read
//! from the sink, never from the bridge directly.
//!
//! Sink failures are the loop's cheapest failure class: logged and
//! forgotten. A persistence outage must never stall the plant.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::arbiter::OverrideState;
use crate::codec::{InputFlags, OutputFlags, OutputFlags2, SensorFrame};

/// One persisted row: the frame, the applied flags and when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorRecord {
    pub timestamp: DateTime<Utc>,
    pub level1: u8,
    pub level2: u8,
    pub tds: u8,
    pub flow: u8,
    pub pressure: u8,
    pub input: InputFlags,
    /// First output group actually in force this cycle.
    pub applied_output: OutputFlags,
    /// Second output group actually in force this cycle.
    pub applied_output2: OutputFlags2,
    /// Who commanded the actuators this cycle.
    pub authority: OverrideState,
}

impl SensorRecord {
    /// Assemble a row from a decoded frame and the flags that were applied.
    pub fn new(
        timestamp: DateTime<Utc>,
        frame: &SensorFrame,
        applied_output: OutputFlags,
        applied_output2: OutputFlags2,
        authority: OverrideState,
    ) -> Self {
        Self {
            timestamp,
            level1: frame.level1,
            level2: frame.level2,
            tds: frame.tds,
            flow: frame.flow,
            pressure: frame.pressure,
            input: frame.input,
            applied_output,
            applied_output2,
            authority,
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable, timestamp-ordered destination for cycle records.
#[async_trait]
pub trait PersistenceSink: Send {
    /// Append one record. Implementations flush eagerly enough that a
    /// most-recent-row poll (the dashboard's access pattern) sees it.
    async fn append(&mut self, record: &SensorRecord) -> Result<(), PersistError>;

    /// Force buffered rows to stable storage.
    async fn flush(&mut self) -> Result<(), PersistError>;
}

/// CSV file sink, one timestamped file per bridge run.
///
/// The header is written once at creation; every append is followed by a
/// flush so live readers see fresh rows without waiting for shutdown.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

const HEADER: [&str; 29] = [
    "timestamp",
    "level_1",
    "level_2",
    "tds_1",
    "flow_1",
    "pressure_1",
    "level_switch",
    "pb_start",
    "mode_standby",
    "mode_filtering",
    "mode_backwash",
    "mode_drain",
    "mode_override",
    "emergency_stop",
    "solenoid_1",
    "solenoid_2",
    "solenoid_3",
    "solenoid_4",
    "solenoid_5",
    "solenoid_6",
    "pump_1",
    "pump_2",
    "pump_3",
    "standby_lamp",
    "filtering_lamp",
    "backwash_lamp",
    "drain_lamp",
    "stepper",
    "authority",
];

impl CsvSink {
    /// Create `wtp_<timestamp>.csv` under `dir`, creating the directory if
    /// needed, and write the header row.
    pub fn create(dir: &Path) -> Result<Self, PersistError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        let file_name = format!("wtp_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(file_name);
        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(Self { path, writer })
    }

    /// Where this sink is writing.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn bit(flag: bool) -> &'static str {
    if flag {
        "1"
    } else {
        "0"
    }
}

#[async_trait]
impl PersistenceSink for CsvSink {
    async fn append(&mut self, record: &SensorRecord) -> Result<(), PersistError> {
        let timestamp = record.timestamp.to_rfc3339();
        let authority = record.authority.to_string();
        let analog = [
            record.level1.to_string(),
            record.level2.to_string(),
            record.tds.to_string(),
            record.flow.to_string(),
            record.pressure.to_string(),
        ];
        self.writer.write_record([
            timestamp.as_str(),
            analog[0].as_str(),
            analog[1].as_str(),
            analog[2].as_str(),
            analog[3].as_str(),
            analog[4].as_str(),
            bit(record.input.level_switch),
            bit(record.input.pb_start),
            bit(record.input.mode_standby),
            bit(record.input.mode_filtering),
            bit(record.input.mode_backwash),
            bit(record.input.mode_drain),
            bit(record.input.mode_override),
            bit(record.input.emergency_stop),
            bit(record.applied_output.solenoid_1),
            bit(record.applied_output.solenoid_2),
            bit(record.applied_output.solenoid_3),
            bit(record.applied_output.solenoid_4),
            bit(record.applied_output.solenoid_5),
            bit(record.applied_output.solenoid_6),
            bit(record.applied_output.pump_1),
            bit(record.applied_output.pump_2),
            bit(record.applied_output2.pump_3),
            bit(record.applied_output2.standby_lamp),
            bit(record.applied_output2.filtering_lamp),
            bit(record.applied_output2.backwash_lamp),
            bit(record.applied_output2.drain_lamp),
            bit(record.applied_output2.stepper),
            authority.as_str(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PersistError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sink that drops everything, for persistence-disabled deployments.
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn append(&mut self, _record: &SensorRecord) -> Result<(), PersistError> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PersistError> {
        Ok(())
    }
}
