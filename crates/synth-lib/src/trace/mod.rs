//! Trace record sources
//!
//! Reads CSV utilization traces into [`Record`]s. Each resource kind has its
//! own column layout:
//! - CPU: `timestamp,pod,value`
//! - GPU: `timestamp,exported_pod,gpu,value[,vram]`
//! - Memory: `timestamp,pod,value`
//!
//! Malformed rows surface as [`SynthError::Parse`] items so callers can log
//! and skip them; the iterator keeps going.

mod mapping;

pub use mapping::load_mapping;

use csv::{Reader, StringRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{Result, SynthError};
use crate::models::{deserialize_unix_time, Record, ResourceKind, SimTime};

#[derive(Debug, Deserialize)]
struct CpuRow {
    #[serde(deserialize_with = "deserialize_unix_time")]
    timestamp: SimTime,
    pod: usize,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct GpuRow {
    #[serde(deserialize_with = "deserialize_unix_time")]
    timestamp: SimTime,
    exported_pod: usize,
    gpu: String,
    value: f64,
    #[serde(default)]
    vram: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MemoryRow {
    #[serde(deserialize_with = "deserialize_unix_time")]
    timestamp: SimTime,
    pod: usize,
    value: f64,
}

fn decode(kind: ResourceKind, raw: &StringRecord, headers: &StringRecord) -> std::result::Result<Record, csv::Error> {
    let record = match kind {
        ResourceKind::Cpu => {
            let row: CpuRow = raw.deserialize(Some(headers))?;
            Record::new(row.timestamp, row.pod, row.value)
        }
        ResourceKind::Gpu => {
            let row: GpuRow = raw.deserialize(Some(headers))?;
            Record {
                timestamp: row.timestamp,
                entity_index: row.exported_pod,
                value: row.value,
                device: Some(row.gpu),
                vram_gb: row.vram.unwrap_or(0.0),
            }
        }
        ResourceKind::Memory => {
            let row: MemoryRow = raw.deserialize(Some(headers))?;
            Record::new(row.timestamp, row.pod, row.value)
        }
    };
    Ok(record)
}

fn open_reader(path: &Path) -> Result<Reader<File>> {
    Reader::from_path(path).map_err(|e| SynthError::setup(path, e))
}

/// One or more trace files of a single resource kind, read as one stream.
#[derive(Debug, Clone)]
pub struct TraceSource {
    kind: ResourceKind,
    paths: Vec<PathBuf>,
    cutoff: Option<SimTime>,
}

impl TraceSource {
    /// Verify every file can be opened. Failure is a setup error.
    pub fn open(kind: ResourceKind, paths: Vec<PathBuf>, cutoff: Option<SimTime>) -> Result<Self> {
        if paths.is_empty() {
            return Err(SynthError::setup(
                PathBuf::new(),
                format!("no {} trace files configured", kind),
            ));
        }
        for path in &paths {
            File::open(path).map_err(|e| SynthError::setup(path, e))?;
        }
        Ok(Self { kind, paths, cutoff })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn records(&self) -> RecordIter {
        RecordIter {
            kind: self.kind,
            pending: self.paths.iter().cloned().collect(),
            current: None,
            raw: StringRecord::new(),
            cutoff: self.cutoff,
            done: false,
        }
    }
}

/// Streaming iterator over the records of a [`TraceSource`].
pub struct RecordIter {
    kind: ResourceKind,
    pending: VecDeque<PathBuf>,
    current: Option<(Reader<File>, StringRecord)>,
    raw: StringRecord,
    cutoff: Option<SimTime>,
    done: bool,
}

impl RecordIter {
    fn advance_file(&mut self) -> Result<bool> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(false);
        };
        let mut reader = open_reader(&path)?;
        let headers = reader.headers()?.clone();
        self.current = Some((reader, headers));
        Ok(true)
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.current.is_none() {
                match self.advance_file() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some((reader, headers)) = self.current.as_mut() else {
                continue;
            };
            match reader.read_record(&mut self.raw) {
                Ok(false) => {
                    self.current = None;
                }
                Ok(true) => {
                    let line = self.raw.position().map(|p| p.line()).unwrap_or(0);
                    return match decode(self.kind, &self.raw, headers) {
                        Ok(record) => {
                            if self.cutoff.is_some_and(|cutoff| record.timestamp > cutoff) {
                                self.done = true;
                                return None;
                            }
                            Some(Ok(record))
                        }
                        Err(e) => Some(Err(SynthError::Parse {
                            line,
                            reason: e.to_string(),
                        })),
                    };
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    return Some(Err(SynthError::Parse {
                        line,
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }
}

/// Shape of a trace file, for inspection tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub rows: u64,
    pub skipped: u64,
    pub entities: usize,
    pub first: Option<SimTime>,
    pub last: Option<SimTime>,
    pub ticks: u64,
}

pub fn summarize(source: &TraceSource) -> Result<TraceSummary> {
    let mut summary = TraceSummary::default();
    let mut entities = HashSet::new();
    let mut last_tick = None;
    for item in source.records() {
        match item {
            Ok(record) => {
                summary.rows += 1;
                entities.insert(record.entity_index);
                summary.first.get_or_insert(record.timestamp);
                summary.last = Some(record.timestamp);
                if last_tick != Some(record.timestamp) {
                    summary.ticks += 1;
                    last_tick = Some(record.timestamp);
                }
            }
            Err(SynthError::Parse { .. }) => summary.skipped += 1,
            Err(e) => return Err(e),
        }
    }
    summary.entities = entities.len();
    Ok(summary)
}
