//! Precomputed resource maxima
//!
//! Standard mode attaches per-session and per-training-task resource maxima
//! to every session event. They are produced by a statistics run
//! ([`MaximaReport`]) and stored as CSV files:
//!
//! | file         | columns                                                        |
//! |--------------|----------------------------------------------------------------|
//! | cpu session  | `session_id,max_cpu_utilization`                               |
//! | mem session  | `session_id,max_memory_bytes`                                  |
//! | gpu session  | `session_id,max_gpu_utilization,num_gpus`                      |
//! | cpu task     | `session_id,seq,max_cpu_utilization`                           |
//! | mem task     | `session_id,seq,max_memory_bytes`                              |
//! | gpu task     | `session_id,seq,max_gpu_utilization,num_gpus,max_vram_gb`      |
//!
//! GPU traces with device labels also get per-device peaks, written for
//! reference only: `session_id,device,max_gpu_utilization` per session and
//! `session_id,seq,device,max_gpu_utilization` per task.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::driver::{MaximaTracker, SessionMaxima, TaskMaxima};
use crate::error::{Result, SynthError};
use crate::models::ResourceKind;

const BYTES_PER_GB: f64 = 1e9;

/// vCPUs reserved for a peak utilization given in percent of one core.
pub fn cpus_from_utilization(percent: f64) -> f64 {
    (percent / 100.0).ceil().max(1.0)
}

/// Whole gigabytes reserved for a peak memory footprint.
pub fn memory_gb_from_bytes(bytes: f64) -> f64 {
    (bytes / BYTES_PER_GB).ceil().max(1.0)
}

/// GPUs to reserve and the ratio between requested and reserved GPUs.
///
/// Without adjustment the requested count is kept. With adjustment the count
/// shrinks to what the peak utilization (summed over devices, in percent)
/// actually needs, but never below one or above the request.
pub fn gpu_reservation(max_utilization: f64, num_gpus: u32, adjust: bool) -> (u32, f64) {
    if !adjust || num_gpus == 0 {
        return (num_gpus, 1.0);
    }
    let needed = (max_utilization / 100.0).ceil() as u32;
    let adjusted = needed.clamp(1, num_gpus);
    (adjusted, f64::from(num_gpus) / f64::from(adjusted))
}

/// Reservations of a session or of one of its training tasks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceMaxima {
    pub cpus: f64,
    pub memory_gb: f64,
    pub gpus: u32,
    pub vram_gb: f64,
    pub adjustment_factor: f64,
}

impl Default for ResourceMaxima {
    fn default() -> Self {
        Self {
            cpus: 0.0,
            memory_gb: 0.0,
            gpus: 0,
            vram_gb: 0.0,
            adjustment_factor: 1.0,
        }
    }
}

/// Locations of the maxima files. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaximaPaths {
    pub cpu_session: Option<PathBuf>,
    pub memory_session: Option<PathBuf>,
    pub gpu_session: Option<PathBuf>,
    pub cpu_task: Option<PathBuf>,
    pub memory_task: Option<PathBuf>,
    pub gpu_task: Option<PathBuf>,
    pub gpu_device_session: Option<PathBuf>,
    pub gpu_device_task: Option<PathBuf>,
}

impl MaximaPaths {
    pub fn session_file(dir: &Path, kind: ResourceKind) -> PathBuf {
        dir.join(format!("{}_session_maxima.csv", kind))
    }

    pub fn task_file(dir: &Path, kind: ResourceKind) -> PathBuf {
        dir.join(format!("{}_task_maxima.csv", kind))
    }

    pub fn device_session_file(dir: &Path) -> PathBuf {
        dir.join("gpu_device_session_maxima.csv")
    }

    pub fn device_task_file(dir: &Path) -> PathBuf {
        dir.join("gpu_device_task_maxima.csv")
    }

    /// Maxima files of `kinds` previously written into `dir`. Files that do
    /// not exist are left unset.
    pub fn in_dir(dir: &Path, kinds: &[ResourceKind]) -> Self {
        let existing = |path: PathBuf| path.is_file().then_some(path);
        let mut paths = MaximaPaths::default();
        for kind in kinds {
            paths.set(
                *kind,
                existing(Self::session_file(dir, *kind)),
                existing(Self::task_file(dir, *kind)),
            );
            if *kind == ResourceKind::Gpu {
                paths.gpu_device_session = existing(Self::device_session_file(dir));
                paths.gpu_device_task = existing(Self::device_task_file(dir));
            }
        }
        paths
    }

    fn set(&mut self, kind: ResourceKind, session: Option<PathBuf>, task: Option<PathBuf>) {
        let (session_slot, task_slot) = match kind {
            ResourceKind::Cpu => (&mut self.cpu_session, &mut self.cpu_task),
            ResourceKind::Gpu => (&mut self.gpu_session, &mut self.gpu_task),
            ResourceKind::Memory => (&mut self.memory_session, &mut self.memory_task),
        };
        *session_slot = session;
        *task_slot = task;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CpuSessionRow {
    session_id: String,
    max_cpu_utilization: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemorySessionRow {
    session_id: String,
    max_memory_bytes: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GpuSessionRow {
    session_id: String,
    max_gpu_utilization: f64,
    num_gpus: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CpuTaskRow {
    session_id: String,
    seq: usize,
    max_cpu_utilization: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoryTaskRow {
    session_id: String,
    seq: usize,
    #[serde(alias = "max_mem_bytes")]
    max_memory_bytes: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GpuTaskRow {
    session_id: String,
    seq: usize,
    max_gpu_utilization: f64,
    num_gpus: u32,
    #[serde(default)]
    max_vram_gb: f64,
}

#[derive(Debug, Serialize)]
struct DeviceSessionRow<'a> {
    session_id: &'a str,
    device: &'a str,
    max_gpu_utilization: f64,
}

#[derive(Debug, Serialize)]
struct DeviceTaskRow<'a> {
    session_id: &'a str,
    seq: usize,
    device: &'a str,
    max_gpu_utilization: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GpuReservation {
    gpus: u32,
    vram_gb: f64,
    factor: f64,
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| SynthError::setup(path, e))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, csv::Error>>()
        .map_err(|e| SynthError::setup(path, e))
}

fn insert_task<T: Clone + Default>(
    tasks: &mut HashMap<String, Vec<T>>,
    session_id: String,
    seq: usize,
    value: T,
) {
    let list = tasks.entry(session_id).or_default();
    if list.len() <= seq {
        list.resize(seq + 1, T::default());
    }
    list[seq] = value;
}

/// Maxima tables loaded for a standard run
#[derive(Debug, Clone, Default)]
pub struct MaxUtilization {
    cpu: Option<HashMap<String, f64>>,
    memory: Option<HashMap<String, f64>>,
    gpu: Option<HashMap<String, GpuReservation>>,
    cpu_tasks: Option<HashMap<String, Vec<f64>>>,
    memory_tasks: Option<HashMap<String, Vec<f64>>>,
    gpu_tasks: Option<HashMap<String, Vec<GpuReservation>>>,
}

impl MaxUtilization {
    /// Load every configured file. A missing or malformed file is a setup error.
    pub fn load(paths: &MaximaPaths, adjust_gpu_reservations: bool) -> Result<Self> {
        let mut maxima = Self::default();

        if let Some(path) = &paths.cpu_session {
            let rows: Vec<CpuSessionRow> = read_rows(path)?;
            maxima.cpu = Some(
                rows.into_iter()
                    .map(|r| (r.session_id, cpus_from_utilization(r.max_cpu_utilization)))
                    .collect(),
            );
        }
        if let Some(path) = &paths.memory_session {
            let rows: Vec<MemorySessionRow> = read_rows(path)?;
            maxima.memory = Some(
                rows.into_iter()
                    .map(|r| (r.session_id, memory_gb_from_bytes(r.max_memory_bytes)))
                    .collect(),
            );
        }

        let mut session_vram: HashMap<String, f64> = HashMap::new();
        if let Some(path) = &paths.gpu_task {
            let rows: Vec<GpuTaskRow> = read_rows(path)?;
            let mut tasks = HashMap::new();
            for row in rows {
                let (gpus, factor) =
                    gpu_reservation(row.max_gpu_utilization, row.num_gpus, adjust_gpu_reservations);
                let vram = session_vram.entry(row.session_id.clone()).or_default();
                *vram = vram.max(row.max_vram_gb);
                let reservation = GpuReservation {
                    gpus,
                    vram_gb: row.max_vram_gb,
                    factor,
                };
                insert_task(&mut tasks, row.session_id, row.seq, reservation);
            }
            maxima.gpu_tasks = Some(tasks);
        }
        if let Some(path) = &paths.gpu_session {
            let rows: Vec<GpuSessionRow> = read_rows(path)?;
            maxima.gpu = Some(
                rows.into_iter()
                    .map(|r| {
                        let (gpus, factor) =
                            gpu_reservation(r.max_gpu_utilization, r.num_gpus, adjust_gpu_reservations);
                        let vram_gb = session_vram.get(&r.session_id).copied().unwrap_or(0.0);
                        (r.session_id, GpuReservation { gpus, vram_gb, factor })
                    })
                    .collect(),
            );
        }

        if let Some(path) = &paths.cpu_task {
            let rows: Vec<CpuTaskRow> = read_rows(path)?;
            let mut tasks = HashMap::new();
            for row in rows {
                insert_task(
                    &mut tasks,
                    row.session_id,
                    row.seq,
                    cpus_from_utilization(row.max_cpu_utilization),
                );
            }
            maxima.cpu_tasks = Some(tasks);
        }
        if let Some(path) = &paths.memory_task {
            let rows: Vec<MemoryTaskRow> = read_rows(path)?;
            let mut tasks = HashMap::new();
            for row in rows {
                insert_task(
                    &mut tasks,
                    row.session_id,
                    row.seq,
                    memory_gb_from_bytes(row.max_memory_bytes),
                );
            }
            maxima.memory_tasks = Some(tasks);
        }

        info!(
            cpu_sessions = maxima.cpu.as_ref().map_or(0, |m| m.len()),
            memory_sessions = maxima.memory.as_ref().map_or(0, |m| m.len()),
            gpu_sessions = maxima.gpu.as_ref().map_or(0, |m| m.len()),
            adjust_gpu_reservations = adjust_gpu_reservations,
            "Loaded resource maxima"
        );
        Ok(maxima)
    }

    fn has_session_tables(&self) -> bool {
        self.cpu.is_some() || self.memory.is_some() || self.gpu.is_some()
    }

    pub fn has_task_tables(&self) -> bool {
        self.cpu_tasks.is_some() || self.memory_tasks.is_some() || self.gpu_tasks.is_some()
    }

    /// Session-level maxima. `None` when tables are loaded but none of them
    /// knows the session.
    pub fn session(&self, session_id: &str) -> Option<ResourceMaxima> {
        let mut maxima = ResourceMaxima::default();
        if !self.has_session_tables() {
            return Some(maxima);
        }

        let mut found = false;
        if let Some(cpus) = self.cpu.as_ref().and_then(|m| m.get(session_id)) {
            maxima.cpus = *cpus;
            found = true;
        }
        if let Some(memory) = self.memory.as_ref().and_then(|m| m.get(session_id)) {
            maxima.memory_gb = *memory;
            found = true;
        }
        if let Some(gpu) = self.gpu.as_ref().and_then(|m| m.get(session_id)) {
            maxima.gpus = gpu.gpus;
            maxima.vram_gb = gpu.vram_gb;
            maxima.adjustment_factor = gpu.factor;
            found = true;
        }
        found.then_some(maxima)
    }

    /// Maxima of training task `index`, falling back to session-level values
    /// for kinds without a task table. `None` when a loaded task table has no
    /// entry at `index`.
    pub fn task(&self, session_id: &str, index: usize) -> Option<ResourceMaxima> {
        if !self.has_task_tables() {
            return None;
        }
        let mut maxima = self.session(session_id)?;
        if let Some(tasks) = &self.cpu_tasks {
            maxima.cpus = *tasks.get(session_id)?.get(index)?;
        }
        if let Some(tasks) = &self.memory_tasks {
            maxima.memory_gb = *tasks.get(session_id)?.get(index)?;
        }
        if let Some(tasks) = &self.gpu_tasks {
            let gpu = tasks.get(session_id)?.get(index)?;
            maxima.gpus = gpu.gpus;
            maxima.vram_gb = gpu.vram_gb;
        }
        Some(maxima)
    }
}

/// Maxima gathered by a statistics run, one entry per traced kind
#[derive(Debug, Clone, Default)]
pub struct MaximaReport {
    kinds: BTreeMap<ResourceKind, HashMap<String, SessionMaxima>>,
}

impl MaximaReport {
    pub fn from_trackers(trackers: &[MaximaTracker]) -> Self {
        let kinds = trackers
            .iter()
            .map(|tracker| (tracker.kind(), tracker.snapshot()))
            .collect();
        Self { kinds }
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.kinds.keys().copied()
    }

    pub fn get(&self, kind: ResourceKind, session_id: &str) -> Option<&SessionMaxima> {
        self.kinds.get(&kind).and_then(|sessions| sessions.get(session_id))
    }

    /// Session ids seen by any kind, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .kinds
            .values()
            .flat_map(|sessions| sessions.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Write session and task files for every traced kind into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<MaximaPaths> {
        std::fs::create_dir_all(dir)?;
        let mut paths = MaximaPaths::default();

        for (kind, sessions) in &self.kinds {
            let mut ids: Vec<&String> = sessions.keys().collect();
            ids.sort();
            let session_path = MaximaPaths::session_file(dir, *kind);
            let task_path = MaximaPaths::task_file(dir, *kind);
            let mut session_writer = csv::Writer::from_path(&session_path)?;
            let mut task_writer = csv::Writer::from_path(&task_path)?;

            for id in ids {
                let maxima = &sessions[id];
                write_session_row(&mut session_writer, *kind, id, &maxima.session)?;
                for (seq, task) in maxima.tasks.iter().enumerate() {
                    write_task_row(&mut task_writer, *kind, id, seq, task)?;
                }
            }
            session_writer.flush()?;
            task_writer.flush()?;

            paths.set(*kind, Some(session_path), Some(task_path));

            if *kind == ResourceKind::Gpu && has_devices(sessions) {
                let (session_path, task_path) = write_device_files(dir, sessions)?;
                paths.gpu_device_session = Some(session_path);
                paths.gpu_device_task = Some(task_path);
            }
        }
        Ok(paths)
    }
}

fn has_devices(sessions: &HashMap<String, SessionMaxima>) -> bool {
    sessions.values().any(|m| !m.session.devices.is_empty())
}

fn write_device_files(
    dir: &Path,
    sessions: &HashMap<String, SessionMaxima>,
) -> Result<(PathBuf, PathBuf)> {
    let session_path = MaximaPaths::device_session_file(dir);
    let task_path = MaximaPaths::device_task_file(dir);
    let mut session_writer = csv::Writer::from_path(&session_path)?;
    let mut task_writer = csv::Writer::from_path(&task_path)?;

    let mut ids: Vec<&String> = sessions.keys().collect();
    ids.sort();
    for id in ids {
        let maxima = &sessions[id];
        for (device, peak) in &maxima.session.devices {
            session_writer.serialize(DeviceSessionRow {
                session_id: id,
                device,
                max_gpu_utilization: *peak,
            })?;
        }
        for (seq, task) in maxima.tasks.iter().enumerate() {
            for (device, peak) in &task.devices {
                task_writer.serialize(DeviceTaskRow {
                    session_id: id,
                    seq,
                    device,
                    max_gpu_utilization: *peak,
                })?;
            }
        }
    }
    session_writer.flush()?;
    task_writer.flush()?;
    Ok((session_path, task_path))
}

fn write_session_row(
    writer: &mut csv::Writer<std::fs::File>,
    kind: ResourceKind,
    session_id: &str,
    maxima: &TaskMaxima,
) -> Result<()> {
    let session_id = session_id.to_string();
    match kind {
        ResourceKind::Cpu => writer.serialize(CpuSessionRow {
            session_id,
            max_cpu_utilization: maxima.max_value,
        })?,
        ResourceKind::Memory => writer.serialize(MemorySessionRow {
            session_id,
            max_memory_bytes: maxima.max_value,
        })?,
        ResourceKind::Gpu => writer.serialize(GpuSessionRow {
            session_id,
            max_gpu_utilization: maxima.max_value,
            num_gpus: maxima.max_gpus,
        })?,
    }
    Ok(())
}

fn write_task_row(
    writer: &mut csv::Writer<std::fs::File>,
    kind: ResourceKind,
    session_id: &str,
    seq: usize,
    maxima: &TaskMaxima,
) -> Result<()> {
    let session_id = session_id.to_string();
    match kind {
        ResourceKind::Cpu => writer.serialize(CpuTaskRow {
            session_id,
            seq,
            max_cpu_utilization: maxima.max_value,
        })?,
        ResourceKind::Memory => writer.serialize(MemoryTaskRow {
            session_id,
            seq,
            max_memory_bytes: maxima.max_value,
        })?,
        ResourceKind::Gpu => writer.serialize(GpuTaskRow {
            session_id,
            seq,
            max_gpu_utilization: maxima.max_value,
            num_gpus: maxima.max_gpus,
            max_vram_gb: maxima.max_vram_gb,
        })?,
    }
    Ok(())
}
