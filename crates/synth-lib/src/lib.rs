//! Trace-driven workload synthesis
//!
//! This crate provides the core functionality for:
//! - Reading per-resource utilization traces (CPU, GPU, memory)
//! - Debouncing readings into resource lifecycle events
//! - Fusing resource events into session-level events
//! - Time-ordered merging of all sources into one stream
//! - A per-session event queue with delay and hold support
//! - Generating session events from workload templates
//! - Health checks and observability

pub mod driver;
pub mod error;
pub mod event;
pub mod health;
pub mod models;
pub mod observability;
pub mod queue;
pub mod replay;
pub mod session;
pub mod synth;
pub mod template;
pub mod trace;

pub use error::{Result, SynthError};
pub use event::{DriverEventName, Event, EventName, EventPayload, SessionEventName, SourceId};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
    ReplayPhase,
};
pub use models::*;
pub use observability::{StructuredLogger, SynthMetrics};
pub use queue::EventQueue;
pub use replay::{run_prerun, run_standard, ReplayReport, Replayer, WorkloadSpec};
pub use synth::{
    EventConsumer, MaxUtilization, MaximaPaths, MaximaReport, QueueConsumer, SynthesisSummary,
    Synthesizer, SynthesizerBuilder,
};
pub use template::{
    generate_template_workload, ResourceRequest, TemplateReport, TemplateSequencer, TemplateSession,
    TemplateTraining, WorkloadTemplate,
};
