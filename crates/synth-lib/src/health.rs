//! Health tracking for a replay
//!
//! The resource drivers, the synthesizer and the event queue each report a
//! status here; the daemon serves the worst of them on its liveness endpoint
//! and the replay phase on its readiness endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::ResourceKind;

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still running, but some input was lost (a failed source, skipped rows)
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last status change
    pub updated_at: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    NotStarted,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub phase: ReplayPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    use crate::models::ResourceKind;

    pub const CPU_DRIVER: &str = "cpu_driver";
    pub const GPU_DRIVER: &str = "gpu_driver";
    pub const MEMORY_DRIVER: &str = "memory_driver";
    pub const SYNTHESIZER: &str = "synthesizer";
    pub const EVENT_QUEUE: &str = "event_queue";

    pub fn driver(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Cpu => CPU_DRIVER,
            ResourceKind::Gpu => GPU_DRIVER,
            ResourceKind::Memory => MEMORY_DRIVER,
        }
    }
}

#[derive(Debug)]
struct State {
    components: BTreeMap<String, ComponentHealth>,
    phase: ReplayPhase,
}

/// Shared registry of component health. Clones share state.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                components: BTreeMap::new(),
                phase: ReplayPhase::NotStarted,
            })),
        }
    }

    /// Register the synthesizer, the event queue and one driver per replayed
    /// kind as healthy, and enter the running phase.
    pub async fn start_replay(&self, kinds: &[ResourceKind]) {
        let mut state = self.state.write().await;
        let names = kinds
            .iter()
            .map(|kind| components::driver(*kind))
            .chain([components::SYNTHESIZER, components::EVENT_QUEUE]);
        for name in names {
            state.components.insert(
                name.to_string(),
                ComponentHealth::new(ComponentStatus::Healthy, None),
            );
        }
        state.phase = ReplayPhase::Running;
    }

    pub async fn finish_replay(&self) {
        self.state.write().await.phase = ReplayPhase::Finished;
    }

    /// Record a status change. A component never recovers from a worse status.
    async fn report(&self, name: &str, status: ComponentStatus, message: String) {
        let mut state = self.state.write().await;
        let worse = state
            .components
            .get(name)
            .map_or(true, |current| status >= current.status);
        if worse {
            state
                .components
                .insert(name.to_string(), ComponentHealth::new(status, Some(message)));
        }
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Degraded, message.into()).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Unhealthy, message.into()).await;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let health = self.health().await;
        let phase = self.state.read().await.phase;
        let reason = match phase {
            ReplayPhase::NotStarted => Some("Replay not started"),
            _ if health.status == ComponentStatus::Unhealthy => Some("Replay component unhealthy"),
            _ => None,
        };
        ReadinessResponse {
            ready: reason.is_none(),
            phase,
            reason: reason.map(str::to_string),
        }
    }
}
