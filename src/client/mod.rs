//! Consumer-side SDK for UIs driving the service.
//!
//! [`CopilotBackend`] abstracts the HTTP calls. On top of it sit the
//! [`HealthMonitor`], the [`QuerySlot`] that keeps one question in flight,
//! and the [`AnalysisWatcher`] that polls analysis progress.

mod backend;
mod health;
mod mock;
mod slot;
mod watcher;

pub use backend::{CopilotBackend, HttpBackend};
pub use health::{
    HealthMonitor, LossSignal, MonitorEvent, DISCONNECT_GRACE, HEALTH_POLL_INTERVAL, LOSS_COOLDOWN,
};
pub use mock::MockBackend;
pub use slot::{QuerySlot, SlotOutcome};
pub use watcher::{AnalysisWatcher, WatchEvent, ANALYSIS_POLL_INTERVAL};
