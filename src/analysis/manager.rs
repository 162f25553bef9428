//! Job registry and phase runner.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AnalysisJob, AnalysisPhase, AnalysisStatus, AnalysisWorker, PhaseMessages, PhaseOutput,
    COMPLETE_MARKER, FAILURE_MARKER,
};
use crate::connection::SessionListener;
use crate::error::{ErrorCode, Result};
use crate::knowledge::KnowledgeStore;
use crate::session::{ConnectionSession, SessionStore};

/// Default time a finished job stays pollable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

struct JobEntry {
    job_id: Uuid,
    job: AnalysisJob,
    cancel: CancellationToken,
    started: Instant,
    finished: Option<Instant>,
}

impl JobEntry {
    fn status(&self) -> AnalysisStatus {
        let end = self.finished.unwrap_or_else(Instant::now);
        AnalysisStatus {
            found: true,
            current_phase: self.job.current_phase(),
            phases: self.job.phase_messages.clone(),
            cancelled: Some(self.job.cancelled),
            elapsed_seconds: Some(end.duration_since(self.started).as_secs()),
        }
    }

    fn append(&mut self, phase: AnalysisPhase, line: &str) {
        self.job.phase_messages.append(phase, line);
        if self.finished.is_none() && self.job.is_terminal() {
            self.finished = Some(Instant::now());
        }
    }
}

type JobMap = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Write handle a worker uses to report progress within its phase.
///
/// Appends are dropped once the job was cancelled or replaced.
pub struct PhaseLog {
    jobs: JobMap,
    session_id: String,
    job_id: Uuid,
    phase: AnalysisPhase,
}

impl PhaseLog {
    /// Appends a progress line to this phase's message.
    pub fn append(&self, line: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = jobs.get_mut(&self.session_id) {
            if entry.job_id == self.job_id && !entry.job.cancelled {
                entry.append(self.phase, line);
            }
        }
    }
}

/// Runs at most one analysis job per connection session.
#[derive(Clone)]
pub struct AnalysisJobManager {
    jobs: JobMap,
    worker: Arc<dyn AnalysisWorker>,
    knowledge: Arc<dyn KnowledgeStore>,
    sessions: Arc<dyn SessionStore>,
    retention: Duration,
}

impl AnalysisJobManager {
    pub fn new(
        worker: Arc<dyn AnalysisWorker>,
        knowledge: Arc<dyn KnowledgeStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            jobs: Arc::default(),
            worker,
            knowledge,
            sessions,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Sets how long finished jobs stay pollable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Starts analysis for a connection session.
    ///
    /// Returns the running job unchanged if one is already in flight.
    pub fn start(&self, session_id: &str) -> std::result::Result<AnalysisStatus, ErrorCode> {
        let connection_id = self
            .sessions
            .validate_connection_session(session_id)
            .ok_or(ErrorCode::InvalidSession)?;

        let (job_id, cancel, status) = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            self.purge_expired(&mut jobs);

            if let Some(entry) = jobs.get(session_id) {
                if !entry.job.is_terminal() {
                    debug!(session_id, "Analysis already running");
                    return Ok(entry.status());
                }
            }

            let entry = JobEntry {
                job_id: Uuid::new_v4(),
                job: AnalysisJob {
                    session_id: session_id.to_string(),
                    connection_id,
                    phase_messages: PhaseMessages::default(),
                    cancelled: false,
                    started_at: Utc::now(),
                },
                cancel: CancellationToken::new(),
                started: Instant::now(),
                finished: None,
            };
            let snapshot = (entry.job_id, entry.cancel.clone(), entry.status());
            jobs.insert(session_id.to_string(), entry);
            snapshot
        };

        info!(session_id, connection_id, "Analysis started");
        let runner = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            runner.run(session_id, job_id, connection_id, cancel).await;
        });
        Ok(status)
    }

    /// Current status, or `found: false` once the job is gone.
    pub fn status(&self, session_id: &str) -> AnalysisStatus {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        self.purge_expired(&mut jobs);
        jobs.get(session_id)
            .map(JobEntry::status)
            .unwrap_or_else(AnalysisStatus::not_found)
    }

    /// Cancels a running job. The job becomes terminal immediately; the
    /// running phase stops at its next checkpoint and its output is dropped.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancel_with(session_id, "cancelled by user")
    }

    fn cancel_with(&self, session_id: &str, reason: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = jobs.get_mut(session_id) else {
            return false;
        };
        if entry.job.is_terminal() {
            return false;
        }

        let phase = match entry.job.current_phase() {
            2 => AnalysisPhase::Columns,
            3 => AnalysisPhase::Examples,
            _ => AnalysisPhase::Tables,
        };
        entry.job.cancelled = true;
        entry.cancel.cancel();
        entry.append(phase, &format!("{FAILURE_MARKER} {reason}"));
        info!(session_id, phase = phase.number(), reason, "Analysis cancelled");
        true
    }

    /// Cancels every running job.
    pub fn shutdown(&self) {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        for entry in jobs.values() {
            entry.cancel.cancel();
        }
    }

    fn purge_expired(&self, jobs: &mut HashMap<String, JobEntry>) {
        let retention = self.retention;
        jobs.retain(|_, entry| match entry.finished {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
    }

    fn update(&self, session_id: &str, job_id: Uuid, f: impl FnOnce(&mut JobEntry)) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = jobs.get_mut(session_id) {
            if entry.job_id == job_id && !entry.job.cancelled {
                f(entry);
            }
        }
    }

    async fn run(
        &self,
        session_id: String,
        job_id: Uuid,
        connection_id: i64,
        cancel: CancellationToken,
    ) {
        for phase in AnalysisPhase::ALL {
            if cancel.is_cancelled() {
                debug!(session_id, phase = phase.number(), "Analysis stopped before phase");
                return;
            }

            let log = PhaseLog {
                jobs: self.jobs.clone(),
                session_id: session_id.clone(),
                job_id,
                phase,
            };
            log.append(&format!("Generating {}...", phase.label()));

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id, phase = phase.number(), "Phase interrupted");
                    return;
                }
                result = self.worker.run_phase(phase, connection_id, &log) => result,
            };

            let outcome = match result {
                Ok(output) if cancel.is_cancelled() => {
                    debug!(session_id, items = output.len(), "Discarding output of cancelled phase");
                    return;
                }
                Ok(output) => self.commit(connection_id, output).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(saved) => {
                    self.update(&session_id, job_id, |entry| {
                        entry.append(
                            phase,
                            &format!("{COMPLETE_MARKER} {saved} {} saved", phase.label()),
                        )
                    });
                }
                Err(e) => {
                    warn!(session_id, phase = phase.number(), error = %e, "Analysis phase failed");
                    self.update(&session_id, job_id, |entry| {
                        entry.append(phase, &format!("{FAILURE_MARKER} {e}"))
                    });
                    return;
                }
            }
        }

        for sid in self.sessions.sessions_for_connection(connection_id) {
            self.sessions.invalidate_knowledge_base(&sid);
        }
        info!(session_id, connection_id, "Analysis complete");
    }

    async fn commit(&self, connection_id: i64, output: PhaseOutput) -> Result<usize> {
        let saved = output.len();
        match &output {
            PhaseOutput::Tables(tables) => {
                self.knowledge
                    .save_table_explanations(connection_id, tables)
                    .await?
            }
            PhaseOutput::Columns(columns) => {
                self.knowledge
                    .save_column_explanations(connection_id, columns)
                    .await?
            }
            PhaseOutput::Examples(examples) => {
                self.knowledge.save_sql_examples(connection_id, examples).await?
            }
        }
        Ok(saved)
    }
}

/// A job never outlives its connection session.
impl SessionListener for AnalysisJobManager {
    fn session_closed(&self, session: &ConnectionSession) {
        self.cancel_with(&session.id, "connection session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TERMINAL_PHASE;
    use crate::db::ReadOnlyStatus;
    use crate::error::CopilotError;
    use crate::knowledge::{InMemoryKnowledgeStore, KnowledgeBase, SqlExample};
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Worker that finishes instantly, or parks in a chosen phase.
    #[derive(Default)]
    struct ScriptedWorker {
        park_in: Option<AnalysisPhase>,
        fail_in: Option<AnalysisPhase>,
        started: Mutex<Vec<AnalysisPhase>>,
        parked: Notify,
    }

    #[async_trait]
    impl AnalysisWorker for ScriptedWorker {
        async fn run_phase(
            &self,
            phase: AnalysisPhase,
            _connection_id: i64,
            log: &PhaseLog,
        ) -> Result<PhaseOutput> {
            self.started.lock().unwrap().push(phase);
            log.append("working");
            if self.fail_in == Some(phase) {
                return Err(CopilotError::llm("model exploded"));
            }
            if self.park_in == Some(phase) {
                self.parked.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(match phase {
                AnalysisPhase::Tables => {
                    let mut t = BTreeMap::new();
                    t.insert("users".to_string(), "People".to_string());
                    PhaseOutput::Tables(t)
                }
                AnalysisPhase::Columns => PhaseOutput::Columns(vec![]),
                AnalysisPhase::Examples => PhaseOutput::Examples(vec![SqlExample {
                    question: "How many users?".to_string(),
                    sql: "SELECT COUNT(*) FROM users".to_string(),
                }]),
            })
        }
    }

    struct Harness {
        manager: AnalysisJobManager,
        worker: Arc<ScriptedWorker>,
        knowledge: Arc<InMemoryKnowledgeStore>,
        sessions: Arc<InMemorySessionStore>,
        session_id: String,
    }

    fn harness(worker: ScriptedWorker) -> Harness {
        let worker = Arc::new(worker);
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let session_id = sessions
            .create_connection_session(1, ReadOnlyStatus::Unknown)
            .id;
        let manager = AnalysisJobManager::new(worker.clone(), knowledge.clone(), sessions.clone());
        Harness {
            manager,
            worker,
            knowledge,
            sessions,
            session_id,
        }
    }

    async fn wait_terminal(manager: &AnalysisJobManager, session_id: &str) -> AnalysisStatus {
        for _ in 0..200 {
            let status = manager.status(session_id);
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("analysis did not finish");
    }

    #[tokio::test]
    async fn test_unknown_session_cannot_start() {
        let h = harness(ScriptedWorker::default());
        assert_eq!(h.manager.start("nope").unwrap_err(), ErrorCode::InvalidSession);
    }

    #[tokio::test]
    async fn test_successful_run_commits_and_invalidates_cache() {
        let h = harness(ScriptedWorker::default());
        h.sessions
            .set_cache_knowledge_base(&h.session_id, Arc::new(KnowledgeBase::default()));

        h.manager.start(&h.session_id).unwrap();
        let status = wait_terminal(&h.manager, &h.session_id).await;

        assert_eq!(status.current_phase, TERMINAL_PHASE);
        assert!(!status.phases.has_failure());
        assert!(status.phases.phase3.contains(COMPLETE_MARKER));
        assert_eq!(status.cancelled, Some(false));

        let kb = h.knowledge.load(1).await.unwrap();
        assert_eq!(kb.table_explanations.len(), 1);
        assert_eq!(kb.sql_examples.len(), 1);
        assert!(h.sessions.get_cache_knowledge_base(&h.session_id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_phase_two() {
        let h = harness(ScriptedWorker {
            park_in: Some(AnalysisPhase::Columns),
            ..Default::default()
        });

        h.manager.start(&h.session_id).unwrap();
        h.worker.parked.notified().await;
        assert_eq!(h.manager.status(&h.session_id).current_phase, 2);

        assert!(h.manager.cancel(&h.session_id));
        let status = h.manager.status(&h.session_id);
        assert_eq!(status.current_phase, TERMINAL_PHASE);
        assert!(status.phases.phase2.contains(FAILURE_MARKER));
        assert_eq!(status.cancelled, Some(true));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = h.worker.started.lock().unwrap().clone();
        assert_eq!(started, vec![AnalysisPhase::Tables, AnalysisPhase::Columns]);
        assert!(h.manager.status(&h.session_id).phases.phase3.is_empty());
        // Cancelling a terminal job is a no-op.
        assert!(!h.manager.cancel(&h.session_id));
    }

    #[tokio::test]
    async fn test_phase_failure_is_terminal() {
        let h = harness(ScriptedWorker {
            fail_in: Some(AnalysisPhase::Tables),
            ..Default::default()
        });
        h.manager.start(&h.session_id).unwrap();
        let status = wait_terminal(&h.manager, &h.session_id).await;

        assert!(status.phases.phase1.contains(FAILURE_MARKER));
        assert!(status.phases.phase1.contains("model exploded"));
        assert!(h.knowledge.load(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_while_running_returns_existing_job() {
        let h = harness(ScriptedWorker {
            park_in: Some(AnalysisPhase::Tables),
            ..Default::default()
        });
        h.manager.start(&h.session_id).unwrap();
        h.worker.parked.notified().await;

        let again = h.manager.start(&h.session_id).unwrap();
        assert_eq!(again.current_phase, 1);
        assert_eq!(h.worker.started.lock().unwrap().len(), 1);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn test_finished_job_expires_after_retention() {
        let h = harness(ScriptedWorker::default());
        let manager = h.manager.clone().with_retention(Duration::from_millis(250));
        manager.start(&h.session_id).unwrap();
        wait_terminal(&manager, &h.session_id).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!manager.status(&h.session_id).found);
    }
}
