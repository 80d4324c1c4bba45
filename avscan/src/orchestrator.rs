//! Scan orchestration
//!
//! One [`ScanTask`] per input file, driven through
//! `Queued → Submitted → Polling → {Completed | Failed}` against a shared
//! [`AnalysisService`]. Tasks run on a bounded pool (`buffer_unordered`); excess
//! tasks wait for a free slot. A task's failure, including a panic, only ever
//! terminates that task. [`ScanOrchestrator::run_batch`] returns after every
//! task is terminal.

use crate::normalizer::normalize;
use crate::record_store::{persist_record, RecordPaths};
use crate::service::{AnalysisId, AnalysisService};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One file to scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanInput {
    pub file_path: PathBuf,
    /// Input file name; output files are named after it
    pub name: String,
    /// Content identifier (hex digest)
    pub identifier: String,
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// File read or upload failed
    Submission,
    /// Waiting for the remote analysis failed or timed out
    Wait,
    /// Fetching the finished analysis failed
    Retrieval,
    /// Writing the normalized record failed
    Persistence,
    /// The task panicked
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Submission => "submission",
            FailureKind::Wait => "wait",
            FailureKind::Retrieval => "retrieval",
            FailureKind::Persistence => "persistence",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Per-task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Submitted,
    Polling,
    Completed,
    Failed(FailureKind),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }

    /// Whether `next` directly follows `self` in the lifecycle
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, Submitted) | (Submitted, Polling) | (Polling, Completed) => true,
            (Queued | Submitted | Polling, Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => f.write_str("QUEUED"),
            TaskState::Submitted => f.write_str("SUBMITTED"),
            TaskState::Polling => f.write_str("POLLING"),
            TaskState::Completed => f.write_str("COMPLETED"),
            TaskState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

/// Recorded state change of one task
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub task_index: usize,
    pub old_state: TaskState,
    pub new_state: TaskState,
    pub transitioned_at: DateTime<Utc>,
}

/// Progress notifications for front ends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ScanEvent {
    TaskQueued {
        task_index: usize,
        name: String,
    },
    StateChanged {
        name: String,
        transition: StateTransition,
    },
    TaskFinished {
        task_index: usize,
        name: String,
        state: TaskState,
        failure: Option<TaskFailure>,
    },
}

/// In-flight scan of one file
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub task_index: usize,
    pub input: ScanInput,
    pub state: TaskState,
    pub output: RecordPaths,
    pub analysis_id: Option<AnalysisId>,
    pub failure: Option<TaskFailure>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ScanTask {
    pub fn new(task_index: usize, input: ScanInput, output_dir: &Path) -> Self {
        let output = RecordPaths::for_name(output_dir, &input.name);
        Self {
            task_index,
            input,
            state: TaskState::Queued,
            output,
            analysis_id: None,
            failure: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to `new_state`
    ///
    /// Returns `None` and leaves the task untouched if the move is not a legal
    /// lifecycle step; in particular terminal states are never left.
    pub fn transition_to(&mut self, new_state: TaskState) -> Option<StateTransition> {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(
                task = self.task_index,
                from = %self.state,
                to = %new_state,
                "Refusing illegal task state transition"
            );
            return None;
        }

        let transition = StateTransition {
            task_index: self.task_index,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;
        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }
        Some(transition)
    }

    /// Mark the task failed with `kind`
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Option<StateTransition> {
        let transition = self.transition_to(TaskState::Failed(kind))?;
        self.failure = Some(TaskFailure {
            kind,
            message: message.into(),
        });
        Some(transition)
    }
}

/// Terminal result of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_index: usize,
    pub input: ScanInput,
    pub state: TaskState,
    pub output: RecordPaths,
    /// The persisted normalized record, present only when `Completed`
    pub record: Option<Value>,
    pub failure: Option<TaskFailure>,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }
}

/// Outcomes of one batch, in input order
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl BatchReport {
    pub fn completed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| o.is_completed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| !o.is_completed())
    }

    pub fn completed_count(&self) -> usize {
        self.completed().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

/// Runs batches of scan tasks against one service session
pub struct ScanOrchestrator {
    service: Arc<dyn AnalysisService>,
    output_dir: PathBuf,
    concurrency: usize,
    event_tx: Option<mpsc::Sender<ScanEvent>>,
}

impl ScanOrchestrator {
    /// `concurrency` is the ceiling on simultaneously in-flight tasks (minimum 1)
    pub fn new(service: Arc<dyn AnalysisService>, output_dir: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            service,
            output_dir: output_dir.into(),
            concurrency: concurrency.max(1),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<ScanEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Scan every input; returns once all tasks are terminal
    pub async fn run_batch(&self, inputs: Vec<ScanInput>) -> BatchReport {
        let total = inputs.len();
        tracing::info!(tasks = total, concurrency = self.concurrency, "Starting scan batch");

        for (task_index, input) in inputs.iter().enumerate() {
            emit(
                &self.event_tx,
                ScanEvent::TaskQueued {
                    task_index,
                    name: input.name.clone(),
                },
            )
            .await;
        }

        let mut outcomes: Vec<TaskOutcome> = stream::iter(inputs.into_iter().enumerate())
            .map(|(task_index, input)| {
                let service = Arc::clone(&self.service);
                let event_tx = self.event_tx.clone();
                let task = ScanTask::new(task_index, input, &self.output_dir);
                run_isolated(service, task, event_tx)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|o| o.task_index);
        let report = BatchReport { outcomes };

        tracing::info!(
            total,
            completed = report.completed_count(),
            failed = report.failed_count(),
            "Scan batch finished"
        );
        report
    }
}

async fn emit(event_tx: &Option<mpsc::Sender<ScanEvent>>, event: ScanEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event).await;
    }
}

/// Drive one task; a panic inside it becomes `Failed(Internal)`
async fn run_isolated(
    service: Arc<dyn AnalysisService>,
    task: ScanTask,
    event_tx: Option<mpsc::Sender<ScanEvent>>,
) -> TaskOutcome {
    let mut fallback = task.clone();

    let outcome = match AssertUnwindSafe(drive(service, task, &event_tx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(file = %fallback.input.name, error = %message, "Scan task panicked");
            // The panicking future owned the live task; fail from the queued snapshot
            fallback.fail(FailureKind::Internal, format!("task panicked: {}", message));
            into_outcome(fallback, None)
        }
    };

    emit(
        &event_tx,
        ScanEvent::TaskFinished {
            task_index: outcome.task_index,
            name: outcome.input.name.clone(),
            state: outcome.state,
            failure: outcome.failure.clone(),
        },
    )
    .await;
    outcome
}

async fn drive(
    service: Arc<dyn AnalysisService>,
    mut task: ScanTask,
    event_tx: &Option<mpsc::Sender<ScanEvent>>,
) -> TaskOutcome {
    let name = task.input.name.clone();
    tracing::debug!(file = %name, identifier = %task.input.identifier, "Scan task starting");

    let content = match tokio::fs::read(&task.input.file_path).await {
        Ok(content) => content,
        Err(e) => {
            let message = format!("failed to read {}: {}", task.input.file_path.display(), e);
            return fail(task, FailureKind::Submission, message, event_tx).await;
        }
    };

    let analysis_id = match service.submit(&name, content).await {
        Ok(id) => id,
        Err(e) => return fail(task, FailureKind::Submission, e.to_string(), event_tx).await,
    };
    tracing::info!(file = %name, analysis_id = %analysis_id, "File submitted");
    task.analysis_id = Some(analysis_id.clone());
    advance(&mut task, TaskState::Submitted, event_tx).await;

    advance(&mut task, TaskState::Polling, event_tx).await;
    if let Err(e) = service.await_completion(&analysis_id).await {
        return fail(task, FailureKind::Wait, e.to_string(), event_tx).await;
    }

    let raw = match service.fetch(&analysis_id).await {
        Ok(raw) => raw,
        Err(e) => return fail(task, FailureKind::Retrieval, e.to_string(), event_tx).await,
    };

    let record = normalize(&raw);
    if let Err(e) = persist_record(&task.output, &record).await {
        return fail(task, FailureKind::Persistence, e.to_string(), event_tx).await;
    }

    advance(&mut task, TaskState::Completed, event_tx).await;
    tracing::info!(
        file = %name,
        output = %task.output.compact.display(),
        "Scan task completed"
    );
    into_outcome(task, Some(record))
}

async fn advance(task: &mut ScanTask, new_state: TaskState, event_tx: &Option<mpsc::Sender<ScanEvent>>) {
    if let Some(transition) = task.transition_to(new_state) {
        tracing::debug!(file = %task.input.name, state = %new_state, "Task state changed");
        emit(
            event_tx,
            ScanEvent::StateChanged {
                name: task.input.name.clone(),
                transition,
            },
        )
        .await;
    }
}

async fn fail(
    mut task: ScanTask,
    kind: FailureKind,
    message: String,
    event_tx: &Option<mpsc::Sender<ScanEvent>>,
) -> TaskOutcome {
    tracing::error!(file = %task.input.name, state = %task.state, error = %message, "Scan task failed");
    if let Some(transition) = task.fail(kind, message) {
        emit(
            event_tx,
            ScanEvent::StateChanged {
                name: task.input.name.clone(),
                transition,
            },
        )
        .await;
    }
    into_outcome(task, None)
}

fn into_outcome(task: ScanTask, record: Option<Value>) -> TaskOutcome {
    TaskOutcome {
        task_index: task.task_index,
        input: task.input,
        state: task.state,
        output: task.output,
        record,
        failure: task.failure,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> ScanInput {
        ScanInput {
            file_path: PathBuf::from(format!("/in/{}", name)),
            name: name.to_string(),
            identifier: "00".to_string(),
        }
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut task = ScanTask::new(0, input("a.exe"), Path::new("/out"));
        assert_eq!(task.output.compact, PathBuf::from("/out/a.exe.json"));

        for next in [TaskState::Submitted, TaskState::Polling, TaskState::Completed] {
            let transition = task.transition_to(next).unwrap();
            assert_eq!(transition.new_state, next);
        }
        assert!(task.state.is_terminal());
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = ScanTask::new(0, input("a.exe"), Path::new("/out"));
        task.fail(FailureKind::Submission, "boom").unwrap();

        assert!(task.transition_to(TaskState::Submitted).is_none());
        assert!(task.transition_to(TaskState::Completed).is_none());
        assert!(task.fail(FailureKind::Wait, "again").is_none());
        assert_eq!(task.state, TaskState::Failed(FailureKind::Submission));
        assert_eq!(task.failure.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_steps_cannot_be_skipped() {
        let mut task = ScanTask::new(0, input("a.exe"), Path::new("/out"));
        assert!(task.transition_to(TaskState::Polling).is_none());
        assert!(task.transition_to(TaskState::Completed).is_none());
        assert_eq!(task.state, TaskState::Queued);
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure {
            kind: FailureKind::Retrieval,
            message: "HTTP 500".to_string(),
        };
        assert_eq!(failure.to_string(), "retrieval error: HTTP 500");
        assert_eq!(TaskState::Failed(FailureKind::Wait).to_string(), "FAILED(wait)");
    }

    #[test]
    fn test_panic_message_payloads() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
