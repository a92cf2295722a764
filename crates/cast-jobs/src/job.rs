//! Job lifecycle: status, CRUD intent, and the shared handle callers wait on.
//!
//! A job moves `unassigned → assigned → queued → running → completed` and
//! never backwards. The handle is the only thing shared between the queue
//! that drives the job and the callers observing it; completion is
//! published once through a watch channel so any number of waiters see the
//! same outcome, and lifecycle events are fanned out over a broadcast
//! channel for progress consumers.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::{JobError, JobResult};

pub type JobId = u64;

/// Result a job completes with.
pub type JobOutcome = JobResult<Value>;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Unassigned,
    Assigned,
    Queued,
    Running,
    Completed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Unassigned => "unassigned",
            JobStatus::Assigned => "assigned",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// CRUD intent of a job, used to decide which existence states it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobOptions(u8);

impl JobOptions {
    pub const CREATE: JobOptions = JobOptions(1);
    pub const UPDATE: JobOptions = JobOptions(2);
    pub const DELETE: JobOptions = JobOptions(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: JobOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Anything that cannot create requires the resource to be there.
    pub const fn must_exist(self) -> bool {
        !self.contains(JobOptions::CREATE)
    }

    /// Only a pure create refuses an existing resource.
    pub fn must_not_exist(self) -> bool {
        self == JobOptions::CREATE
    }

    pub fn can_handle_existence(self, exists: bool) -> bool {
        if exists {
            !self.must_not_exist()
        } else {
            !self.must_exist()
        }
    }
}

impl BitOr for JobOptions {
    type Output = JobOptions;

    fn bitor(self, rhs: JobOptions) -> JobOptions {
        JobOptions(self.0 | rhs.0)
    }
}

/// Lifecycle notifications published by a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum JobEvent {
    Ready,
    Started,
    Message(String),
    Succeeded(Value),
    Failed(JobError),
}

/// Serializable outcome as reported in job listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum JobResultView {
    Success(Value),
    Error {
        message: String,
        code: u16,
        error: JobError,
    },
}

impl From<&JobOutcome> for JobResultView {
    fn from(outcome: &JobOutcome) -> Self {
        match outcome {
            Ok(value) => JobResultView::Success(value.clone()),
            Err(err) => JobResultView::Error {
                message: err.to_string(),
                code: err.status_code(),
                error: err.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: &'static str,
    pub resource_type: &'static str,
    pub resource_name: String,
    pub status: JobStatus,
    pub messages: Vec<String>,
    pub result: Option<JobResultView>,
}

struct JobState {
    status: JobStatus,
    messages: Vec<String>,
    result: Option<JobOutcome>,
}

struct JobInner {
    id: JobId,
    kind: &'static str,
    resource_type: &'static str,
    resource_name: String,
    state: Mutex<JobState>,
    done: watch::Sender<Option<JobOutcome>>,
    events: broadcast::Sender<JobEvent>,
}

/// Shared view of an admitted job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("resource", &self.inner.resource_name)
            .field("status", &self.status())
            .finish()
    }
}

impl JobHandle {
    /// A freshly admitted job: it has an id and a target, so it is `assigned`.
    pub(crate) fn new(
        id: JobId,
        kind: &'static str,
        resource_type: &'static str,
        resource_name: String,
    ) -> Self {
        let (done, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(JobInner {
                id,
                kind,
                resource_type,
                resource_name,
                state: Mutex::new(JobState {
                    status: JobStatus::Assigned,
                    messages: Vec::new(),
                    result: None,
                }),
                done,
                events,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    pub fn resource_type(&self) -> &'static str {
        self.inner.resource_type
    }

    pub fn resource_name(&self) -> &str {
        &self.inner.resource_name
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn messages(&self) -> Vec<String> {
        self.state().messages.clone()
    }

    /// The outcome, if the job has completed.
    pub fn result(&self) -> Option<JobOutcome> {
        self.state().result.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == JobStatus::Completed
    }

    /// Events published from now on. Events emitted before subscribing are
    /// not replayed; use [`JobHandle::snapshot`] for the state so far.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once the job has completed.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.inner.done.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| Err(JobError::Internal("job outcome missing".into()))),
            // The sender lives as long as this handle, so this is unreachable
            // in practice.
            Err(_) => Err(JobError::Internal("job dropped before completing".into())),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            id: self.inner.id,
            kind: self.inner.kind,
            resource_type: self.inner.resource_type,
            resource_name: self.inner.resource_name.clone(),
            status: state.status,
            messages: state.messages.clone(),
            result: state.result.as_ref().map(JobResultView::from),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        // A poisoned lock only means a panic elsewhere while holding it;
        // the state itself is always left consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Move to `next`. Regressions and repeats are logged and ignored.
    fn advance(&self, next: JobStatus) -> bool {
        let mut state = self.state();
        if next <= state.status {
            warn!(
                job_id = self.inner.id,
                from = %state.status,
                to = %next,
                "ignoring non-monotonic job status transition"
            );
            return false;
        }
        state.status = next;
        true
    }

    pub(crate) fn mark_queued(&self) {
        if self.advance(JobStatus::Queued) {
            debug!(
                job_id = self.inner.id,
                kind = self.inner.kind,
                resource = %self.inner.resource_name,
                "job queued"
            );
            self.emit(JobEvent::Ready);
        }
    }

    pub(crate) fn mark_running(&self) {
        if self.advance(JobStatus::Running) {
            info!(
                job_id = self.inner.id,
                kind = self.inner.kind,
                resource_type = self.inner.resource_type,
                resource = %self.inner.resource_name,
                "job started"
            );
            self.emit(JobEvent::Started);
        }
    }

    pub(crate) fn push_message(&self, message: String) {
        {
            let mut state = self.state();
            if state.status == JobStatus::Completed {
                warn!(job_id = self.inner.id, %message, "message after completion dropped");
                return;
            }
            state.messages.push(message.clone());
        }
        debug!(job_id = self.inner.id, %message, "job progress");
        self.emit(JobEvent::Message(message));
    }

    /// Freeze the outcome. A second completion is a bug in the job body or
    /// queue; it is logged and the first outcome stands.
    pub(crate) fn complete(&self, outcome: JobOutcome) {
        {
            let mut state = self.state();
            if state.result.is_some() {
                error!(job_id = self.inner.id, "job completed twice, keeping first outcome");
                return;
            }
            state.status = JobStatus::Completed;
            state.result = Some(outcome.clone());
        }

        match &outcome {
            Ok(_) => info!(
                job_id = self.inner.id,
                kind = self.inner.kind,
                resource = %self.inner.resource_name,
                "job succeeded"
            ),
            Err(err) => warn!(
                job_id = self.inner.id,
                kind = self.inner.kind,
                resource = %self.inner.resource_name,
                error = %err,
                "job failed"
            ),
        }

        let event = match &outcome {
            Ok(value) => JobEvent::Succeeded(value.clone()),
            Err(err) => JobEvent::Failed(err.clone()),
        };
        self.inner.done.send_replace(Some(outcome));
        self.emit(event);
    }
}

/// Passed to a running job body for progress reporting.
#[derive(Clone)]
pub struct JobContext {
    handle: JobHandle,
}

impl JobContext {
    pub(crate) fn new(handle: JobHandle) -> Self {
        Self { handle }
    }

    pub fn job_id(&self) -> JobId {
        self.handle.id()
    }

    /// Append a progress message to the job's log.
    pub fn message(&self, message: impl Into<String>) {
        self.handle.push_message(message.into());
    }
}
