//! Resources and their per-resource job queues.
//!
//! Every named resource owns a FIFO of admitted jobs and at most one drain
//! task. The drain task pops one job at a time, re-checks the resource's
//! existence against the job's CRUD intent, and runs the job body to
//! completion before looking at the next one. Jobs against different
//! resources run concurrently.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use crate::error::{JobError, JobResult};
use crate::job::{JobContext, JobHandle, JobOptions};
use crate::registry::JobRegistry;

/// A named entity whose mutations are serialized through a job queue.
pub trait Resource: Send + Sync + Sized + 'static {
    /// Display name of the resource kind, used in existence errors.
    const TYPE_NAME: &'static str;

    /// The closed set of jobs that can target this resource.
    type Job: JobSpec<Self>;

    fn name(&self) -> &str;

    /// Observe existence on disk. Never cached; called once per job.
    fn exists(&self) -> impl Future<Output = bool> + Send;

    /// Error reported when a job's intent does not match `exists`.
    fn existence_error(&self, exists: bool) -> JobError {
        if exists {
            JobError::already_exists(Self::TYPE_NAME, self.name())
        } else {
            JobError::not_found(Self::TYPE_NAME, self.name())
        }
    }
}

/// Body of a job targeting resources of type `R`.
pub trait JobSpec<R>: Send + 'static {
    /// Short name used in logs and snapshots, e.g. `CreateInstance`.
    fn kind(&self) -> &'static str;

    fn options(&self) -> JobOptions;

    fn run(
        self,
        resource: Arc<R>,
        ctx: JobContext,
    ) -> impl Future<Output = JobResult<Value>> + Send + 'static;
}

/// A constructed job that has not been admitted yet.
pub struct Job<R: Resource> {
    spec: R::Job,
}

impl<R: Resource> Job<R> {
    pub fn new(spec: R::Job) -> Self {
        Self { spec }
    }

    pub fn options(&self) -> JobOptions {
        self.spec.options()
    }

    /// Admit the job to `slot`'s queue. Consumes the job, so it can only
    /// ever target one resource.
    pub fn enqueue_for(self, slot: &Arc<ResourceSlot<R>>) -> JobHandle {
        slot.enqueue_job(self.spec)
    }
}

struct Pending<R: Resource> {
    handle: JobHandle,
    spec: R::Job,
}

struct SlotQueue<R: Resource> {
    pending: VecDeque<Pending<R>>,
    running: bool,
}

/// A resource together with its job queue.
pub struct ResourceSlot<R: Resource> {
    resource: Arc<R>,
    registry: JobRegistry,
    queue: Mutex<SlotQueue<R>>,
}

impl<R: Resource> ResourceSlot<R> {
    fn new(resource: R, registry: JobRegistry) -> Self {
        Self {
            resource: Arc::new(resource),
            registry,
            queue: Mutex::new(SlotQueue {
                pending: VecDeque::new(),
                running: false,
            }),
        }
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }

    /// Jobs admitted but not yet finished, including the running one.
    pub fn backlog(&self) -> usize {
        let queue = self.queue();
        queue.pending.len() + usize::from(queue.running)
    }

    fn queue(&self) -> MutexGuard<'_, SlotQueue<R>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue_job(self: &Arc<Self>, spec: R::Job) -> JobHandle {
        let handle = self
            .registry
            .admit(spec.kind(), R::TYPE_NAME, self.resource.name());

        let start_drain = {
            let mut queue = self.queue();
            queue.pending.push_back(Pending {
                handle: handle.clone(),
                spec,
            });
            handle.mark_queued();
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        };

        if start_drain {
            let slot = Arc::clone(self);
            tokio::spawn(async move { slot.drain().await });
        }
        handle
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.queue();
                match queue.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };
            self.start(next).await;
        }
    }

    async fn start(&self, pending: Pending<R>) {
        let Pending { handle, spec } = pending;

        let exists = self.resource.exists().await;
        if !spec.options().can_handle_existence(exists) {
            debug!(
                job_id = handle.id(),
                resource = %self.resource.name(),
                exists,
                "existence precondition not met"
            );
            // Release whatever the job holds before waiters wake.
            drop(spec);
            handle.complete(Err(self.resource.existence_error(exists)));
            return;
        }

        handle.mark_running();
        let body = spec.run(Arc::clone(&self.resource), JobContext::new(handle.clone()));
        // Run the body on its own task so a panic fails this job instead of
        // killing the queue.
        let outcome = match tokio::spawn(body).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(JobError::Internal(format!("job aborted: {join_err}"))),
        };
        handle.complete(outcome);
    }
}

/// Index of the known resources of one kind, by name.
///
/// Slots are kept for the life of the index even after the backing entity
/// is removed, so jobs admitted under one name always share one queue.
pub struct ResourceIndex<R: Resource> {
    registry: JobRegistry,
    slots: Mutex<HashMap<String, Arc<ResourceSlot<R>>>>,
}

impl<R: Resource> ResourceIndex<R> {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<ResourceSlot<R>>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceSlot<R>>> {
        self.slots().get(name).cloned()
    }

    /// Look up `name`, building the resource on first reference.
    pub fn get_or_insert_with(
        &self,
        name: &str,
        build: impl FnOnce() -> R,
    ) -> Arc<ResourceSlot<R>> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(name) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(ResourceSlot::new(build(), self.registry.clone()));
        slots.insert(name.to_string(), Arc::clone(&slot));
        slot
    }

    /// Construct `spec` and admit it against `name`.
    pub fn submit(&self, name: &str, build: impl FnOnce() -> R, spec: R::Job) -> JobHandle {
        let slot = self.get_or_insert_with(name, build);
        Job::new(spec).enqueue_for(&slot)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// An in-memory resource whose existence is a flag.
    struct Widget {
        name: String,
        exists: AtomicBool,
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: Mutex<Vec<u32>>,
    }

    impl Widget {
        fn new(name: &str, exists: bool) -> Self {
            Self {
                name: name.to_string(),
                exists: AtomicBool::new(exists),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            }
        }
    }

    /// Flags when the job carrying it is dropped.
    struct Claim(Arc<AtomicBool>);

    impl Drop for Claim {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    enum WidgetJob {
        Create(u32),
        Touch(u32),
        Delete,
        Panic,
        Claimed(Claim),
    }

    impl Resource for Widget {
        const TYPE_NAME: &'static str = "Widget";
        type Job = WidgetJob;

        fn name(&self) -> &str {
            &self.name
        }

        async fn exists(&self) -> bool {
            self.exists.load(Ordering::SeqCst)
        }
    }

    impl JobSpec<Widget> for WidgetJob {
        fn kind(&self) -> &'static str {
            match self {
                WidgetJob::Create(_) => "CreateWidget",
                WidgetJob::Touch(_) => "TouchWidget",
                WidgetJob::Delete => "DeleteWidget",
                WidgetJob::Panic => "PanicWidget",
                WidgetJob::Claimed(_) => "ClaimWidget",
            }
        }

        fn options(&self) -> JobOptions {
            match self {
                WidgetJob::Create(_) => JobOptions::CREATE,
                WidgetJob::Touch(_) => JobOptions::CREATE | JobOptions::UPDATE,
                WidgetJob::Delete => JobOptions::DELETE,
                WidgetJob::Panic => JobOptions::CREATE | JobOptions::UPDATE,
                WidgetJob::Claimed(_) => JobOptions::CREATE,
            }
        }

        fn run(
            self,
            widget: Arc<Widget>,
            ctx: JobContext,
        ) -> impl Future<Output = JobResult<Value>> + Send + 'static {
            async move {
                let now = widget.running.fetch_add(1, Ordering::SeqCst) + 1;
                widget.max_running.fetch_max(now, Ordering::SeqCst);
                let result = match self {
                    WidgetJob::Create(n) | WidgetJob::Touch(n) => {
                        widget.started.lock().unwrap().push(n);
                        ctx.message(format!("job {n}"));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        widget.exists.store(true, Ordering::SeqCst);
                        Ok(json!(n))
                    }
                    WidgetJob::Delete => {
                        widget.exists.store(false, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                    WidgetJob::Panic => panic!("widget exploded"),
                    WidgetJob::Claimed(_) => Ok(Value::Null),
                };
                widget.running.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    fn index() -> ResourceIndex<Widget> {
        ResourceIndex::new(JobRegistry::default())
    }

    #[tokio::test]
    async fn jobs_run_in_admission_order_one_at_a_time() {
        let index = index();
        let handles: Vec<JobHandle> = (0..10)
            .map(|n| index.submit("w", || Widget::new("w", false), WidgetJob::Touch(n)))
            .collect();

        for h in &handles {
            h.wait().await.unwrap();
        }

        let slot = index.get("w").unwrap();
        let widget = slot.resource();
        assert_eq!(*widget.started.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(widget.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(slot.backlog(), 0);

        let ids: Vec<u64> = handles.iter().map(JobHandle::id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn create_against_existing_never_runs() {
        let index = index();
        let slot = index.get_or_insert_with("w", || Widget::new("w", true));
        let handle = Job::new(WidgetJob::Create(1)).enqueue_for(&slot);

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Widget 'w' already exists.");
        assert!(slot.resource().started.lock().unwrap().is_empty());
        assert!(handle.messages().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_job_is_dropped_before_waiters_wake() {
        let index = index();
        let released = Arc::new(AtomicBool::new(false));
        let claim = Claim(Arc::clone(&released));
        let handle = index.submit("w", || Widget::new("w", true), WidgetJob::Claimed(claim));

        handle.wait().await.unwrap_err();
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delete_against_missing_never_runs() {
        let index = index();
        let handle = index.submit("w", || Widget::new("w", false), WidgetJob::Delete);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, JobError::not_found("Widget", "w"));
    }

    #[tokio::test]
    async fn existence_is_rechecked_per_job() {
        let index = index();
        let build = || Widget::new("w", false);
        let first = index.submit("w", build, WidgetJob::Create(1));
        let second = index.submit("w", build, WidgetJob::Create(2));
        let delete = index.submit("w", build, WidgetJob::Delete);
        let third = index.submit("w", build, WidgetJob::Create(3));

        assert_eq!(first.wait().await.unwrap(), json!(1));
        assert!(matches!(
            second.wait().await,
            Err(JobError::AlreadyExists { .. })
        ));
        delete.wait().await.unwrap();
        assert_eq!(third.wait().await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn panicking_job_fails_and_queue_continues() {
        let index = index();
        let build = || Widget::new("w", false);
        let boom = index.submit("w", build, WidgetJob::Panic);
        let after = index.submit("w", build, WidgetJob::Touch(9));

        assert!(matches!(boom.wait().await, Err(JobError::Internal(_))));
        assert_eq!(boom.status(), JobStatus::Completed);
        assert_eq!(after.wait().await.unwrap(), json!(9));
    }

    #[tokio::test]
    async fn distinct_resources_run_concurrently() {
        let index = index();
        let a = index.submit("a", || Widget::new("a", false), WidgetJob::Touch(1));
        let b = index.submit("b", || Widget::new("b", false), WidgetJob::Touch(2));
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(index.names(), vec!["a", "b"]);
        assert_eq!(index.registry().list_jobs().len(), 2);
    }

    #[tokio::test]
    async fn progress_messages_are_recorded() {
        let index = index();
        let handle = index.submit("w", || Widget::new("w", false), WidgetJob::Touch(4));
        handle.wait().await.unwrap();
        assert_eq!(handle.messages(), vec!["job 4"]);
    }

    #[test]
    fn unadmitted_job_reports_its_options() {
        let job: Job<Widget> = Job::new(WidgetJob::Delete);
        assert_eq!(job.options(), JobOptions::DELETE);
    }
}
