//! Process-wide job id allocation and lookup.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::job::{JobHandle, JobId, JobSnapshot};

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    jobs: RwLock<BTreeMap<JobId, JobHandle>>,
}

/// Every job admitted during the lifetime of the process. Cheap to clone;
/// clones share state. Nothing is persisted across restarts.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and record a new job against a resource.
    pub(crate) fn admit(
        &self,
        kind: &'static str,
        resource_type: &'static str,
        resource_name: &str,
    ) -> JobHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = JobHandle::new(id, kind, resource_type, resource_name.to_string());
        self.inner
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, handle.clone());
        handle
    }

    pub fn get_job(&self, id: JobId) -> Option<JobHandle> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    /// Snapshots of all jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(JobHandle::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
