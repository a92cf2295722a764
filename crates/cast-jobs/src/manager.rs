//! The job manager: registry of resource and general managers.
//!
//! Resource managers own a resource index and load on-disk state in
//! `init`; general managers (temp files and the like) are initialized
//! only after every resource manager is registered. Within each group,
//! managers are kept in registration order.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{JobError, JobResult};
use crate::job::{JobHandle, JobId, JobSnapshot};
use crate::registry::JobRegistry;

#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Name the manager is registered and looked up under.
    fn name(&self) -> &'static str;

    /// Prepare on-disk state. Registration only happens once this succeeds.
    async fn init(&self) -> JobResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    Resource,
    General,
}

struct Registered {
    kind: ManagerKind,
    manager: Arc<dyn Manager>,
    any: Arc<dyn Any + Send + Sync>,
}

pub struct JobManager {
    registry: JobRegistry,
    managers: Vec<Registered>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            registry: JobRegistry::new(),
            managers: Vec::new(),
        }
    }

    /// The registry resource managers admit jobs through.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub async fn register_resource_manager<M: Manager>(&mut self, manager: Arc<M>) -> JobResult<()> {
        if self.managers.iter().any(|m| m.kind == ManagerKind::General) {
            return Err(JobError::Internal(format!(
                "resource manager {} registered after general managers",
                manager.name()
            )));
        }
        self.register(ManagerKind::Resource, manager).await
    }

    pub async fn register_general_manager<M: Manager>(&mut self, manager: Arc<M>) -> JobResult<()> {
        self.register(ManagerKind::General, manager).await
    }

    async fn register<M: Manager>(&mut self, kind: ManagerKind, manager: Arc<M>) -> JobResult<()> {
        let name = manager.name();
        if self.managers.iter().any(|m| m.manager.name() == name) {
            return Err(JobError::Internal(format!("manager {name} already registered")));
        }

        manager.init().await?;
        info!(manager = name, ?kind, "manager registered");

        self.managers.push(Registered {
            kind,
            manager: manager.clone(),
            any: manager,
        });
        Ok(())
    }

    /// Typed lookup of a registered manager.
    pub fn get_manager<M: Manager>(&self) -> Option<Arc<M>> {
        self.managers
            .iter()
            .find_map(|m| Arc::clone(&m.any).downcast::<M>().ok())
    }

    pub fn get_manager_by_name(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.managers
            .iter()
            .find(|m| m.manager.name() == name)
            .map(|m| Arc::clone(&m.manager))
    }

    /// Registered manager names: resource managers first, then general ones.
    pub fn manager_names(&self) -> Vec<&'static str> {
        self.managers.iter().map(|m| m.manager.name()).collect()
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.registry.list_jobs()
    }

    pub fn get_job(&self, id: JobId) -> Option<JobHandle> {
        self.registry.get_job(id)
    }
}
