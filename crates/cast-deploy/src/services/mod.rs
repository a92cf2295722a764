//! Supervised services.
//!
//! Every instance version runs as one service named `<instance>@<version>`.
//! The supervisor is abstracted by [`ServiceManager`]; runit is the real
//! backend and [`MockServiceManager`] keeps everything in memory.

mod mock;
mod runit;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use cast_core::AppType;
use cast_jobs::{JobError, JobResult};
use serde::{Deserialize, Serialize};

pub use mock::MockServiceManager;
pub use runit::{RunitServiceManager, parse_status_record};

pub const SERVICE_TYPE: &str = "Service";

pub fn service_name(instance: &str, version: &str) -> String {
    format!("{instance}@{version}")
}

/// What a service runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub instance: String,
    pub working_dir: PathBuf,
    pub app_type: AppType,
    pub entry_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Down,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Seconds since the epoch at the last state change.
    pub time: u64,
    /// `-1` when no process is running.
    pub pid: i64,
    pub state: ServiceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub name: String,
    pub enabled: bool,
    /// Only reported for enabled services.
    pub status: Option<ServiceStatus>,
}

impl ServiceDetails {
    /// Details of a service that is not registered at all.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enable" => Ok(ServiceAction::Enable),
            "disable" => Ok(ServiceAction::Disable),
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(JobError::invalid(format!("Invalid service action: {other}"))),
        }
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync + 'static {
    /// Prepare backing directories. Called once at agent start.
    async fn init(&self) -> JobResult<()> {
        Ok(())
    }

    /// Register a new, disabled service.
    async fn create(&self, spec: &ServiceSpec) -> JobResult<()>;

    async fn exists(&self, name: &str) -> bool;

    async fn details(&self, name: &str) -> JobResult<ServiceDetails>;

    async fn enable(&self, name: &str) -> JobResult<()>;

    async fn disable(&self, name: &str) -> JobResult<()>;

    async fn start(&self, name: &str) -> JobResult<()>;

    async fn stop(&self, name: &str) -> JobResult<()>;

    async fn restart(&self, name: &str) -> JobResult<()>;

    /// Disable and unregister.
    async fn destroy(&self, name: &str) -> JobResult<()>;

    /// Every registered service, sorted by name.
    async fn list(&self) -> JobResult<Vec<ServiceDetails>>;

    async fn apply(&self, name: &str, action: ServiceAction) -> JobResult<()> {
        match action {
            ServiceAction::Enable => self.enable(name).await,
            ServiceAction::Disable => self.disable(name).await,
            ServiceAction::Start => self.start(name).await,
            ServiceAction::Stop => self.stop(name).await,
            ServiceAction::Restart => self.restart(name).await,
        }
    }
}
