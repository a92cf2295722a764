//! In-memory service manager for tests and hosts without a supervisor.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cast_jobs::{JobError, JobResult};
use tracing::debug;

use super::{SERVICE_TYPE, ServiceDetails, ServiceManager, ServiceSpec, ServiceState, ServiceStatus};

const MOCK_TIME: u64 = 1_234_567;

#[derive(Debug, Clone)]
struct MockService {
    spec: ServiceSpec,
    enabled: bool,
    pid: Option<u32>,
    stuck: bool,
}

#[derive(Default)]
struct MockState {
    services: BTreeMap<String, MockService>,
    next_pid: u32,
}

#[derive(Default)]
pub struct MockServiceManager {
    state: Mutex<MockState>,
}

impl MockServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The `ServiceSpec` a service was created with.
    pub fn spec(&self, name: &str) -> Option<ServiceSpec> {
        self.state().services.get(name).map(|s| s.spec.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state()
            .services
            .get(name)
            .is_some_and(|s| s.pid.is_some())
    }

    /// Make `name` refuse stop requests, like a supervisor that has gone
    /// away.
    pub fn set_stuck(&self, name: &str) {
        if let Some(service) = self.state().services.get_mut(name) {
            service.stuck = true;
        }
    }

    fn with_service<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockService, &mut u32) -> JobResult<T>,
    ) -> JobResult<T> {
        let mut state = self.state();
        let MockState { services, next_pid } = &mut *state;
        let service = services
            .get_mut(name)
            .ok_or_else(|| JobError::not_found(SERVICE_TYPE, name))?;
        f(service, next_pid)
    }

    fn run(&self, name: &str, up: bool) -> JobResult<()> {
        self.with_service(name, |service, next_pid| {
            if !service.enabled {
                return Err(JobError::invalid("Service disabled"));
            }
            if !up && service.stuck {
                return Err(JobError::Internal(format!("supervisor for {name} not responding")));
            }
            service.pid = if up {
                *next_pid += 1;
                Some(1000 + *next_pid)
            } else {
                None
            };
            debug!(service = name, up, "mock service state changed");
            Ok(())
        })
    }
}

fn details(service: &MockService) -> ServiceDetails {
    let status = service.enabled.then(|| ServiceStatus {
        time: MOCK_TIME,
        pid: service.pid.map_or(-1, i64::from),
        state: if service.pid.is_some() {
            ServiceState::Running
        } else {
            ServiceState::Down
        },
    });
    ServiceDetails {
        name: service.spec.name.clone(),
        enabled: service.enabled,
        status,
    }
}

#[async_trait]
impl ServiceManager for MockServiceManager {
    async fn create(&self, spec: &ServiceSpec) -> JobResult<()> {
        let mut state = self.state();
        if state.services.contains_key(&spec.name) {
            return Err(JobError::already_exists(SERVICE_TYPE, &spec.name));
        }
        state.services.insert(
            spec.name.clone(),
            MockService {
                spec: spec.clone(),
                enabled: false,
                pid: None,
                stuck: false,
            },
        );
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        self.state().services.contains_key(name)
    }

    async fn details(&self, name: &str) -> JobResult<ServiceDetails> {
        self.with_service(name, |service, _| Ok(details(service)))
    }

    async fn enable(&self, name: &str) -> JobResult<()> {
        self.with_service(name, |service, _| {
            service.enabled = true;
            Ok(())
        })
    }

    async fn disable(&self, name: &str) -> JobResult<()> {
        self.with_service(name, |service, _| {
            service.enabled = false;
            service.pid = None;
            Ok(())
        })
    }

    async fn start(&self, name: &str) -> JobResult<()> {
        self.run(name, true)
    }

    async fn stop(&self, name: &str) -> JobResult<()> {
        self.run(name, false)
    }

    async fn restart(&self, name: &str) -> JobResult<()> {
        self.run(name, true)
    }

    async fn destroy(&self, name: &str) -> JobResult<()> {
        self.state()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| JobError::not_found(SERVICE_TYPE, name))
    }

    async fn list(&self) -> JobResult<Vec<ServiceDetails>> {
        Ok(self.state().services.values().map(details).collect())
    }
}
