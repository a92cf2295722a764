//! Agent assembly.

use std::sync::Arc;

use cast_bundles::{BundleStore, TempFileManager};
use cast_ca::{CaManager, CertGenerator, OpensslCertGenerator};
use cast_core::AgentConfig;
use cast_core::config::ServiceManagerKind;
use cast_deploy::{InstanceManager, MockServiceManager, RunitServiceManager, ServiceManager};
use cast_jobs::{JobManager, JobResult};
use tracing::info;

/// Every subsystem of a running agent.
pub struct Agent {
    pub config: AgentConfig,
    pub jobs: JobManager,
    pub ca: Arc<CaManager>,
    pub bundles: Arc<BundleStore>,
    pub instances: Arc<InstanceManager>,
    pub tempfiles: Arc<TempFileManager>,
}

impl Agent {
    /// Build the agent with the collaborators named in `config`.
    pub async fn init(config: AgentConfig) -> JobResult<Self> {
        let generator: Arc<dyn CertGenerator> =
            Arc::new(OpensslCertGenerator::new(config.certgen.clone()));
        let services: Arc<dyn ServiceManager> = match config.services.manager {
            ServiceManagerKind::Runit => Arc::new(RunitServiceManager::new(
                config.service_dir_available(),
                config.service_dir_enabled(),
                config.runit.clone(),
                config.node_binary.clone(),
            )),
            ServiceManagerKind::Mock => Arc::new(MockServiceManager::new()),
        };
        Self::init_with(config, generator, services).await
    }

    /// Build the agent around explicit collaborators. Resource managers
    /// are registered first (CA, bundles, instances), then general ones.
    pub async fn init_with(
        config: AgentConfig,
        generator: Arc<dyn CertGenerator>,
        services: Arc<dyn ServiceManager>,
    ) -> JobResult<Self> {
        let mut jobs = JobManager::new();
        let registry = jobs.registry().clone();

        let tempfiles = Arc::new(TempFileManager::new(config.tmp_dir()));
        let ca = Arc::new(CaManager::new(&config, registry.clone(), generator));
        let bundles = Arc::new(BundleStore::new(&config, registry.clone(), Arc::clone(&tempfiles)));
        let instances = Arc::new(InstanceManager::new(&config, registry, services));

        jobs.register_resource_manager(Arc::clone(&ca)).await?;
        jobs.register_resource_manager(Arc::clone(&bundles)).await?;
        jobs.register_resource_manager(Arc::clone(&instances)).await?;
        jobs.register_general_manager(Arc::clone(&tempfiles)).await?;

        info!(data_root = ?config.data_root, managers = ?jobs.manager_names(), "agent initialized");
        Ok(Self {
            config,
            jobs,
            ca,
            bundles,
            instances,
            tempfiles,
        })
    }
}
