//! Resource manager for instances.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cast_core::{AgentConfig, BundleId, HostFacts, is_valid_identifier, is_valid_version};
use cast_jobs::{JobError, JobHandle, JobRegistry, JobResult, Manager, ResourceIndex};
use tracing::debug;

use crate::error::DeployError;
use crate::hooks::HookRunner;
use crate::instance::{DeployEnv, INSTANCE_TYPE, Instance, InstanceInfo, InstanceJob};
use crate::services::{ServiceAction, ServiceDetails, ServiceManager};
use crate::templates::{PlaceholderRenderer, TemplateRenderer};

pub const INSTANCE_MANAGER: &str = "instances";

pub struct InstanceManager {
    env: Arc<DeployEnv>,
    index: ResourceIndex<Instance>,
}

impl InstanceManager {
    pub fn new(config: &AgentConfig, registry: JobRegistry, services: Arc<dyn ServiceManager>) -> Self {
        Self::with_renderer(config, registry, services, Arc::new(PlaceholderRenderer))
    }

    pub fn with_renderer(
        config: &AgentConfig,
        registry: JobRegistry,
        services: Arc<dyn ServiceManager>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            env: Arc::new(DeployEnv {
                app_dir: config.app_dir(),
                extracted_dir: config.extracted_dir(),
                services,
                hooks: HookRunner::new(config.hooks.clone()),
                renderer,
                facts: HostFacts::gather(),
            }),
            index: ResourceIndex::new(registry),
        }
    }

    pub fn services(&self) -> &Arc<dyn ServiceManager> {
        &self.env.services
    }

    fn validate_name(name: &str) -> JobResult<()> {
        if is_valid_identifier(name) {
            Ok(())
        } else {
            Err(DeployError::InvalidInstanceName.into())
        }
    }

    fn submit(&self, name: &str, job: InstanceJob) -> JobResult<JobHandle> {
        Self::validate_name(name)?;
        let env = Arc::clone(&self.env);
        Ok(self.index.submit(name, || Instance::new(name, env), job))
    }

    fn instance(&self, name: &str) -> Instance {
        Instance::new(name, Arc::clone(&self.env))
    }

    pub fn create_instance(&self, name: &str, bundle: BundleId) -> JobResult<JobHandle> {
        if !bundle.is_valid() {
            return Err(DeployError::InvalidBundle.into());
        }
        self.submit(
            name,
            InstanceJob::Create {
                bundle: bundle.app,
                version: bundle.version,
            },
        )
    }

    pub fn upgrade_instance(&self, name: &str, version: &str) -> JobResult<JobHandle> {
        if !is_valid_version(version) {
            return Err(DeployError::InvalidBundle.into());
        }
        self.submit(
            name,
            InstanceJob::Upgrade {
                version: version.to_string(),
            },
        )
    }

    pub fn delete_instance(&self, name: &str) -> JobResult<JobHandle> {
        self.submit(name, InstanceJob::Delete)
    }

    pub fn cleanup_instance(&self, name: &str) -> JobResult<JobHandle> {
        self.submit(name, InstanceJob::Cleanup)
    }

    pub fn service_action(&self, name: &str, action: ServiceAction) -> JobResult<JobHandle> {
        self.submit(name, InstanceJob::Service(action))
    }

    /// Read the instance straight from disk, bypassing its job queue.
    pub async fn get_instance(&self, name: &str) -> JobResult<InstanceInfo> {
        Self::validate_name(name)?;
        let instance = self.instance(name);
        match tokio::fs::metadata(instance.root()).await {
            Ok(meta) if meta.is_dir() => instance.info().await,
            _ => Err(JobError::not_found(INSTANCE_TYPE, name)),
        }
    }

    pub async fn list_instances(&self) -> JobResult<Vec<InstanceInfo>> {
        let dir = &self.env.app_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(format!("reading {}", dir.display()), &e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::io(format!("reading {}", dir.display()), &e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                if is_valid_identifier(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut instances = Vec::with_capacity(names.len());
        for name in names {
            instances.push(self.instance(&name).info().await?);
        }
        Ok(instances)
    }

    pub async fn get_service(&self, name: &str) -> JobResult<ServiceDetails> {
        self.env.services.details(name).await
    }

    pub async fn list_services(&self) -> JobResult<Vec<ServiceDetails>> {
        self.env.services.list().await
    }

    pub fn app_dir(&self) -> PathBuf {
        self.env.app_dir.clone()
    }
}

#[async_trait]
impl Manager for InstanceManager {
    fn name(&self) -> &'static str {
        INSTANCE_MANAGER
    }

    async fn init(&self) -> JobResult<()> {
        let dir = &self.env.app_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| JobError::io(format!("creating {}", dir.display()), &e))?;
        self.env.services.init().await?;
        debug!(app_dir = ?dir, "instance manager ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HOOKS_DIR;
    use crate::services::{MockServiceManager, ServiceState};
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AgentConfig,
        services: Arc<MockServiceManager>,
        manager: InstanceManager,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::with_data_root(dir.path());
        let services = Arc::new(MockServiceManager::new());
        let manager = InstanceManager::new(&config, JobRegistry::new(), services.clone());
        manager.init().await.unwrap();
        Fixture {
            _dir: dir,
            config,
            services,
            manager,
        }
    }

    impl Fixture {
        /// Lay out an extracted `fooapp@<version>` bundle.
        fn bundle(&self, version: &str) -> PathBuf {
            let root = self.config.extracted_dir().join(format!("fooapp/fooapp@{version}"));
            fs::create_dir_all(root.join("lib")).unwrap();
            fs::create_dir_all(root.join("conf")).unwrap();
            fs::create_dir_all(root.join("db")).unwrap();
            let manifest = json!({
                "name": "fooapp",
                "description": "Foo application",
                "type": "nodejs",
                "template_files": ["conf/app.conf"],
                "data_files": ["db/", "state.json"],
            });
            fs::write(root.join("cast.json"), manifest.to_string()).unwrap();
            fs::write(root.join("server.js"), format!("// {version}")).unwrap();
            fs::write(root.join("lib/util.js"), "exports.x = 1;").unwrap();
            fs::write(
                root.join("conf/app.conf"),
                "instance={{ instance.name }} version={{ bundle.version }}",
            )
            .unwrap();
            fs::write(root.join("db/seed.db"), "seed").unwrap();
            root
        }

        fn hook(&self, bundle: &Path, hook: &str, body: &str) {
            let dir = bundle.join(HOOKS_DIR);
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(hook);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn root(&self) -> PathBuf {
            self.config.app_dir().join("foo0")
        }

        async fn create(&self) -> JobResult<serde_json::Value> {
            self.manager
                .create_instance("foo0", BundleId::new("fooapp", "1.0"))?
                .wait()
                .await
        }
    }

    #[tokio::test]
    async fn create_lays_out_the_instance() {
        let f = fixture().await;
        let bundle = f.bundle("1.0");

        let result = f.create().await.unwrap();
        let expected = json!({
            "name": "foo0",
            "bundle_name": "fooapp",
            "bundle_version": "1.0",
            "service": {"name": "foo0@1.0", "enabled": false, "status": null},
        });
        assert_eq!(result, expected);
        let info = f.manager.get_instance("foo0").await.unwrap();
        assert_eq!(serde_json::to_value(&info).unwrap(), expected);

        let root = f.root();
        let version = root.join("versions/fooapp@1.0");
        assert_eq!(fs::read_link(root.join("current")).unwrap(), version);
        assert_eq!(fs::read_link(root.join("bundle")).unwrap(), bundle);
        assert_eq!(
            fs::metadata(version.join("server.js")).unwrap().ino(),
            fs::metadata(bundle.join("server.js")).unwrap().ino()
        );
        assert_eq!(
            fs::read_to_string(version.join("conf/app.conf")).unwrap(),
            "instance=foo0 version=1.0"
        );
        assert_eq!(fs::read_link(version.join("db")).unwrap(), root.join("data/db"));
        assert_eq!(fs::read_to_string(root.join("data/db/seed.db")).unwrap(), "seed");
        assert!(fs::symlink_metadata(version.join("state.json")).unwrap().file_type().is_symlink());

        let spec = f.services.spec("foo0@1.0").unwrap();
        assert_eq!(spec.working_dir, version);
        assert_eq!(spec.entry_file, "server.js");
    }

    #[tokio::test]
    async fn second_create_is_an_existence_error() {
        let f = fixture().await;
        f.bundle("1.0");
        f.create().await.unwrap();
        let err = f.create().await.unwrap_err();
        assert_eq!(err.to_string(), "Instance 'foo0' already exists.");
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_queueing() {
        let f = fixture().await;
        let err = f
            .manager
            .create_instance("../etc", BundleId::new("fooapp", "1.0"))
            .unwrap_err();
        assert_eq!(err, JobError::Invalid("Invalid instance name".into()));
        let err = f
            .manager
            .create_instance("foo0", BundleId::new("fooapp", "1.0/.."))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid bundle name or version");
        assert!(f.manager.index.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_bundle_creates_nothing() {
        let f = fixture().await;
        let err = f.create().await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid bundle name or version");
        assert!(fs::symlink_metadata(f.root()).is_err());
    }

    #[tokio::test]
    async fn failed_create_removes_the_root() {
        let f = fixture().await;
        let bundle = f.bundle("1.0");
        f.hook(&bundle, "post_version_activate", "exit 7");

        let err = f.create().await.unwrap_err();
        assert_eq!(err.to_string(), "hook 'post_version_activate' exited with status 7");
        assert_eq!(
            fs::symlink_metadata(f.root()).unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
        assert!(f.manager.list_services().await.unwrap().is_empty());
        assert!(f.manager.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upgrade_swaps_current_and_retires_the_old_service() {
        let f = fixture().await;
        f.bundle("1.0");
        let next = f.bundle("1.5");
        f.create().await.unwrap();
        for action in [ServiceAction::Enable, ServiceAction::Start] {
            f.manager.service_action("foo0", action).unwrap().wait().await.unwrap();
        }
        fs::write(f.root().join("data/db/seed.db"), "written by 1.0").unwrap();

        let result = f.manager.upgrade_instance("foo0", "1.5").unwrap().wait().await.unwrap();
        assert_eq!(result["bundle_version"], "1.5");
        assert_eq!(result["service"]["name"], "foo0@1.5");
        assert_eq!(result["service"]["enabled"], true);
        assert_eq!(result["service"]["status"]["state"], "running");

        let root = f.root();
        assert_eq!(fs::read_link(root.join("current")).unwrap(), root.join("versions/fooapp@1.5"));
        assert_eq!(fs::read_link(root.join("bundle")).unwrap(), next);
        assert!(root.join("versions/fooapp@1.0").is_dir());
        assert_eq!(
            fs::read_to_string(root.join("versions/fooapp@1.5/db/seed.db")).unwrap(),
            "written by 1.0"
        );
        assert!(!f.services.exists("foo0@1.0").await);
        assert!(f.services.is_running("foo0@1.5"));
    }

    #[tokio::test]
    async fn failed_upgrade_keeps_the_old_version_active() {
        let f = fixture().await;
        f.bundle("1.0");
        let next = f.bundle("1.5");
        f.hook(&next, "pre_version_activate", "exit 1");
        f.create().await.unwrap();

        let err = f.manager.upgrade_instance("foo0", "1.5").unwrap().wait().await.unwrap_err();
        assert!(matches!(err, JobError::Hook { .. }));

        let root = f.root();
        assert_eq!(fs::read_link(root.join("current")).unwrap(), root.join("versions/fooapp@1.0"));
        assert!(!root.join("versions/fooapp@1.5").exists());
        assert!(!f.services.exists("foo0@1.5").await);
        assert!(f.services.exists("foo0@1.0").await);
    }

    #[tokio::test]
    async fn failure_after_the_swap_restores_current() {
        let f = fixture().await;
        f.bundle("1.0");
        let next = f.bundle("1.5");
        f.hook(&next, "post_version_activate", "exit 2");
        f.create().await.unwrap();

        f.manager.upgrade_instance("foo0", "1.5").unwrap().wait().await.unwrap_err();
        assert!(fs::read_link(f.root().join("bundle")).unwrap().ends_with("fooapp@1.0"));
        let info = f.manager.get_instance("foo0").await.unwrap();
        assert_eq!(info.bundle_version.as_deref(), Some("1.0"));
        assert_eq!(info.service.name, "foo0@1.0");
    }

    #[tokio::test]
    async fn upgrade_preconditions() {
        let f = fixture().await;
        f.bundle("1.0");
        f.create().await.unwrap();

        let err = f.manager.upgrade_instance("foo0", "9.9").unwrap().wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Bundle fooapp version 9.9 doesn't exist");
        let err = f.manager.upgrade_instance("foo0", "1.0").unwrap().wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Instance 'foo0' already has version '1.0'");
        let err = f.manager.upgrade_instance("bar", "1.0").unwrap().wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Instance 'bar' does not exist.");
    }

    #[tokio::test]
    async fn cleanup_removes_inactive_versions() {
        let f = fixture().await;
        f.bundle("1.0");
        f.bundle("1.5");
        f.create().await.unwrap();
        f.manager.upgrade_instance("foo0", "1.5").unwrap().wait().await.unwrap();

        let handle = f.manager.cleanup_instance("foo0").unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result, json!({"removed": ["fooapp@1.0"]}));
        assert!(!f.root().join("versions/fooapp@1.0").exists());
        assert!(f.root().join("versions/fooapp@1.5").is_dir());
        assert!(handle.messages().contains(&"removed version fooapp@1.0".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_root_and_services() {
        let f = fixture().await;
        f.bundle("1.0");
        f.create().await.unwrap();

        f.manager.delete_instance("foo0").unwrap().wait().await.unwrap();
        assert!(!f.root().exists());
        assert!(f.manager.list_services().await.unwrap().is_empty());
        assert_eq!(
            f.manager.get_instance("foo0").await.unwrap_err(),
            JobError::not_found("Instance", "foo0")
        );

        let err = f.manager.delete_instance("foo0").unwrap().wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Instance 'foo0' does not exist.");
    }

    #[tokio::test]
    async fn delete_reports_a_service_that_will_not_stop() {
        let f = fixture().await;
        f.bundle("1.0");
        f.create().await.unwrap();
        for action in [ServiceAction::Enable, ServiceAction::Start] {
            f.manager.service_action("foo0", action).unwrap().wait().await.unwrap();
        }
        f.services.set_stuck("foo0@1.0");

        let handle = f.manager.delete_instance("foo0").unwrap();
        handle.wait().await.unwrap();
        assert!(
            handle
                .messages()
                .iter()
                .any(|m| m.starts_with("failed to stop service foo0@1.0"))
        );
        assert!(!f.services.exists("foo0@1.0").await);
        assert!(!f.root().exists());
    }

    #[tokio::test]
    async fn jobs_on_one_instance_run_in_order() {
        let f = fixture().await;
        f.bundle("1.0");
        f.bundle("1.5");
        let create = f.manager.create_instance("foo0", BundleId::new("fooapp", "1.0")).unwrap();
        let upgrade = f.manager.upgrade_instance("foo0", "1.5").unwrap();
        let delete = f.manager.delete_instance("foo0").unwrap();

        create.wait().await.unwrap();
        assert_eq!(upgrade.wait().await.unwrap()["bundle_version"], "1.5");
        delete.wait().await.unwrap();
        assert!(create.id() < upgrade.id() && upgrade.id() < delete.id());
    }

    #[tokio::test]
    async fn service_actions_report_details() {
        let f = fixture().await;
        f.bundle("1.0");
        f.create().await.unwrap();

        let err = f
            .manager
            .service_action("foo0", ServiceAction::Start)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Service disabled");

        f.manager.service_action("foo0", ServiceAction::Enable).unwrap().wait().await.unwrap();
        let details = f
            .manager
            .service_action("foo0", ServiceAction::Restart)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(details["status"]["state"], "running");

        let service = f.manager.get_service("foo0@1.0").await.unwrap();
        assert_eq!(service.status.unwrap().state, ServiceState::Running);
    }
}
