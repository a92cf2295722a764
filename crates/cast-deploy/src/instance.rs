//! The instance resource and its deployment jobs.
//!
//! Layout of an instance root:
//!
//! ```text
//! <app_dir>/<instance>/
//!     bundle   -> <extracted_dir>/<bundle>/<bundle>@<version>
//!     current  -> versions/<bundle>@<version>   (absolute)
//!     data/
//!     versions/<bundle>@<version>/
//! ```
//!
//! `current` only ever moves by renaming a complete symlink over it, and
//! only once the target version is fully materialized and its service is
//! registered.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cast_core::{BundleId, HostFacts, Manifest, is_valid_identifier, is_valid_version};
use cast_jobs::{JobContext, JobError, JobOptions, JobResult, JobSpec, Resource};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::DeployError;
use crate::files::{
    hard_link_files, link_target, link_target_name, mirror_directories, resolve_data_files,
    swap_symlink,
};
use crate::hooks::{HookRunner, HookTarget, POST_PREPARE, POST_VERSION_ACTIVATE, PRE_VERSION_ACTIVATE};
use crate::rollback::{Rollback, Undo};
use crate::services::{ServiceAction, ServiceDetails, ServiceManager, ServiceSpec, ServiceState, service_name};
use crate::templates::{TemplateRenderer, TemplateTarget, build_context, realize_templates};

pub const INSTANCE_TYPE: &str = "Instance";

/// Collaborators shared by every instance.
pub(crate) struct DeployEnv {
    pub app_dir: PathBuf,
    pub extracted_dir: PathBuf,
    pub services: Arc<dyn ServiceManager>,
    pub hooks: HookRunner,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub facts: HostFacts,
}

impl DeployEnv {
    fn bundle_path(&self, id: &BundleId) -> PathBuf {
        self.extracted_dir.join(&id.app).join(id.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub bundle_name: Option<String>,
    pub bundle_version: Option<String>,
    pub service: ServiceDetails,
}

pub struct Instance {
    name: String,
    root: PathBuf,
    env: Arc<DeployEnv>,
}

impl Instance {
    pub(crate) fn new(name: &str, env: Arc<DeployEnv>) -> Self {
        Self {
            name: name.to_string(),
            root: env.app_dir.join(name),
            env,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    fn bundle_link(&self) -> PathBuf {
        self.root.join("bundle")
    }

    fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    fn version_path(&self, id: &BundleId) -> PathBuf {
        self.versions_dir().join(id.key())
    }

    /// Name of the bundle this instance was created from.
    pub fn bundle_name(&self) -> Option<String> {
        let bundle = link_target_name(&self.bundle_link())?;
        bundle.split_once('@').map(|(name, _)| name.to_string())
    }

    /// Version `current` points at.
    pub fn bundle_version(&self) -> Option<String> {
        let active = link_target_name(&self.current_link())?;
        active.split_once('@').map(|(_, version)| version.to_string())
    }

    fn active_service(&self) -> Result<String, DeployError> {
        self.bundle_version()
            .map(|version| service_name(&self.name, &version))
            .ok_or_else(|| DeployError::NoActiveVersion(self.name.clone()))
    }

    pub async fn info(&self) -> JobResult<InstanceInfo> {
        let bundle_version = self.bundle_version();
        let service = match &bundle_version {
            Some(version) => {
                let name = service_name(&self.name, version);
                if self.env.services.exists(&name).await {
                    self.env.services.details(&name).await?
                } else {
                    ServiceDetails::absent(name)
                }
            }
            None => ServiceDetails::absent(String::new()),
        };
        Ok(InstanceInfo {
            name: self.name.clone(),
            bundle_name: self.bundle_name(),
            bundle_version,
            service,
        })
    }

    async fn info_value(&self) -> JobResult<Value> {
        serde_json::to_value(self.info().await?).map_err(|e| JobError::Internal(e.to_string()))
    }
}

impl Resource for Instance {
    const TYPE_NAME: &'static str = INSTANCE_TYPE;
    type Job = InstanceJob;

    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> bool {
        is_dir(&self.root).await
    }
}

pub enum InstanceJob {
    Create { bundle: String, version: String },
    Upgrade { version: String },
    Delete,
    Cleanup,
    Service(ServiceAction),
}

impl JobSpec<Instance> for InstanceJob {
    fn kind(&self) -> &'static str {
        match self {
            InstanceJob::Create { .. } => "CreateInstance",
            InstanceJob::Upgrade { .. } => "UpgradeInstance",
            InstanceJob::Delete => "DeleteInstance",
            InstanceJob::Cleanup => "CleanupInstance",
            InstanceJob::Service(_) => "ControlService",
        }
    }

    fn options(&self) -> JobOptions {
        match self {
            InstanceJob::Create { .. } => JobOptions::CREATE,
            InstanceJob::Delete => JobOptions::DELETE,
            InstanceJob::Upgrade { .. } | InstanceJob::Cleanup | InstanceJob::Service(_) => {
                JobOptions::UPDATE
            }
        }
    }

    fn run(
        self,
        instance: Arc<Instance>,
        ctx: JobContext,
    ) -> impl Future<Output = JobResult<Value>> + Send + 'static {
        async move {
            match self {
                InstanceJob::Create { bundle, version } => {
                    create(&instance, BundleId::new(bundle, version), &ctx).await
                }
                InstanceJob::Upgrade { version } => upgrade(&instance, &version, &ctx).await,
                InstanceJob::Delete => delete(&instance, &ctx).await,
                InstanceJob::Cleanup => cleanup(&instance, &ctx).await,
                InstanceJob::Service(action) => control(&instance, action).await,
            }
        }
    }
}

async fn create(instance: &Instance, id: BundleId, ctx: &JobContext) -> JobResult<Value> {
    if !is_valid_identifier(&instance.name) {
        return Err(DeployError::InvalidInstanceName.into());
    }
    if !id.is_valid() {
        return Err(DeployError::InvalidBundle.into());
    }
    let bundle_path = instance.env.bundle_path(&id);
    if !is_dir(&bundle_path).await {
        return Err(DeployError::InvalidBundle.into());
    }
    if tokio::fs::symlink_metadata(&instance.root).await.is_ok() {
        return Err(DeployError::NameInUse.into());
    }
    let manifest = load_manifest(&bundle_path).await?;

    let mut rollback = Rollback::new();
    match build_instance(instance, &id, &bundle_path, &manifest, ctx, &mut rollback).await {
        Ok(()) => rollback.commit(),
        Err(e) => return Err(rollback.unwind(instance.env.services.as_ref(), e).await),
    }

    info!(instance = %instance.name, bundle = %id, "instance created");
    instance.info_value().await
}

async fn build_instance(
    instance: &Instance,
    id: &BundleId,
    bundle_path: &Path,
    manifest: &Manifest,
    ctx: &JobContext,
    rollback: &mut Rollback,
) -> JobResult<()> {
    tokio::fs::create_dir(&instance.root)
        .await
        .map_err(|e| DeployError::at("creating", &instance.root, e))?;
    rollback.push(Undo::RemoveDir(instance.root.clone()));

    let version_path = instance.version_path(id);
    for dir in [instance.data_dir(), version_path.clone()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DeployError::at("creating", &dir, e))?;
    }
    let bundle_link = instance.bundle_link();
    tokio::fs::symlink(bundle_path, &bundle_link)
        .await
        .map_err(|e| DeployError::at("linking", &bundle_link, e))?;
    ctx.message("created instance directories");

    let service = stage_version(instance, id, bundle_path, &version_path, manifest, ctx, rollback).await?;
    activate(instance, id, &version_path, ctx, rollback).await?;
    debug!(instance = %instance.name, %service, "first version active");
    Ok(())
}

async fn upgrade(instance: &Instance, version: &str, ctx: &JobContext) -> JobResult<Value> {
    if !is_valid_version(version) {
        return Err(DeployError::InvalidBundle.into());
    }
    let bundle = instance
        .bundle_name()
        .ok_or_else(|| DeployError::NoActiveVersion(instance.name.clone()))?;
    let id = BundleId::new(bundle, version);
    let bundle_path = instance.env.bundle_path(&id);
    if !is_dir(&bundle_path).await {
        return Err(DeployError::MissingBundleVersion {
            bundle: id.app,
            version: id.version,
        }
        .into());
    }
    let version_path = instance.version_path(&id);
    if tokio::fs::symlink_metadata(&version_path).await.is_ok() {
        return Err(DeployError::VersionExists {
            instance: instance.name.clone(),
            version: id.version,
        }
        .into());
    }

    let services = instance.env.services.as_ref();
    let old_service = instance.bundle_version().map(|v| service_name(&instance.name, &v));
    let old_details = match &old_service {
        Some(name) if services.exists(name).await => Some(services.details(name).await?),
        _ => None,
    };
    let was_enabled = old_details.as_ref().is_some_and(|d| d.enabled);
    let was_running = old_details
        .as_ref()
        .and_then(|d| d.status.as_ref())
        .is_some_and(|s| s.state == ServiceState::Running);

    let manifest = load_manifest(&bundle_path).await?;

    let mut rollback = Rollback::new();
    let staged = stage_upgrade(
        instance,
        &id,
        &bundle_path,
        &version_path,
        &manifest,
        was_enabled,
        ctx,
        &mut rollback,
    )
    .await;
    let new_service = match staged {
        Ok(name) => {
            rollback.commit();
            name
        }
        Err(e) => return Err(rollback.unwind(services, e).await),
    };

    // The new version is live; the old one is retired best-effort.
    if let Some(old) = &old_service {
        if let Err(e) = retire_service(services, old, ctx).await {
            warn!(instance = %instance.name, service = %old, error = %e, "failed to remove old service");
            ctx.message(format!("failed to remove service {old}: {e}"));
        }
    }
    if was_running {
        if let Err(e) = services.start(&new_service).await {
            warn!(instance = %instance.name, service = %new_service, error = %e, "failed to start service");
            ctx.message(format!("failed to start service {new_service}: {e}"));
        }
    }

    info!(instance = %instance.name, bundle = %id, "instance upgraded");
    instance.info_value().await
}

#[allow(clippy::too_many_arguments)]
async fn stage_upgrade(
    instance: &Instance,
    id: &BundleId,
    bundle_path: &Path,
    version_path: &Path,
    manifest: &Manifest,
    enable: bool,
    ctx: &JobContext,
    rollback: &mut Rollback,
) -> JobResult<String> {
    tokio::fs::create_dir(version_path)
        .await
        .map_err(|e| DeployError::at("creating", version_path, e))?;
    rollback.push(Undo::RemoveDir(version_path.to_path_buf()));

    let service = stage_version(instance, id, bundle_path, version_path, manifest, ctx, rollback).await?;
    if enable {
        instance.env.services.enable(&service).await?;
    }
    relink(instance.bundle_link(), bundle_path, rollback).await?;
    activate(instance, id, version_path, ctx, rollback).await?;
    Ok(service)
}

/// Materialize `version_path` from the bundle and register its service.
/// Returns the service name.
async fn stage_version(
    instance: &Instance,
    id: &BundleId,
    bundle_path: &Path,
    version_path: &Path,
    manifest: &Manifest,
    ctx: &JobContext,
    rollback: &mut Rollback,
) -> JobResult<String> {
    let env = &instance.env;
    let data_path = instance.data_dir();
    let target = TemplateTarget {
        instance: &instance.name,
        bundle: &id.app,
        version: &id.version,
        version_path,
        data_path: &data_path,
    };
    let context = build_context(&target, manifest, &env.facts);

    let linked = {
        let bundle_path = bundle_path.to_path_buf();
        let version_path = version_path.to_path_buf();
        let manifest = manifest.clone();
        let renderer = Arc::clone(&env.renderer);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, DeployError> {
            let excluded = manifest.excluded_paths();
            mirror_directories(&bundle_path, &version_path, &excluded)?;
            realize_templates(
                renderer.as_ref(),
                &bundle_path,
                &version_path,
                &manifest.template_files,
                &context,
            )?;
            let linked = hard_link_files(&bundle_path, &version_path, &excluded, &mut |file: &str| {
                ctx.message(format!("linked {file}"));
            })?;
            resolve_data_files(&bundle_path, &data_path, &version_path, &manifest.data_files)?;
            Ok(linked)
        })
        .await
        .map_err(|e| JobError::Internal(format!("prepare task failed: {e}")))??
    };
    ctx.message(format!("prepared version {} ({linked} files linked)", id.key()));

    let hook_target = HookTarget {
        instance: &instance.name,
        version: &id.version,
        version_path,
    };
    env.hooks.run(POST_PREPARE, &hook_target, ctx).await?;

    let spec = ServiceSpec {
        name: service_name(&instance.name, &id.version),
        instance: instance.name.clone(),
        working_dir: version_path.to_path_buf(),
        app_type: manifest.app_type,
        entry_file: manifest.entry_file.clone(),
    };
    env.services.create(&spec).await?;
    rollback.push(Undo::DestroyService(spec.name.clone()));
    ctx.message(format!("registered service {}", spec.name));
    Ok(spec.name)
}

/// Point `current` at `version_path`, between the activation hooks.
async fn activate(
    instance: &Instance,
    id: &BundleId,
    version_path: &Path,
    ctx: &JobContext,
    rollback: &mut Rollback,
) -> JobResult<()> {
    let hooks = &instance.env.hooks;
    let hook_target = HookTarget {
        instance: &instance.name,
        version: &id.version,
        version_path,
    };
    hooks.run(PRE_VERSION_ACTIVATE, &hook_target, ctx).await?;

    relink(instance.current_link(), version_path, rollback).await?;
    ctx.message(format!("activated version {}", id.key()));

    hooks.run(POST_VERSION_ACTIVATE, &hook_target, ctx).await?;
    Ok(())
}

/// Atomically repoint `link` at `target`, restoring the old target on unwind.
async fn relink(link: PathBuf, target: &Path, rollback: &mut Rollback) -> JobResult<()> {
    let previous = link_target(&link);
    {
        let (new_link, new_target) = (link.clone(), target.to_path_buf());
        tokio::task::spawn_blocking(move || swap_symlink(&new_link, &new_target))
            .await
            .map_err(|e| JobError::Internal(format!("relink task failed: {e}")))?
            .map_err(|e| DeployError::at("linking", &link, e))?;
    }
    if let Some(previous) = previous {
        rollback.push(Undo::RestoreLink { link, previous });
    }
    Ok(())
}

async fn retire_service(services: &dyn ServiceManager, name: &str, ctx: &JobContext) -> JobResult<()> {
    if !services.exists(name).await {
        return Ok(());
    }
    let details = services.details(name).await?;
    if details.enabled {
        // runsv may already be gone; destroy unlinks it either way.
        if let Err(e) = services.stop(name).await {
            warn!(service = %name, error = %e, "failed to stop service before removal");
            ctx.message(format!("failed to stop service {name}: {e}"));
        }
    }
    services.destroy(name).await
}

async fn delete(instance: &Instance, ctx: &JobContext) -> JobResult<Value> {
    let services = instance.env.services.as_ref();
    let prefix = format!("{}@", instance.name);
    for details in services.list().await? {
        if details.name.starts_with(&prefix) {
            retire_service(services, &details.name, ctx).await?;
            ctx.message(format!("removed service {}", details.name));
        }
    }
    tokio::fs::remove_dir_all(&instance.root)
        .await
        .map_err(|e| DeployError::at("removing", &instance.root, e))?;
    info!(instance = %instance.name, "instance deleted");
    Ok(Value::Null)
}

/// Remove every version directory other than the active one.
async fn cleanup(instance: &Instance, ctx: &JobContext) -> JobResult<Value> {
    let active = link_target_name(&instance.current_link())
        .ok_or_else(|| DeployError::NoActiveVersion(instance.name.clone()))?;
    let versions = instance.versions_dir();
    let mut entries = tokio::fs::read_dir(&versions)
        .await
        .map_err(|e| DeployError::at("reading", &versions, e))?;

    let mut stale = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DeployError::at("reading", &versions, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != active {
            stale.push(name);
        }
    }
    stale.sort();

    let services = instance.env.services.as_ref();
    for name in &stale {
        if let Some((_, version)) = name.split_once('@') {
            retire_service(services, &service_name(&instance.name, version), ctx).await?;
        }
        let path = versions.join(name);
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| DeployError::at("removing", &path, e))?;
        ctx.message(format!("removed version {name}"));
    }
    info!(instance = %instance.name, removed = stale.len(), "instance cleaned up");
    Ok(json!({ "removed": stale }))
}

async fn control(instance: &Instance, action: ServiceAction) -> JobResult<Value> {
    let service = instance.active_service()?;
    let services = instance.env.services.as_ref();
    services.apply(&service, action).await?;
    info!(instance = %instance.name, %service, %action, "service action applied");
    serde_json::to_value(services.details(&service).await?)
        .map_err(|e| JobError::Internal(e.to_string()))
}

async fn load_manifest(bundle_path: &Path) -> JobResult<Manifest> {
    let root = bundle_path.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || Manifest::load(&root))
        .await
        .map_err(|e| JobError::Internal(format!("manifest task failed: {e}")))?
        .map_err(DeployError::from)?;
    Ok(manifest)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
