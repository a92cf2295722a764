//! Content-addressed bundle storage.
//!
//! A bundle is identified by `app@version` and stored twice: the uploaded
//! tarball at `<bundle_dir>/<app>/<app>@<version>.tar.gz` and its extracted
//! tree at `<extracted_dir>/<app>/<app>@<version>/`. The tarball is the
//! existence marker and is renamed into place last, so a bundle becomes
//! visible only once its checksum and manifest have been verified.
//!
//! Uploads for the same key are mutually exclusive through an in-flight
//! set that is checked and updated synchronously when the upload is
//! submitted, before a job (or even a resource) exists for it.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cast_core::{AgentConfig, BundleId, Manifest};
use cast_jobs::{
    JobContext, JobError, JobHandle, JobOptions, JobRegistry, JobResult, JobSpec, Manager,
    Resource, ResourceIndex,
};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{BundleError, BundleResult};
use crate::extract::extract_tarball;
use crate::tempfiles::{TempFileManager, remove_any};

pub const BUNDLE_MANAGER: &str = "bundles";

const CHUNK_SIZE: usize = 64 * 1024;

/// Byte stream of an uploaded tarball.
pub type BundleStream = Box<dyn AsyncRead + Send + Unpin>;

/// Deferred source of the expected checksum (lowercase hex SHA-1). Only
/// invoked once the upload stream has been fully consumed, since the
/// checksum may arrive after the body (e.g. as an HTTP trailer).
pub type ChecksumSource = Box<dyn FnOnce() -> BoxFuture<'static, JobResult<String>> + Send>;

/// A checksum source for a digest known up front.
pub fn expect_sha1(hex_digest: impl Into<String>) -> ChecksumSource {
    let digest = hex_digest.into();
    Box::new(move || Box::pin(async move { Ok(digest) }))
}

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub bundle_versions: Vec<String>,
}

/// Directory layout shared by every bundle.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    bundle_dir: PathBuf,
    extracted_dir: PathBuf,
}

impl BundleLayout {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            bundle_dir: config.bundle_dir(),
            extracted_dir: config.extracted_dir(),
        }
    }

    pub fn app_bundle_dir(&self, app: &str) -> PathBuf {
        self.bundle_dir.join(app)
    }

    pub fn app_extracted_dir(&self, app: &str) -> PathBuf {
        self.extracted_dir.join(app)
    }

    pub fn tarball_path(&self, id: &BundleId) -> PathBuf {
        self.app_bundle_dir(&id.app).join(id.file_name())
    }

    pub fn extracted_path(&self, id: &BundleId) -> PathBuf {
        self.app_extracted_dir(&id.app).join(id.key())
    }
}

struct StoreShared {
    layout: BundleLayout,
    tempfiles: Arc<TempFileManager>,
    in_flight: Mutex<HashSet<String>>,
}

impl StoreShared {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases an in-flight upload key when the upload job ends, however it
/// ends (including never being run).
struct InFlightGuard {
    shared: Arc<StoreShared>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight().remove(&self.key);
    }
}

/// The bundle resource: one `app@version` key.
pub struct Bundle {
    id: BundleId,
    key: String,
    shared: Arc<StoreShared>,
}

impl Bundle {
    pub fn id(&self) -> &BundleId {
        &self.id
    }

    pub fn tarball_path(&self) -> PathBuf {
        self.shared.layout.tarball_path(&self.id)
    }

    pub fn extracted_path(&self) -> PathBuf {
        self.shared.layout.extracted_path(&self.id)
    }
}

impl Resource for Bundle {
    const TYPE_NAME: &'static str = "Bundle";
    type Job = BundleJob;

    fn name(&self) -> &str {
        &self.key
    }

    async fn exists(&self) -> bool {
        is_file(&self.tarball_path()).await
    }
}

pub enum BundleJob {
    Add {
        stream: BundleStream,
        checksum: Option<ChecksumSource>,
        guard: InFlightGuardToken,
    },
    Remove,
}

/// Opaque holder of the in-flight reservation carried by an add job.
pub struct InFlightGuardToken(InFlightGuard);

impl InFlightGuardToken {
    fn key(&self) -> &str {
        &self.0.key
    }
}

impl JobSpec<Bundle> for BundleJob {
    fn kind(&self) -> &'static str {
        match self {
            BundleJob::Add { .. } => "AddBundle",
            BundleJob::Remove => "RemoveBundle",
        }
    }

    fn options(&self) -> JobOptions {
        match self {
            BundleJob::Add { .. } => JobOptions::CREATE,
            BundleJob::Remove => JobOptions::DELETE,
        }
    }

    fn run(
        self,
        bundle: Arc<Bundle>,
        ctx: JobContext,
    ) -> impl Future<Output = JobResult<Value>> + Send + 'static {
        async move {
            match self {
                BundleJob::Add {
                    stream,
                    checksum,
                    guard,
                } => {
                    debug!(upload = guard.key(), "receiving upload");
                    let result = add_bundle(&bundle, stream, checksum, &ctx).await;
                    drop(guard);
                    let info = result?;
                    Ok(serde_json::to_value(info).map_err(|e| JobError::Internal(e.to_string()))?)
                }
                BundleJob::Remove => {
                    remove_bundle(&bundle).await?;
                    Ok(Value::Null)
                }
            }
        }
    }
}

async fn add_bundle(
    bundle: &Bundle,
    mut stream: BundleStream,
    checksum: Option<ChecksumSource>,
    ctx: &JobContext,
) -> JobResult<BundleInfo> {
    let shared = &bundle.shared;
    let id = &bundle.id;
    let tarball = bundle.tarball_path();
    let extracted = bundle.extracted_path();

    for dir in [
        shared.layout.app_bundle_dir(&id.app),
        shared.layout.app_extracted_dir(&id.app),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BundleError::io(format!("creating {}", dir.display()), e))?;
    }

    let tmp_tarball = shared.tempfiles.allocate(".tar.gz");
    let tmp_extracted = shared.tempfiles.allocate("");

    let (actual, size) = receive(&mut stream, tmp_tarball.path()).await?;
    ctx.message(format!("received {size} bytes"));

    // Only asked once the stream is exhausted.
    if let Some(source) = checksum {
        let expected = source().await?;
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(BundleError::ChecksumMismatch { expected, actual }.into());
        }
        debug!(bundle = %id, sha1 = %actual, "checksum verified");
    }

    let src = tmp_tarball.path().to_path_buf();
    let dst = tmp_extracted.path().to_path_buf();
    tokio::task::spawn_blocking(move || extract_tarball(&src, &dst))
        .await
        .map_err(|e| JobError::Internal(format!("extraction task failed: {e}")))?
        .map_err(BundleError::Extract)?;
    ctx.message("extracted bundle");

    let root = tmp_extracted.path().to_path_buf();
    tokio::task::spawn_blocking(move || Manifest::load(&root))
        .await
        .map_err(|e| JobError::Internal(format!("manifest task failed: {e}")))?
        .map_err(BundleError::Manifest)?;

    // The extracted tree goes first; the tarball is the existence marker.
    tokio::fs::rename(tmp_extracted.path(), &extracted)
        .await
        .map_err(|e| BundleError::io(format!("moving into {}", extracted.display()), e))?;
    if let Err(e) = tokio::fs::rename(tmp_tarball.path(), &tarball).await {
        let _ = remove_any(&extracted).await;
        return Err(BundleError::io(format!("moving into {}", tarball.display()), e).into());
    }

    info!(bundle = %id, size, sha1 = %actual, "bundle added");
    Ok(BundleInfo {
        name: id.app.clone(),
        version: id.version.clone(),
        path: tarball,
        size,
    })
}

/// Copy the stream into `path`, hashing as it goes.
async fn receive(stream: &mut BundleStream, path: &Path) -> BundleResult<(String, u64)> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| BundleError::io(format!("creating {}", path.display()), e))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| BundleError::io("reading upload", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .map_err(|e| BundleError::io(format!("writing {}", path.display()), e))?;
        size += n as u64;
    }
    file.flush()
        .await
        .map_err(|e| BundleError::io(format!("writing {}", path.display()), e))?;

    Ok((hex::encode(hasher.finalize()), size))
}

async fn remove_bundle(bundle: &Bundle) -> BundleResult<()> {
    let tarball = bundle.tarball_path();
    tokio::fs::remove_file(&tarball)
        .await
        .map_err(|e| BundleError::io(format!("removing {}", tarball.display()), e))?;
    let extracted = bundle.extracted_path();
    remove_any(&extracted)
        .await
        .map_err(|e| BundleError::io(format!("removing {}", extracted.display()), e))?;
    info!(bundle = %bundle.id, "bundle removed");
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Resource manager for bundles.
pub struct BundleStore {
    shared: Arc<StoreShared>,
    index: ResourceIndex<Bundle>,
}

impl BundleStore {
    pub fn new(config: &AgentConfig, registry: JobRegistry, tempfiles: Arc<TempFileManager>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                layout: BundleLayout::from_config(config),
                tempfiles,
                in_flight: Mutex::new(HashSet::new()),
            }),
            index: ResourceIndex::new(registry),
        }
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.shared.layout
    }

    fn submit(&self, id: &BundleId, job: BundleJob) -> JobHandle {
        let key = id.key();
        let shared = Arc::clone(&self.shared);
        let build = || Bundle {
            id: id.clone(),
            key: key.clone(),
            shared,
        };
        self.index.submit(&key, build, job)
    }

    fn validate(id: &BundleId) -> BundleResult<()> {
        if id.is_valid() {
            Ok(())
        } else {
            Err(BundleError::InvalidIdentity(id.key()))
        }
    }

    /// Upload a bundle. Fails immediately if an upload for the same key is
    /// already in flight.
    pub fn add_bundle(
        &self,
        id: BundleId,
        stream: BundleStream,
        checksum: Option<ChecksumSource>,
    ) -> JobResult<JobHandle> {
        Self::validate(&id)?;
        let key = id.key();
        {
            let mut in_flight = self.shared.in_flight();
            if !in_flight.insert(key.clone()) {
                return Err(BundleError::UploadInProgress(key).into());
            }
        }
        let guard = InFlightGuardToken(InFlightGuard {
            shared: Arc::clone(&self.shared),
            key,
        });
        Ok(self.submit(
            &id,
            BundleJob::Add {
                stream,
                checksum,
                guard,
            },
        ))
    }

    pub fn remove_bundle(&self, id: BundleId) -> JobResult<JobHandle> {
        Self::validate(&id)?;
        Ok(self.submit(&id, BundleJob::Remove))
    }

    pub fn is_upload_in_progress(&self, id: &BundleId) -> bool {
        self.shared.in_flight().contains(&id.key())
    }

    pub async fn get_bundle(&self, id: &BundleId) -> JobResult<BundleInfo> {
        let path = self.shared.layout.tarball_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(BundleInfo {
                name: id.app.clone(),
                version: id.version.clone(),
                path,
                size: meta.len(),
            }),
            _ => Err(JobError::not_found("Bundle", &id.key())),
        }
    }

    /// Open the stored tarball for reading.
    pub async fn open_bundle(&self, id: &BundleId) -> JobResult<tokio::fs::File> {
        let info = self.get_bundle(id).await?;
        tokio::fs::File::open(&info.path)
            .await
            .map_err(|e| JobError::io(format!("opening {}", info.path.display()), &e))
    }

    pub async fn get_application(&self, app: &str) -> JobResult<ApplicationInfo> {
        let dir = self.shared.layout.app_bundle_dir(app);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::not_found("Application", app));
            }
            Err(e) => return Err(JobError::io(format!("reading {}", dir.display()), &e)),
        };

        let prefix = format!("{app}@");
        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::io(format!("reading {}", dir.display()), &e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(version) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".tar.gz"))
            {
                versions.push(version.to_string());
            }
        }
        versions.sort();

        Ok(ApplicationInfo {
            name: app.to_string(),
            bundle_versions: versions,
        })
    }

    /// All applications with at least a bundle directory, sorted by name.
    pub async fn list_applications(&self) -> JobResult<Vec<ApplicationInfo>> {
        let root = &self.shared.layout.bundle_dir;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(format!("reading {}", root.display()), &e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::io(format!("reading {}", root.display()), &e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut apps = Vec::with_capacity(names.len());
        for name in names {
            apps.push(self.get_application(&name).await?);
        }
        Ok(apps)
    }
}

#[async_trait]
impl Manager for BundleStore {
    fn name(&self) -> &'static str {
        BUNDLE_MANAGER
    }

    async fn init(&self) -> JobResult<()> {
        let layout = &self.shared.layout;
        for dir in [&layout.bundle_dir, &layout.extracted_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| JobError::io(format!("creating {}", dir.display()), &e))?;
        }
        debug!(bundle_dir = ?layout.bundle_dir, extracted_dir = ?layout.extracted_dir, "bundle store ready");
        Ok(())
    }
}
