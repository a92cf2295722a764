//! The certificate authority.
//!
//! Requests are indexed by name (usually a hostname) and stored under
//! `<ca_dir>/out/` as `<name>.csr`; signing adds `<name>.crt` beside it.
//! The CA's own key, certificate and serial counter live in `<ca_dir>`.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cast_core::{AgentConfig, HostFacts};
use cast_jobs::{
    JobContext, JobError, JobHandle, JobOptions, JobRegistry, JobResult, JobSpec, Manager,
    Resource, ResourceIndex,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::certgen::{CaFiles, CertGenerator};
use crate::error::CaError;

pub const CA_MANAGER: &str = "ca";
pub const REQUEST_TYPE: &str = "SigningRequest";

/// Request names double as file names.
pub fn is_valid_request_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[derive(Debug, Clone)]
pub struct CaLayout {
    pub root: PathBuf,
    pub out: PathBuf,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub serial: PathBuf,
}

impl CaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            out: root.join("out"),
            key: root.join("ca.key"),
            cert: root.join("ca.crt"),
            serial: root.join("serial"),
            root,
        }
    }

    pub fn csr_path(&self, name: &str) -> PathBuf {
        self.out.join(format!("{name}.csr"))
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.out.join(format!("{name}.crt"))
    }

    fn files(&self) -> CaFiles<'_> {
        CaFiles {
            key: &self.key,
            cert: &self.cert,
            serial: &self.serial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub name: String,
    pub signed: bool,
}

struct CaShared {
    layout: CaLayout,
    generator: Arc<dyn CertGenerator>,
}

pub struct SigningRequest {
    name: String,
    shared: Arc<CaShared>,
}

impl SigningRequest {
    fn csr_path(&self) -> PathBuf {
        self.shared.layout.csr_path(&self.name)
    }

    fn cert_path(&self) -> PathBuf {
        self.shared.layout.cert_path(&self.name)
    }

    fn info(&self, signed: bool) -> JobResult<Value> {
        serde_json::to_value(RequestInfo {
            name: self.name.clone(),
            signed,
        })
        .map_err(|e| JobError::Internal(e.to_string()))
    }
}

impl Resource for SigningRequest {
    const TYPE_NAME: &'static str = REQUEST_TYPE;
    type Job = RequestJob;

    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> bool {
        is_file(&self.csr_path()).await
    }
}

pub enum RequestJob {
    Create { csr: String },
    Sign { overwrite: bool },
    Delete,
}

impl JobSpec<SigningRequest> for RequestJob {
    fn kind(&self) -> &'static str {
        match self {
            RequestJob::Create { .. } => "CreateRequest",
            RequestJob::Sign { .. } => "SignRequest",
            RequestJob::Delete => "DeleteRequest",
        }
    }

    fn options(&self) -> JobOptions {
        match self {
            RequestJob::Create { .. } => JobOptions::CREATE,
            RequestJob::Sign { .. } => JobOptions::UPDATE,
            RequestJob::Delete => JobOptions::DELETE,
        }
    }

    fn run(
        self,
        request: Arc<SigningRequest>,
        ctx: JobContext,
    ) -> impl Future<Output = JobResult<Value>> + Send + 'static {
        async move {
            match self {
                RequestJob::Create { csr } => create_request(&request, &csr, &ctx).await,
                RequestJob::Sign { overwrite } => sign_request(&request, overwrite, &ctx).await,
                RequestJob::Delete => delete_request(&request).await,
            }
        }
    }
}

async fn create_request(request: &SigningRequest, csr: &str, ctx: &JobContext) -> JobResult<Value> {
    let path = request.csr_path();
    tokio::fs::write(&path, csr)
        .await
        .map_err(|e| CaError::io(format!("writing {}", path.display()), e))?;

    // An unverifiable request is not kept.
    if let Err(e) = request.shared.generator.verify_csr(&path).await {
        if let Err(rm) = tokio::fs::remove_file(&path).await {
            warn!(path = ?path, error = %rm, "unable to remove invalid request");
        }
        return Err(e.into());
    }
    ctx.message("request verified");
    info!(request = %request.name, "signing request stored");
    request.info(false)
}

async fn sign_request(request: &SigningRequest, overwrite: bool, ctx: &JobContext) -> JobResult<Value> {
    let cert = request.cert_path();
    if !overwrite && is_file(&cert).await {
        return Err(JobError::already_exists("Certificate", &request.name));
    }

    // Signed beside the final path, then moved over it.
    let pending = cert.with_extension("crt.pending");
    let layout = &request.shared.layout;
    let signed = request
        .shared
        .generator
        .sign_csr(&request.csr_path(), &layout.files(), &pending)
        .await;
    if let Err(e) = signed {
        let _ = tokio::fs::remove_file(&pending).await;
        return Err(e.into());
    }
    tokio::fs::rename(&pending, &cert)
        .await
        .map_err(|e| CaError::io(format!("moving into {}", cert.display()), e))?;
    ctx.message("request signed");
    info!(request = %request.name, overwrite, "certificate issued");
    request.info(true)
}

async fn delete_request(request: &SigningRequest) -> JobResult<Value> {
    for path in [request.cert_path(), request.csr_path()] {
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(CaError::io(format!("removing {}", path.display()), e).into());
            }
            _ => {}
        }
    }
    info!(request = %request.name, "signing request deleted");
    Ok(Value::Null)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Resource manager for signing requests.
pub struct CaManager {
    shared: Arc<CaShared>,
    index: ResourceIndex<SigningRequest>,
    hostname: String,
}

impl CaManager {
    pub fn new(config: &AgentConfig, registry: JobRegistry, generator: Arc<dyn CertGenerator>) -> Self {
        Self {
            shared: Arc::new(CaShared {
                layout: CaLayout::new(config.ca_dir()),
                generator,
            }),
            index: ResourceIndex::new(registry),
            hostname: HostFacts::gather().hostname,
        }
    }

    pub fn layout(&self) -> &CaLayout {
        &self.shared.layout
    }

    fn validate(name: &str) -> JobResult<()> {
        if is_valid_request_name(name) {
            Ok(())
        } else {
            Err(CaError::InvalidName(name.to_string()).into())
        }
    }

    fn submit(&self, name: &str, job: RequestJob) -> JobResult<JobHandle> {
        Self::validate(name)?;
        let shared = Arc::clone(&self.shared);
        let build = || SigningRequest {
            name: name.to_string(),
            shared,
        };
        Ok(self.index.submit(name, build, job))
    }

    pub fn create_request(&self, name: &str, csr: impl Into<String>) -> JobResult<JobHandle> {
        self.submit(name, RequestJob::Create { csr: csr.into() })
    }

    pub fn sign_request(&self, name: &str, overwrite: bool) -> JobResult<JobHandle> {
        self.submit(name, RequestJob::Sign { overwrite })
    }

    pub fn delete_request(&self, name: &str) -> JobResult<JobHandle> {
        self.submit(name, RequestJob::Delete)
    }

    pub async fn get_request(&self, name: &str) -> JobResult<RequestInfo> {
        Self::validate(name)?;
        let layout = &self.shared.layout;
        if !is_file(&layout.csr_path(name)).await {
            return Err(JobError::not_found(REQUEST_TYPE, name));
        }
        Ok(RequestInfo {
            name: name.to_string(),
            signed: is_file(&layout.cert_path(name)).await,
        })
    }

    /// All requests, sorted by name.
    pub async fn list_requests(&self) -> JobResult<Vec<RequestInfo>> {
        let out = &self.shared.layout.out;
        let mut entries = match tokio::fs::read_dir(out).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(format!("reading {}", out.display()), &e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::io(format!("reading {}", out.display()), &e))?
        {
            let file_name = entry.file_name();
            match file_name.to_str().and_then(|n| n.strip_suffix(".csr")) {
                Some(name) if is_valid_request_name(name) => names.push(name.to_string()),
                Some(name) => debug!(name, "ignoring stray request file"),
                None => {}
            }
        }
        names.sort();

        let mut requests = Vec::with_capacity(names.len());
        for name in names {
            requests.push(self.get_request(&name).await?);
        }
        Ok(requests)
    }

    /// PEM text of the certificate issued for `name`.
    pub async fn get_certificate(&self, name: &str) -> JobResult<String> {
        Self::validate(name)?;
        let path = self.shared.layout.cert_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(pem) => Ok(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(JobError::not_found("Certificate", name))
            }
            Err(e) => Err(JobError::io(format!("reading {}", path.display()), &e)),
        }
    }

    /// PEM text of the CA certificate.
    pub async fn ca_certificate(&self) -> JobResult<String> {
        let path = &self.shared.layout.cert;
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| JobError::io(format!("reading {}", path.display()), &e))
    }
}

#[async_trait]
impl Manager for CaManager {
    fn name(&self) -> &'static str {
        CA_MANAGER
    }

    async fn init(&self) -> JobResult<()> {
        let layout = &self.shared.layout;
        let generator = &self.shared.generator;

        if tokio::fs::metadata(&layout.root).await.is_err() {
            tokio::fs::create_dir_all(&layout.root)
                .await
                .map_err(|e| CaError::io(format!("creating {}", layout.root.display()), e))?;
            tokio::fs::set_permissions(&layout.root, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| CaError::io(format!("chmod {}", layout.root.display()), e))?;
        }
        tokio::fs::create_dir_all(&layout.out)
            .await
            .map_err(|e| CaError::io(format!("creating {}", layout.out.display()), e))?;

        if !is_file(&layout.cert).await {
            generator
                .gen_self_signed(&self.hostname, &layout.key, &layout.cert)
                .await?;
            info!(hostname = %self.hostname, cert = ?layout.cert, "generated CA certificate");
        }
        if !is_file(&layout.serial).await {
            generator.init_serial(&layout.serial).await?;
        }
        debug!(root = ?layout.root, "certificate authority ready");
        Ok(())
    }
}
