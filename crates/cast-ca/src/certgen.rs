//! Key, request and certificate generation.
//!
//! [`OpensslCertGenerator`] drives the `openssl` command line tool. Other
//! implementations (an in-process library, a test double) plug in through
//! [`CertGenerator`].

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use cast_core::config::CertgenConfig;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{CaError, CaResult};

/// Serial number the CA starts counting from.
pub const INITIAL_SERIAL: &str = "01\n";

#[async_trait]
pub trait CertGenerator: Send + Sync + 'static {
    /// Write a new private key to `key`.
    async fn gen_key(&self, key: &Path) -> CaResult<()>;

    /// PEM text of a request for `hostname`, signed with `key`.
    async fn gen_csr(&self, hostname: &str, key: &Path) -> CaResult<String>;

    /// Write a new key and a self-signed certificate for `hostname`.
    async fn gen_self_signed(&self, hostname: &str, key: &Path, cert: &Path) -> CaResult<()>;

    /// Check that `csr` is a well-formed, self-consistent request.
    async fn verify_csr(&self, csr: &Path) -> CaResult<()>;

    /// Sign `csr` with the CA, writing the certificate to `out`.
    async fn sign_csr(&self, csr: &Path, ca: &CaFiles<'_>, out: &Path) -> CaResult<()>;

    /// Start a serial number file.
    async fn init_serial(&self, serial: &Path) -> CaResult<()> {
        tokio::fs::write(serial, INITIAL_SERIAL)
            .await
            .map_err(|e| CaError::io(format!("writing {}", serial.display()), e))
    }
}

/// The CA's own key material.
#[derive(Debug, Clone, Copy)]
pub struct CaFiles<'a> {
    pub key: &'a Path,
    pub cert: &'a Path,
    pub serial: &'a Path,
}

#[derive(Debug, Clone)]
pub struct OpensslCertGenerator {
    config: CertgenConfig,
}

impl OpensslCertGenerator {
    pub fn new(config: CertgenConfig) -> Self {
        Self { config }
    }

    fn self_signed_args(&self, hostname: &str, key: &Path, cert: &Path) -> Vec<String> {
        vec![
            "req".into(),
            "-batch".into(),
            "-x509".into(),
            "-nodes".into(),
            "-days".into(),
            self.config.days.to_string(),
            "-subj".into(),
            format!("/CN={hostname}"),
            "-sha256".into(),
            "-newkey".into(),
            format!("rsa:{}", self.config.key_size),
            "-keyout".into(),
            key.display().to_string(),
            "-out".into(),
            cert.display().to_string(),
        ]
    }

    fn sign_args(&self, csr: &Path, ca: &CaFiles<'_>, out: &Path) -> Vec<String> {
        vec![
            "x509".into(),
            "-req".into(),
            "-sha256".into(),
            "-days".into(),
            self.config.days.to_string(),
            "-in".into(),
            csr.display().to_string(),
            "-CA".into(),
            ca.cert.display().to_string(),
            "-CAkey".into(),
            ca.key.display().to_string(),
            "-CAserial".into(),
            ca.serial.display().to_string(),
            "-out".into(),
            out.display().to_string(),
        ]
    }

    /// Run openssl with `args`, returning its stdout.
    async fn openssl(&self, args: &[String]) -> CaResult<String> {
        let program = &self.config.openssl_binary;
        debug!(program, ?args, "running openssl");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CaError::io(format!("spawning {program}"), e))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(program, ?args, status = ?output.status, stderr = %stderr, "openssl command failed");
        Err(CaError::Command {
            program: format!("{program} {}", args.first().map(String::as_str).unwrap_or("")),
            message: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        })
    }
}

#[async_trait]
impl CertGenerator for OpensslCertGenerator {
    async fn gen_key(&self, key: &Path) -> CaResult<()> {
        self.openssl(&[
            "genrsa".into(),
            "-out".into(),
            key.display().to_string(),
            self.config.key_size.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn gen_csr(&self, hostname: &str, key: &Path) -> CaResult<String> {
        self.openssl(&[
            "req".into(),
            "-batch".into(),
            "-new".into(),
            "-nodes".into(),
            "-subj".into(),
            format!("/CN={hostname}"),
            "-key".into(),
            key.display().to_string(),
        ])
        .await
    }

    async fn gen_self_signed(&self, hostname: &str, key: &Path, cert: &Path) -> CaResult<()> {
        self.openssl(&self.self_signed_args(hostname, key, cert))
            .await
            .map(|_| ())
    }

    async fn verify_csr(&self, csr: &Path) -> CaResult<()> {
        let args = [
            "req".to_string(),
            "-noout".into(),
            "-verify".into(),
            "-in".into(),
            csr.display().to_string(),
        ];
        match self.openssl(&args).await {
            Err(CaError::Command { message, .. }) => Err(CaError::InvalidRequest(message)),
            other => other.map(|_| ()),
        }
    }

    async fn sign_csr(&self, csr: &Path, ca: &CaFiles<'_>, out: &Path) -> CaResult<()> {
        self.openssl(&self.sign_args(csr, ca, out)).await.map(|_| ())
    }
}
