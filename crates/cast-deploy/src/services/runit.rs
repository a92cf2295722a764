//! runit service directories.
//!
//! A service lives at `<available>/<name>/` with `run`, `finish`, `down`
//! and a `log/` logger service. Enabling links it into `<enabled>/`, where
//! runsvdir picks it up. The `down` file keeps a freshly enabled service
//! from starting until it is explicitly started.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cast_core::AppType;
use cast_core::config::RunitConfig;
use cast_jobs::{JobError, JobResult};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{SERVICE_TYPE, ServiceDetails, ServiceManager, ServiceSpec, ServiceState, ServiceStatus};

/// TAI64 label of the Unix epoch.
const TAI64_EPOCH: u64 = 4_611_686_018_427_387_914;

const STATUS_RECORD_LEN: usize = 20;

const DOWN_FILE: &str = "# Keeps the service from starting when it is enabled\n";

pub struct RunitServiceManager {
    available: PathBuf,
    enabled: PathBuf,
    config: RunitConfig,
    node_binary: String,
}

impl RunitServiceManager {
    pub fn new(
        available: impl Into<PathBuf>,
        enabled: impl Into<PathBuf>,
        config: RunitConfig,
        node_binary: impl Into<String>,
    ) -> Self {
        Self {
            available: available.into(),
            enabled: enabled.into(),
            config,
            node_binary: node_binary.into(),
        }
    }

    fn service_dir(&self, name: &str) -> PathBuf {
        self.available.join(name)
    }

    fn enabled_link(&self, name: &str) -> PathBuf {
        self.enabled.join(name)
    }

    fn chpst(&self) -> String {
        match &self.config.service_user {
            Some(user) => format!("chpst -u{user} "),
            None => String::new(),
        }
    }

    fn run_script(&self, spec: &ServiceSpec) -> String {
        let dir = spec.working_dir.to_string_lossy();
        let entry = spec.working_dir.join(&spec.entry_file);
        let entry = entry.to_string_lossy();
        let program = match spec.app_type {
            AppType::Nodejs => format!("{} {}", quote(&self.node_binary), quote(&entry)),
            AppType::Shell => format!("/bin/sh {}", quote(&entry)),
        };
        format!(
            "#!/bin/sh\ncd {}\nexec {}{program}\n",
            quote(&dir),
            self.chpst()
        )
    }

    fn finish_script(spec: &ServiceSpec) -> String {
        format!(
            "#!/bin/sh\necho {}\nsleep 1\nexit 0\n",
            quote(&format!("Service {} stopped", spec.name))
        )
    }

    fn log_run_script(&self) -> String {
        format!(
            "#!/bin/sh\nexec {}svlogd -tt ./{}\n",
            self.chpst(),
            self.config.log_directory
        )
    }

    fn log_config(&self) -> String {
        format!("s{}\nn{}\n", self.config.max_log_size, self.config.max_log_num)
    }

    async fn write_tree(&self, dir: &Path, spec: &ServiceSpec) -> std::io::Result<()> {
        let log_dir = dir.join("log");
        tokio::fs::create_dir_all(log_dir.join(&self.config.log_directory)).await?;

        let files = [
            (dir.join("run"), self.run_script(spec), 0o755),
            (dir.join("finish"), Self::finish_script(spec), 0o755),
            (dir.join("down"), DOWN_FILE.to_string(), 0o644),
            (log_dir.join("run"), self.log_run_script(), 0o755),
            (log_dir.join("config"), self.log_config(), 0o644),
        ];
        for (path, content, mode) in files {
            tokio::fs::write(&path, content).await?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    async fn is_enabled(&self, name: &str) -> bool {
        tokio::fs::symlink_metadata(self.enabled_link(name))
            .await
            .is_ok()
    }

    async fn require(&self, name: &str) -> JobResult<()> {
        if self.exists(name).await {
            Ok(())
        } else {
            Err(JobError::not_found(SERVICE_TYPE, name))
        }
    }

    async fn control(&self, name: &str, commands: &str) -> JobResult<()> {
        self.require(name).await?;
        if !self.is_enabled(name).await {
            return Err(JobError::invalid("Service disabled"));
        }
        let path = self.service_dir(name).join("supervise/control");
        // O_NONBLOCK: opening the fifo fails fast instead of hanging when
        // runsv is not reading it.
        let mut control = tokio::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .await
            .map_err(|e| JobError::io(format!("opening {}", path.display()), &e))?;
        control
            .write_all(commands.as_bytes())
            .await
            .map_err(|e| JobError::io(format!("writing {}", path.display()), &e))?;
        debug!(service = name, commands, "control written");
        Ok(())
    }

    async fn read_status(&self, name: &str) -> Option<ServiceStatus> {
        let path = self.service_dir(name).join("supervise/status");
        let bytes = tokio::fs::read(&path).await.ok()?;
        parse_status_record(&bytes)
    }
}

/// Decode runsv's binary `supervise/status` record.
pub fn parse_status_record(bytes: &[u8]) -> Option<ServiceStatus> {
    if bytes.len() < STATUS_RECORD_LEN {
        return None;
    }
    let tai = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let pid = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
    let state = match bytes[19] {
        1 => ServiceState::Running,
        2 => ServiceState::Finish,
        _ => ServiceState::Down,
    };
    Some(ServiceStatus {
        time: tai.saturating_sub(TAI64_EPOCH),
        pid: if pid == 0 { -1 } else { i64::from(pid) },
        state,
    })
}

/// Single-quote for /bin/sh.
fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[async_trait]
impl ServiceManager for RunitServiceManager {
    async fn init(&self) -> JobResult<()> {
        for dir in [&self.available, &self.enabled] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| JobError::io(format!("creating {}", dir.display()), &e))?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ServiceSpec) -> JobResult<()> {
        let dir = self.service_dir(&spec.name);
        if tokio::fs::symlink_metadata(&dir).await.is_ok() {
            return Err(JobError::already_exists(SERVICE_TYPE, &spec.name));
        }
        if let Err(e) = self.write_tree(&dir, spec).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(JobError::io(format!("creating service {}", spec.name), &e));
        }
        info!(service = %spec.name, dir = ?dir, "service created");
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.service_dir(name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn details(&self, name: &str) -> JobResult<ServiceDetails> {
        self.require(name).await?;
        let enabled = self.is_enabled(name).await;
        let status = if enabled {
            self.read_status(name).await
        } else {
            None
        };
        Ok(ServiceDetails {
            name: name.to_string(),
            enabled,
            status,
        })
    }

    async fn enable(&self, name: &str) -> JobResult<()> {
        self.require(name).await?;
        if self.is_enabled(name).await {
            return Ok(());
        }
        let link = self.enabled_link(name);
        tokio::fs::symlink(self.service_dir(name), &link)
            .await
            .map_err(|e| JobError::io(format!("linking {}", link.display()), &e))?;
        info!(service = name, "service enabled");
        Ok(())
    }

    async fn disable(&self, name: &str) -> JobResult<()> {
        self.require(name).await?;
        let link = self.enabled_link(name);
        match tokio::fs::remove_file(&link).await {
            Ok(()) => {
                info!(service = name, "service disabled");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::io(format!("unlinking {}", link.display()), &e)),
        }
    }

    async fn start(&self, name: &str) -> JobResult<()> {
        self.control(name, "u").await
    }

    async fn stop(&self, name: &str) -> JobResult<()> {
        self.control(name, "d").await
    }

    async fn restart(&self, name: &str) -> JobResult<()> {
        self.control(name, "tcu").await
    }

    async fn destroy(&self, name: &str) -> JobResult<()> {
        self.disable(name).await?;
        let dir = self.service_dir(name);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| JobError::io(format!("removing {}", dir.display()), &e))?;
        info!(service = name, "service destroyed");
        Ok(())
    }

    async fn list(&self) -> JobResult<Vec<ServiceDetails>> {
        let mut entries = match tokio::fs::read_dir(&self.available).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(JobError::io(format!("reading {}", self.available.display()), &e));
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::io(format!("reading {}", self.available.display()), &e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut services = Vec::with_capacity(names.len());
        for name in names {
            services.push(self.details(&name).await?);
        }
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(app_type: AppType, entry: &str) -> ServiceSpec {
        ServiceSpec {
            name: "foo0@1.0".into(),
            instance: "foo0".into(),
            working_dir: PathBuf::from("/srv/cast/applications/foo0/versions/fooapp@1.0"),
            app_type,
            entry_file: entry.into(),
        }
    }

    fn manager(root: &Path, user: Option<&str>) -> RunitServiceManager {
        let config = RunitConfig {
            service_user: user.map(str::to_string),
            ..RunitConfig::default()
        };
        RunitServiceManager::new(root.join("available"), root.join("enabled"), config, "node")
    }

    fn status_record(tai: u64, pid: u32, state: u8) -> Vec<u8> {
        let mut record = vec![0u8; STATUS_RECORD_LEN];
        record[0..8].copy_from_slice(&tai.to_be_bytes());
        record[12..16].copy_from_slice(&pid.to_le_bytes());
        record[19] = state;
        record
    }

    #[test]
    fn status_record_decodes() {
        let status = parse_status_record(&status_record(TAI64_EPOCH + 1_700_000_000, 4242, 1)).unwrap();
        assert_eq!(
            status,
            ServiceStatus {
                time: 1_700_000_000,
                pid: 4242,
                state: ServiceState::Running
            }
        );

        let down = parse_status_record(&status_record(TAI64_EPOCH, 0, 0)).unwrap();
        assert_eq!(down.pid, -1);
        assert_eq!(down.state, ServiceState::Down);
        assert_eq!(parse_status_record(&status_record(0, 1, 2)).unwrap().state, ServiceState::Finish);
        assert!(parse_status_record(&[0u8; 12]).is_none());
    }

    #[test]
    fn run_scripts_follow_app_type() {
        let dir = tempfile::tempdir().unwrap();
        let plain = manager(dir.path(), None);
        assert_eq!(
            plain.run_script(&spec(AppType::Nodejs, "server.js")),
            "#!/bin/sh\ncd '/srv/cast/applications/foo0/versions/fooapp@1.0'\n\
             exec 'node' '/srv/cast/applications/foo0/versions/fooapp@1.0/server.js'\n"
        );
        let as_user = manager(dir.path(), Some("cast"));
        let shell = as_user.run_script(&spec(AppType::Shell, "shell.sh"));
        assert!(shell.ends_with("exec chpst -ucast /bin/sh '/srv/cast/applications/foo0/versions/fooapp@1.0/shell.sh'\n"));
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn service_lifecycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let runit = manager(dir.path(), None);
        runit.init().await.unwrap();
        let spec = spec(AppType::Nodejs, "server.js");

        runit.create(&spec).await.unwrap();
        let svc = dir.path().join("available/foo0@1.0");
        for file in ["run", "finish", "down", "log/run", "log/config"] {
            assert!(svc.join(file).is_file(), "{file}");
        }
        assert!(svc.join("log/main").is_dir());
        let mode = std::fs::metadata(svc.join("run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(matches!(
            runit.create(&spec).await,
            Err(JobError::AlreadyExists { .. })
        ));

        assert_eq!(runit.details("foo0@1.0").await.unwrap(), ServiceDetails::absent("foo0@1.0"));
        let err = runit.start("foo0@1.0").await.unwrap_err();
        assert_eq!(err.to_string(), "Service disabled");

        runit.enable("foo0@1.0").await.unwrap();
        std::fs::create_dir_all(svc.join("supervise")).unwrap();
        std::fs::write(svc.join("supervise/status"), status_record(TAI64_EPOCH + 10, 7, 1)).unwrap();
        let details = runit.details("foo0@1.0").await.unwrap();
        assert!(details.enabled);
        assert_eq!(details.status.unwrap().pid, 7);
        assert_eq!(
            std::fs::read_link(dir.path().join("enabled/foo0@1.0")).unwrap(),
            svc
        );

        assert_eq!(runit.list().await.unwrap().len(), 1);
        runit.destroy("foo0@1.0").await.unwrap();
        assert!(!svc.exists());
        assert!(std::fs::symlink_metadata(dir.path().join("enabled/foo0@1.0")).is_err());
        assert_eq!(
            runit.details("foo0@1.0").await.unwrap_err(),
            JobError::not_found(SERVICE_TYPE, "foo0@1.0")
        );
    }
}
