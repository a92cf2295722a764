//! Bundle lifecycle hooks.
//!
//! A hook is an executable at `<version>/.cast-project/hooks/<hook>`. It runs
//! with the version directory as its working directory and the instance
//! identity in its environment. Missing hooks are skipped.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use cast_core::config::HooksConfig;
use cast_jobs::{HookFailure, JobContext, JobError, JobResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

pub const HOOKS_DIR: &str = ".cast-project/hooks";

pub const POST_PREPARE: &str = "post_prepare";
pub const PRE_VERSION_ACTIVATE: &str = "pre_version_activate";
pub const POST_VERSION_ACTIVATE: &str = "post_version_activate";

/// How long a hook gets after SIGTERM before it is killed outright.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Who a hook runs for.
pub struct HookTarget<'a> {
    pub instance: &'a str,
    pub version: &'a str,
    pub version_path: &'a Path,
}

#[derive(Debug, Clone)]
pub struct HookRunner {
    config: HooksConfig,
}

impl HookRunner {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    pub fn hook_path(version_path: &Path, hook: &str) -> PathBuf {
        version_path.join(HOOKS_DIR).join(hook)
    }

    /// Run `hook` for `target`. Returns whether a hook was found.
    pub async fn run(&self, hook: &str, target: &HookTarget<'_>, ctx: &JobContext) -> JobResult<bool> {
        let path = Self::hook_path(target.version_path, hook);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                debug!(hook, instance = target.instance, "no hook present");
                return Ok(false);
            }
        }

        let timeout = self.config.timeout_for(hook);
        ctx.message(format!("running hook {hook}"));
        debug!(hook, instance = target.instance, ?timeout, "running hook");

        let mut child = Command::new(&path)
            .current_dir(target.version_path)
            .env("CAST_INSTANCE_NAME", target.instance)
            .env("CAST_INSTANCE_VERSION", target.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::io(format!("spawning hook {hook}"), &e))?;

        let stdout = tokio::spawn(collect(child.stdout.take()));
        let stderr = tokio::spawn(collect(child.stderr.take()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| JobError::io(format!("waiting for hook {hook}"), &e))?,
            Err(_) => {
                terminate(&mut child).await;
                warn!(hook, instance = target.instance, ?timeout, "hook timed out");
                return Err(JobError::Hook {
                    hook: hook.to_string(),
                    failure: HookFailure::TimedOut,
                    message: format!("hook '{hook}' timed out after {}s", timeout.as_secs()),
                });
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        for line in stdout.lines().chain(stderr.lines()) {
            debug!(hook, instance = target.instance, "{line}");
        }

        if status.success() {
            return Ok(true);
        }
        let (failure, message) = match status.code() {
            Some(code) => (
                HookFailure::Exited(code),
                format!("hook '{hook}' exited with status {code}"),
            ),
            None => {
                let signal = status.signal();
                let shown = signal.map_or_else(|| "unknown".to_string(), |s| s.to_string());
                (
                    HookFailure::Signaled(signal),
                    format!("hook '{hook}' was killed by signal {shown}"),
                )
            }
        };
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            message
        } else {
            format!("{message}: {stderr}")
        };
        Err(JobError::Hook {
            hook: hook.to_string(),
            failure,
            message,
        })
    }
}

async fn collect<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut stream) = stream {
        let mut buf = Vec::new();
        if stream.read_to_end(&mut buf).await.is_ok() {
            out = String::from_utf8_lossy(&buf).into_owned();
        }
    }
    out
}

/// SIGTERM, then SIGKILL if the child outlives the grace period.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) on a pid we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_jobs::{JobOptions, JobRegistry, JobSpec, Resource, ResourceIndex};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::future::Future;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    struct Scratch {
        name: String,
    }

    struct RunHook {
        runner: HookRunner,
        hook: &'static str,
        version_path: PathBuf,
    }

    impl Resource for Scratch {
        const TYPE_NAME: &'static str = "Scratch";
        type Job = RunHook;

        fn name(&self) -> &str {
            &self.name
        }

        async fn exists(&self) -> bool {
            true
        }
    }

    impl JobSpec<Scratch> for RunHook {
        fn kind(&self) -> &'static str {
            "RunHook"
        }

        fn options(&self) -> JobOptions {
            JobOptions::UPDATE
        }

        fn run(
            self,
            _: Arc<Scratch>,
            ctx: JobContext,
        ) -> impl Future<Output = JobResult<Value>> + Send + 'static {
            async move {
                let target = HookTarget {
                    instance: "foo0",
                    version: "1.0",
                    version_path: &self.version_path,
                };
                let ran = self.runner.run(self.hook, &target, &ctx).await?;
                Ok(Value::Bool(ran))
            }
        }
    }

    fn write_hook(version: &Path, hook: &str, body: &str) {
        let dir = version.join(HOOKS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(hook);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn run(version: &Path, hook: &'static str, timeout_secs: u64) -> JobResult<Value> {
        let runner = HookRunner::new(HooksConfig {
            timeouts: HashMap::from([(hook.to_string(), timeout_secs)]),
            default_timeout: 50,
        });
        let index = ResourceIndex::new(JobRegistry::new());
        let job = RunHook {
            runner,
            hook,
            version_path: version.to_path_buf(),
        };
        index
            .submit("s", || Scratch { name: "s".into() }, job)
            .wait()
            .await
    }

    #[tokio::test]
    async fn missing_hook_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(run(dir.path(), POST_PREPARE, 5).await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn hook_sees_instance_environment() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            POST_PREPARE,
            "echo \"$CAST_INSTANCE_NAME $CAST_INSTANCE_VERSION\" > env.out",
        );
        assert_eq!(run(dir.path(), POST_PREPARE, 5).await.unwrap(), Value::Bool(true));
        let out = std::fs::read_to_string(dir.path().join("env.out")).unwrap();
        assert_eq!(out.trim(), "foo0 1.0");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), PRE_VERSION_ACTIVATE, "exit 3");
        match run(dir.path(), PRE_VERSION_ACTIVATE, 5).await.unwrap_err() {
            JobError::Hook { hook, failure, message } => {
                assert_eq!(hook, PRE_VERSION_ACTIVATE);
                assert_eq!(failure, HookFailure::Exited(3));
                assert_eq!(message, "hook 'pre_version_activate' exited with status 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_terminates_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), POST_VERSION_ACTIVATE, "sleep 30");
        let started = std::time::Instant::now();
        match run(dir.path(), POST_VERSION_ACTIVATE, 1).await.unwrap_err() {
            JobError::Hook { failure, .. } => assert_eq!(failure, HookFailure::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
