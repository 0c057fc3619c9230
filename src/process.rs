//! Supervision of the wrapped backup server process
//!
//! The supervisor owns the spawned child exclusively. The signal-relay path
//! only reads the pid and a liveness flag, so a racing process exit can
//! never touch the handle itself.

use crate::config::Options;
use crate::release;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Internal port the wrapped server is told to listen on
pub const UPSTREAM_PORT: u16 = 8300;

/// Default location of the bundled server executable
const EXECUTABLE_DEFAULT: &str = "/opt/duplicati/duplicati-server";
/// Environment variable overriding the executable location
const EXECUTABLE_ENV: &str = "PROCESS_EXECUTABLE";

/// Handle to the running backup server.
pub struct Supervisor {
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    exited: AtomicBool,
}

impl Supervisor {
    /// Install a custom release when the options request one, then spawn
    /// the server with its derived argument list and environment.
    pub async fn start(opts: &Options) -> Result<Self> {
        let executable = match opts.custom_release.as_deref() {
            Some(url) => release::install(url)
                .await
                .context("could not install custom release")?,
            None => PathBuf::from(default_executable()),
        };

        let mut cmd = Command::new(&executable);
        cmd.arg("--webservice-disable-https=True")
            .arg("--log-file=/dev/stdout")
            .arg("--webservice-interface=any")
            .arg("--webservice-allowed-hostnames=*")
            .arg("--server-datafolder=/data")
            .arg("--require-db-encryption-key=True")
            .arg(format!("--webservice-timezone={}", opts.timezone))
            .arg(format!("--log-level={}", opts.log_level))
            .arg(format!("--webservice-port={UPSTREAM_PORT}"));

        // The child gets a minimal environment: the executable's own
        // directory on the search path plus the three secrets it expects.
        cmd.env_clear()
            .env("PATH", search_path(&executable))
            .env(
                "DUPLICATI__WEBSERVICE_PASSWORD",
                &opts.secrets.webservice_password,
            )
            .env(
                "DUPLICATI__WEBSERVICE_PRE_AUTH_TOKENS",
                &opts.secrets.webservice_pre_auth_tokens,
            )
            .env(
                "SETTINGS_ENCRYPTION_KEY",
                &opts.secrets.settings_encryption_key,
            );

        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .with_context(|| format!("cannot start process {}", executable.display()))?;

        let pid = child.id().unwrap_or(0);
        info!(pid, executable = %executable.display(), "backup server process started");

        Ok(Self::supervising(child))
    }

    fn supervising(child: Child) -> Self {
        let pid = child.id().unwrap_or(0);
        Self {
            child: Mutex::new(Some(child)),
            pid: AtomicU32::new(pid),
            exited: AtomicBool::new(false),
        }
    }

    /// A supervisor with nothing to supervise; `wait` reports exit code 0.
    #[cfg(test)]
    fn idle() -> Self {
        Self {
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            exited: AtomicBool::new(false),
        }
    }

    /// Relay `sig` to the child. Best-effort: if the process raced us and
    /// already exited, the failure is logged and swallowed.
    #[cfg(unix)]
    pub fn signal(&self, sig: i32) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, sig, error = %err, "cannot send signal to process");
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _sig: i32) {}

    /// Block until the child terminates and translate its wait status into
    /// the wrapper's own exit code.
    pub async fn wait(&self) -> Result<i32> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(0);
        };

        let status = child.wait().await;
        self.exited.store(true, Ordering::SeqCst);
        let status = status.context("cannot wait for process")?;
        Ok(exit_code(status))
    }

    /// Fire-and-forget termination request; the exit itself is observed by
    /// `wait`.
    pub fn close(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
    }
}

/// Normal exit reports the child's own code; a signal-terminated child
/// maps to the conventional `128 + signal`.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

fn default_executable() -> String {
    match std::env::var(EXECUTABLE_ENV) {
        Ok(v) if !v.is_empty() => v,
        _ => EXECUTABLE_DEFAULT.to_string(),
    }
}

fn search_path(executable: &Path) -> String {
    let dir = executable
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .to_string_lossy()
        .into_owned();
    match std::env::var("PATH") {
        Ok(path) if !path.is_empty() => format!("{dir}:{path}"),
        _ => dir,
    }
}
