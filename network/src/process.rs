use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long graceful stop waits after SIGINT before escalating to SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A supervised child process. Spawning redirects stdout and stderr into the
/// node's log file; a background task reaps the child and publishes its exit
/// code so watchers never block on `wait`.
pub struct NodeProcess {
    pid: u32,
    exit_rx: watch::Receiver<Option<i32>>,
    stopping: Arc<AtomicBool>,
}

/// Spawn `binary` with `args`, streaming output to `log_path`.
pub async fn spawn(binary: &Path, args: &[String], log_path: &Path) -> Result<NodeProcess> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::io(parent))?;
    }
    let stdout = File::create(log_path).map_err(Error::io(log_path))?;
    let stderr = stdout.try_clone().map_err(Error::io(log_path))?;

    let mut child = Command::new(binary)
        .args(args)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|e| Error::Resource(format!("failed to spawn {:?}: {}", binary, e)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process(format!("{:?} exited before it could be tracked", binary)))?;

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("failed to reap child {}: {}", pid, e);
                -1
            }
        };
        debug!("child {} exited with code {}", pid, code);
        let _ = exit_tx.send(Some(code));
    });

    Ok(NodeProcess {
        pid,
        exit_rx,
        stopping: Arc::new(AtomicBool::new(false)),
    })
}

impl NodeProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// True once a graceful stop has been requested; exit watchers use this
    /// to tell an ordered shutdown from a crash.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// A receiver that resolves to the exit code when the child terminates.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Shared handle to the stopping flag, for exit watchers that outlive
    /// the borrow of this record.
    pub fn stopping_handle(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    /// Suspend the process without releasing its ports or data.
    pub fn pause(&self) -> Result<()> {
        self.signal(libc::SIGSTOP)
    }

    pub fn resume(&self) -> Result<()> {
        self.signal(libc::SIGCONT)
    }

    /// Graceful stop: SIGINT, bounded wait, then SIGKILL. A paused child is
    /// resumed first so it can observe the signal.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            return Ok(());
        }

        let _ = self.signal(libc::SIGCONT);
        let _ = self.signal(libc::SIGINT);

        if tokio::time::timeout(timeout, self.wait_exited())
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!("child {} ignored SIGINT for {:?}, killing", self.pid, timeout);
        let _ = self.signal(libc::SIGKILL);
        self.wait_exited().await;
        Ok(())
    }

    /// Block until the child has exited, returning its exit code.
    pub async fn wait_exited(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.exit_rx.borrow() {
                return code;
            }
            if self.exit_rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    fn signal(&self, signal: libc::c_int) -> Result<()> {
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc != 0 {
            return Err(Error::Process(format!(
                "failed to signal {} to pid {}: {}",
                signal,
                self.pid,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn spawn_sleep(dir: &TempDir, secs: &str) -> NodeProcess {
        spawn(
            Path::new("/bin/sleep"),
            &[secs.to_string()],
            &dir.path().join("main.log"),
        )
        .await
        .expect("failed to spawn sleep")
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_sleep(&dir, "30").await;
        assert!(process.is_alive());
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_process() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_sleep(&dir, "30").await;
        process.pause().unwrap();
        assert!(process.is_alive());
        process.resume().unwrap();
        assert!(process.is_alive());
        process.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_sleep(&dir, "0").await;
        let code = process.wait_exited().await;
        assert_eq!(code, 0);
        assert!(!process.is_alive());
        // Stopping an already-exited process is a no-op.
        process.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let dir = TempDir::new().unwrap();
        let result = spawn(
            Path::new("/nonexistent/binary"),
            &[],
            &dir.path().join("main.log"),
        )
        .await;
        assert!(result.is_err());
    }
}
