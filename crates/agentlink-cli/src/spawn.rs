//! Disposable `ssh-agent` for the demo flow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::debug;

pub struct SpawnedAgent {
    child: Child,
    socket_path: PathBuf,
}

impl SpawnedAgent {
    /// Launches `ssh-agent -D` bound to a private socket path and waits for
    /// the socket to appear.
    pub async fn spawn() -> Result<SpawnedAgent> {
        let socket_path =
            std::env::temp_dir().join(format!("agentlink-demo-{}.sock", std::process::id()));
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale {}", socket_path.display()))?;
        }

        let child = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket_path)
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to launch ssh-agent (is it installed?)")?;
        debug!(path = %socket_path.display(), "waiting for agent socket");

        for _ in 0..50 {
            if socket_path.exists() {
                return Ok(SpawnedAgent { child, socket_path });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!(
            "ssh-agent socket never appeared at {}",
            socket_path.display()
        );
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.child.kill().await.ok();
        std::fs::remove_file(&self.socket_path).ok();
        Ok(())
    }
}
