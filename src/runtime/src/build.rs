//! Build executor: runs the image builder on a template.
//!
//! Each build gets its own temporary working directory. The template is
//! written there, the builder runs with that directory as its cwd, and the
//! two artifacts it leaves behind (metadata archive and filesystem image)
//! are handed back inside a [`BuildArtifacts`] that owns the directory.
//! Dropping the artifacts removes the directory, whatever the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
#[cfg(unix)]
use std::time::Duration;

use lxbake_core::config::BuilderConfig;
use lxbake_core::error::{BakeError, Result};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Output of a successful build.
#[derive(Debug)]
pub struct BuildArtifacts {
    dir: TempDir,
    meta_path: PathBuf,
    rootfs_path: PathBuf,
}

impl BuildArtifacts {
    /// Metadata archive (e.g. `lxd.tar.xz`).
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Filesystem image (e.g. `rootfs.squashfs`).
    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs_path
    }

    /// Working directory holding the artifacts.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the working directory now, logging instead of failing.
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(dir = %path.display(), error = %e, "Failed to remove build directory");
        }
    }
}

/// Runs the external image builder.
#[derive(Debug, Clone)]
pub struct BuildExecutor {
    config: BuilderConfig,
}

impl BuildExecutor {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build an image from a template.
    ///
    /// # Process
    ///
    /// 1. Create a fresh working directory
    /// 2. Write the template to the definition file
    /// 3. Run the builder, streaming its output to the log
    /// 4. Check both artifacts exist
    pub async fn build(&self, template: &str, cancel: &CancellationToken) -> Result<BuildArtifacts> {
        let dir = self.work_dir()?;
        let definition = dir.path().join(&self.config.definition_file);
        tokio::fs::write(&definition, template).await?;

        tracing::info!(
            dir = %dir.path().display(),
            builder = %self.config.program,
            "Building image"
        );

        let mut child = self
            .command(&definition)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BakeError::BuildFailure {
                status: None,
                message: format!("Failed to start {}: {}", self.config.program, e),
            })?;

        // Drained in the background; the wait below does not depend on them.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, true));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                tracing::warn!(builder = %self.config.program, "Build cancelled, stopping builder");
                self.terminate(&mut child).await;
                return Err(BakeError::Cancelled("image build".to_string()));
            }
        };

        if !status.success() {
            return Err(BakeError::BuildFailure {
                status: status.code(),
                message: format!("{} exited with {}", self.config.program, status),
            });
        }

        let meta_path = dir.path().join(&self.config.meta_artifact);
        let rootfs_path = dir.path().join(&self.config.rootfs_artifact);
        for path in [&meta_path, &rootfs_path] {
            if !tokio::fs::try_exists(path).await? {
                tracing::error!(path = %path.display(), "Build artifact not found");
                return Err(BakeError::ArtifactMissing {
                    path: path.display().to_string(),
                });
            }
        }

        tracing::info!(
            meta = %meta_path.display(),
            rootfs = %rootfs_path.display(),
            "Build finished"
        );

        Ok(BuildArtifacts {
            dir,
            meta_path,
            rootfs_path,
        })
    }

    fn work_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("distrobuilder");
        let dir = match self.config.work_root {
            Some(ref root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Stop the builder and everything it spawned.
    ///
    /// The builder runs in its own process group. The group gets SIGTERM
    /// first (a privilege wrapper such as sudo relays it to the builder),
    /// then SIGKILL once the grace period is over.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pgid) = child.id() {
            let grace = Duration::from_secs(self.config.cancel_grace_secs);
            signal_group(pgid, libc::SIGTERM);
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            if !exited {
                tracing::warn!(grace_secs = grace.as_secs(), "Builder ignored SIGTERM, killing");
            }
            // Stragglers that outlived the leader are killed too.
            signal_group(pgid, libc::SIGKILL);
            if exited {
                return;
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to kill builder");
        }
    }

    /// `[wrapper] program args... <definition>`
    fn command(&self, definition: &Path) -> Command {
        let mut cmd = match self.config.privilege_wrapper {
            Some(ref wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(&self.config.program);
                cmd
            }
            None => Command::new(&self.config.program),
        };
        cmd.args(&self.config.args).arg(definition);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Send `signal` to every process in group `pgid`.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, signal, error = %err, "Failed to signal builder process group");
        }
    }
}

/// Forward builder output to the log line by line.
async fn drain_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => tracing::warn!(target: "lxbake::builder", "{}", line),
            Ok(Some(line)) => tracing::info!(target: "lxbake::builder", "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading builder output");
                break;
            }
        }
    }
}
