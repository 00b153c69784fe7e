//! Publishing exports to the remote repository.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::config::RemoteTarget;
use crate::errors::{Result, SyncError};

/// The three version-control steps a sync pass needs.
pub trait VersionControl: Send {
    /// Stage `paths` (relative to the working tree root).
    fn add(&mut self, paths: &[PathBuf]) -> Result<()>;
    fn commit(&mut self, message: &str) -> Result<()>;
    fn push(&mut self, remote: &RemoteTarget) -> Result<()>;
}

/// `git` on the `PATH`, run inside `workdir`.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run(&self, args: Vec<OsString>) -> Result<()> {
        let command = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("git {}", command);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.workdir)
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(SyncError::Vcs {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into())
    }
}

impl VersionControl for GitCli {
    fn add(&mut self, paths: &[PathBuf]) -> Result<()> {
        let mut args = vec![OsString::from("add"), OsString::from("--")];
        args.extend(paths.iter().map(|p| p.as_os_str().to_owned()));
        self.run(args)
    }

    fn commit(&mut self, message: &str) -> Result<()> {
        self.run(vec!["commit".into(), "-m".into(), message.into()])
    }

    fn push(&mut self, remote: &RemoteTarget) -> Result<()> {
        self.run(vec!["push".into(), "origin".into(), remote.branch.as_str().into()])
    }
}
