use crate::process::{run_logged, JobLog, Termination};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Storage coordinates of one job's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub bucket: String,
    pub prefix: String,
}

impl Locator {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    pub fn object(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket, self.object(name))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("transfer tool failed: {0}")]
    Tool(Termination),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait ArtifactStore: Send + Sync {
    /// Downloads `bucket/object` to `dest`, overwriting it.
    fn fetch(&self, bucket: &str, object: &str, dest: &Path, log: &JobLog)
        -> Result<(), StoreError>;
}

/// Cloud storage through the `gcloud storage` CLI.
#[derive(Debug, Clone)]
pub struct GcloudStore {
    program: String,
    timeout: Option<Duration>,
}

impl GcloudStore {
    pub fn new(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl ArtifactStore for GcloudStore {
    fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
        log: &JobLog,
    ) -> Result<(), StoreError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["storage", "cp", "--no-user-output-enabled"])
            .arg(format!("gs://{}/{}", bucket, object))
            .arg(dest);
        let termination = run_logged(&mut cmd, log, self.timeout)?;
        if termination.success() {
            Ok(())
        } else {
            Err(StoreError::Tool(termination))
        }
    }
}

/// Mirror laid out as `<root>/<bucket>/<object>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for LocalStore {
    fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
        log: &JobLog,
    ) -> Result<(), StoreError> {
        let src = self.root.join(bucket).join(object);
        if !src.is_file() {
            return Err(StoreError::NotFound(src.display().to_string()));
        }
        log.note(format_args!("copy {} -> {}", src.display(), dest.display()));
        fs::copy(&src, dest)?;
        Ok(())
    }
}
