use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod builder;
pub mod composer;
pub mod config;
pub mod error;
pub mod harness;
pub mod host;
pub mod job;
pub mod lock;
pub mod process;
pub mod scheduler;
pub mod scoreboard;
pub mod stager;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{BuildEngine, DockerBuildEngine};
pub use composer::{ComposeOptions, ComposeRequest, DiskComposer, ImageComposer};
pub use config::{ClusterConfig, ImageSourceFormat, StoreConfig};
pub use error::{
    BuildError, ComposeError, ComposeStep, ExecutionError, JobError, ReportError, StagingError,
};
pub use harness::{ExecuteRequest, KirkRunner, Report, TestRunner, VmShape};
pub use host::{HostOps, SudoHost};
pub use job::{Job, JobId, JobLifecycle, JobPaths, JobState, LtpSource};
pub use process::{JobLog, Termination};
pub use scheduler::{load_batch, BatchOptions, BatchSummary, ClusterScheduler, JobSpec};
pub use scoreboard::{EntryStatus, Scoreboard, ScoreboardEntry, ScoreboardSummary};
pub use stager::{
    ArchiveTool, ArtifactKind, ArtifactStager, Compression, StagedArtifact, StagedArtifacts, TarTool,
};
pub use store::{ArtifactStore, GcloudStore, LocalStore, Locator, StoreError};

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub(crate) fn load_json_file(path: &Path) -> Result<Value> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
