//! Deterministic doubles for the external tools a job drives.

use crate::builder::{deliverable_path, BuildEngine};
use crate::composer::{ComposeOptions, ImageComposer};
use crate::config::{ImageConfig, ImageSourceFormat, RetryConfig};
use crate::error::{BuildError, ComposeError, ComposeStep, ExecutionError};
use crate::harness::{ExecuteRequest, TestRunner};
use crate::host::HostOps;
use crate::job::JobLifecycle;
use crate::lock::HostSemaphore;
use crate::process::{JobLog, Termination};
use crate::stager::{ArchiveTool, ArtifactStager, Compression};
use crate::store::{ArtifactStore, LocalStore, StoreError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub fn sample_report() -> Value {
    json!({"suites": {"syscalls": {"passed": 10, "failed": 0}}})
}

/// Lays out `<root>/<bucket>/<prefix>/` with every object a job fetches.
pub fn seed_mirror(root: &Path, bucket: &str, prefix: &str) {
    let dir = root.join(bucket).join(prefix);
    fs::create_dir_all(&dir).expect("mirror dir");
    for (name, body) in [
        ("kcache.tar.zstd", &b"kcache"[..]),
        ("kernel", &b"bzImage"[..]),
        ("kernel.config", &b"CONFIG_KASAN=y\n"[..]),
        ("image.tar.gz", &b"image tarball"[..]),
    ] {
        fs::write(dir.join(name), body).expect("mirror object");
    }
}

#[derive(Debug, Default)]
struct HostState {
    attached: Vec<PathBuf>,
    mounted: Vec<PathBuf>,
    calls: Vec<ComposeStep>,
    appended: Vec<(PathBuf, String)>,
    tripped: bool,
    next_loop: u32,
    removals: usize,
}

/// In-memory host that tracks loop devices and mounts. With `fail_at`, the
/// first call of that step fails with exit code 1; later calls succeed.
/// With `fail_removal`, that cleanup call (counting from 1) fails.
#[derive(Debug, Default)]
pub struct FakeHost {
    fail_at: Option<ComposeStep>,
    fail_removal: Option<usize>,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(step: ComposeStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::default()
        }
    }

    pub fn failing_removal(nth: usize) -> Self {
        Self {
            fail_removal: Some(nth),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, step: ComposeStep) -> Result<MutexGuard<'_, HostState>, ComposeError> {
        let mut state = self.state();
        state.calls.push(step);
        if self.fail_at == Some(step) && !state.tripped {
            state.tripped = true;
            return Err(ComposeError::exit(step, Termination::Exited(1)));
        }
        Ok(state)
    }

    pub fn attached(&self) -> Vec<PathBuf> {
        self.state().attached.clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().mounted.clone()
    }

    pub fn calls(&self) -> Vec<ComposeStep> {
        self.state().calls.clone()
    }

    pub fn appended(&self) -> Vec<(PathBuf, String)> {
        self.state().appended.clone()
    }
}

impl HostOps for FakeHost {
    fn attach_loop(&self, _image: &Path, _log: &JobLog) -> Result<PathBuf, ComposeError> {
        let mut state = self.enter(ComposeStep::Losetup)?;
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.attached.push(device.clone());
        Ok(device)
    }

    fn detach_loop(&self, device: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        let mut state = self.enter(ComposeStep::Detach)?;
        state.attached.retain(|d| d != device);
        Ok(())
    }

    fn grow_partition(&self, _device: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        self.enter(ComposeStep::Growpart).map(drop)
    }

    fn check_filesystem(&self, _partition: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        self.enter(ComposeStep::E2fsck).map(drop)
    }

    fn resize_filesystem(&self, _partition: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        self.enter(ComposeStep::Resize2fs).map(drop)
    }

    fn make_dir(&self, dir: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        drop(self.enter(ComposeStep::Mkdir)?);
        fs::create_dir_all(dir).map_err(|e| ComposeError::io(ComposeStep::Mkdir, e))
    }

    fn mount(
        &self,
        _partition: &Path,
        mountpoint: &Path,
        _log: &JobLog,
    ) -> Result<(), ComposeError> {
        let mut state = self.enter(ComposeStep::Mount)?;
        state.mounted.push(mountpoint.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path, _lazy: bool, _log: &JobLog) -> Result<(), ComposeError> {
        let mut state = self.enter(ComposeStep::Umount)?;
        state.mounted.retain(|m| m != mountpoint);
        Ok(())
    }

    fn copy(
        &self,
        _src: &Path,
        _dst: &Path,
        _recursive: bool,
        step: ComposeStep,
        _log: &JobLog,
    ) -> Result<(), ComposeError> {
        self.enter(step).map(drop)
    }

    fn append_line(&self, file: &Path, line: &str, _log: &JobLog) -> Result<(), ComposeError> {
        let mut state = self.enter(ComposeStep::Inputrc)?;
        state.appended.push((file.to_path_buf(), line.to_string()));
        Ok(())
    }

    fn remove_all(&self, paths: &[PathBuf], _log: &JobLog) -> io::Result<()> {
        {
            let mut state = self.state();
            state.removals += 1;
            if self.fail_removal == Some(state.removals) {
                return Err(io::Error::new(io::ErrorKind::Other, "rm ended with exit code 1"));
            }
        }
        for path in paths {
            match fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
                Ok(_) => fs::remove_file(path)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Writes marker files instead of unpacking real archives. Gzip extraction
/// also drops a stray `stdout.txt` and `README`, as a careless tarball would.
#[derive(Debug, Clone, Default)]
pub struct StubArchive {
    pub fail_extract: bool,
    /// Gzip extraction produces no `disk.raw`.
    pub omit_disk: bool,
}

impl ArchiveTool for StubArchive {
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        compression: Compression,
        _log: &JobLog,
    ) -> io::Result<Termination> {
        if self.fail_extract || !archive.is_file() {
            return Ok(Termination::Exited(2));
        }
        match compression {
            Compression::ZstdMt => fs::write(dest.join("Makefile"), b"obj-y += kernel/\n")?,
            Compression::Gzip => {
                fs::write(dest.join("stdout.txt"), b"tarball noise\n")?;
                fs::write(dest.join("README"), b"guest image\n")?;
                if !self.omit_disk {
                    fs::write(dest.join("disk.raw"), b"tarball image")?;
                }
            }
        }
        Ok(Termination::Exited(0))
    }

    fn clone_image(&self, src: &Path, dest: &Path, _log: &JobLog) -> io::Result<Termination> {
        if !src.is_file() {
            return Ok(Termination::Exited(1));
        }
        fs::copy(src, dest)?;
        Ok(Termination::Exited(0))
    }
}

/// Fails the first `failures` fetches, then delegates.
pub struct FlakyStore {
    inner: Arc<dyn ArtifactStore>,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ArtifactStore>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactStore for FlakyStore {
    fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
        log: &JobLog,
    ) -> Result<(), StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StoreError::Tool(Termination::Exited(1)));
        }
        self.inner.fetch(bucket, object, dest, log)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubBuilder {
    fail: bool,
}

impl StubBuilder {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl BuildEngine for StubBuilder {
    fn build(
        &self,
        _kcache: &Path,
        output_dir: &Path,
        _repo_url: &str,
        _branch: &str,
        _log: &JobLog,
    ) -> Result<PathBuf, BuildError> {
        if self.fail {
            return Err(BuildError::Failed(Termination::Exited(2)));
        }
        let deliverable = deliverable_path(output_dir);
        fs::create_dir_all(deliverable.join("bin")).map_err(|source| BuildError::Io {
            path: deliverable.clone(),
            source,
        })?;
        Ok(deliverable)
    }
}

#[derive(Debug)]
enum RunnerOutput {
    Report(Value),
    Raw(Vec<u8>),
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mishap {
    Fail,
    TimeOut,
    Panic,
}

#[derive(Debug)]
struct RunnerScript {
    output: RunnerOutput,
    mishaps: HashMap<String, Mishap>,
    /// Overwritten with a non-object document on every run.
    clobber: Option<PathBuf>,
    calls: Mutex<Vec<String>>,
}

/// Harness double keyed by bug id, which it reads back from the report path.
#[derive(Debug, Clone)]
pub struct ScriptedRunner {
    script: Arc<RunnerScript>,
}

impl ScriptedRunner {
    fn with(
        output: RunnerOutput,
        mishap: Mishap,
        bug_ids: &[&str],
        clobber: Option<PathBuf>,
    ) -> Self {
        Self {
            script: Arc::new(RunnerScript {
                output,
                mishaps: bug_ids.iter().map(|b| (b.to_string(), mishap)).collect(),
                clobber,
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn passing(report: Value) -> Self {
        Self::with(RunnerOutput::Report(report), Mishap::Fail, &[], None)
    }

    pub fn silent() -> Self {
        Self::with(RunnerOutput::Nothing, Mishap::Fail, &[], None)
    }

    pub fn writing_raw(bytes: &[u8]) -> Self {
        Self::with(RunnerOutput::Raw(bytes.to_vec()), Mishap::Fail, &[], None)
    }

    pub fn failing_for(report: Value, bug_ids: &[&str]) -> Self {
        Self::with(RunnerOutput::Report(report), Mishap::Fail, bug_ids, None)
    }

    /// The harness hits its deadline for these bug ids.
    pub fn timing_out_for(report: Value, bug_ids: &[&str]) -> Self {
        Self::with(RunnerOutput::Report(report), Mishap::TimeOut, bug_ids, None)
    }

    pub fn panicking_for(report: Value, bug_ids: &[&str]) -> Self {
        Self::with(RunnerOutput::Report(report), Mishap::Panic, bug_ids, None)
    }

    pub fn clobbering(report: Value, victim: &Path) -> Self {
        Self::with(
            RunnerOutput::Report(report),
            Mishap::Fail,
            &[],
            Some(victim.to_path_buf()),
        )
    }

    fn calls(&self) -> MutexGuard<'_, Vec<String>> {
        self.script.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn invocations(&self) -> usize {
        self.calls().len()
    }

    pub fn invocations_for(&self, bug_id: &str) -> usize {
        self.calls().iter().filter(|b| b.as_str() == bug_id).count()
    }
}

fn bug_of(req: &ExecuteRequest<'_>) -> String {
    req.report
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl TestRunner for ScriptedRunner {
    fn execute(&self, req: &ExecuteRequest<'_>, _log: &JobLog) -> Result<(), ExecutionError> {
        let bug = bug_of(req);
        self.calls().push(bug.clone());
        if let Some(victim) = &self.script.clobber {
            fs::write(victim, b"[]").map_err(ExecutionError::Launch)?;
        }
        match self.script.mishaps.get(&bug) {
            Some(Mishap::Panic) => panic!("harness exploded for {}", bug),
            Some(Mishap::Fail) => return Err(ExecutionError::Failed(Termination::Exited(1))),
            Some(Mishap::TimeOut) => {
                return Err(ExecutionError::Failed(Termination::TimedOut(
                    Duration::from_secs(7200),
                )))
            }
            None => {}
        }
        let bytes = match &self.script.output {
            RunnerOutput::Report(value) => {
                serde_json::to_vec(value).map_err(|e| ExecutionError::Launch(e.into()))?
            }
            RunnerOutput::Raw(bytes) => bytes.clone(),
            RunnerOutput::Nothing => return Ok(()),
        };
        fs::write(req.report, bytes).map_err(ExecutionError::Launch)
    }
}

/// A scratch environment: local mirror, base image and fake host under `root`.
pub struct Env {
    pub root: PathBuf,
    pub host: Arc<FakeHost>,
    builder: StubBuilder,
}

impl Env {
    pub fn new(root: &Path) -> Self {
        seed_mirror(&root.join("mirror"), "b", "p");
        fs::write(root.join("ltp.raw"), b"base image").expect("base image");
        Self {
            root: root.to_path_buf(),
            host: Arc::new(FakeHost::new()),
            builder: StubBuilder::default(),
        }
    }

    pub fn with_host(mut self, host: FakeHost) -> Self {
        self.host = Arc::new(host);
        self
    }

    pub fn with_builder(mut self, builder: StubBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn lifecycle(&self, runner: ScriptedRunner) -> JobLifecycle {
        let image = ImageConfig {
            source_format: ImageSourceFormat::Raw,
            base_image: self.root.join("ltp.raw"),
            ..ImageConfig::default()
        };
        let stager = ArtifactStager::new(
            Arc::new(LocalStore::new(self.root.join("mirror"))),
            Arc::new(StubArchive::default()),
            image,
            RetryConfig::default(),
        );
        let host: Arc<dyn HostOps> = self.host.clone();
        let composer = ImageComposer::new(
            Arc::clone(&host),
            HostSemaphore::new(self.root.join("loop.lock"), 1),
            ComposeOptions {
                resize: false,
                target_size: 0,
            },
        );
        JobLifecycle::new(
            stager,
            Arc::new(self.builder.clone()),
            Arc::new(composer),
            Arc::new(runner),
            host,
        )
    }
}
