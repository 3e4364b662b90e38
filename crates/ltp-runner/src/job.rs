use crate::builder::{BuildEngine, DockerBuildEngine};
use crate::composer::{ComposeOptions, ComposeRequest, DiskComposer, ImageComposer};
use crate::config::{parse_size, ClusterConfig, StoreConfig, TimeoutConfig};
use crate::error::JobError;
use crate::harness::{read_report, ExecuteRequest, KirkRunner, Report, TestRunner, VmShape};
use crate::host::{HostOps, SudoHost};
use crate::lock::HostSemaphore;
use crate::process::JobLog;
use crate::stager::{ArtifactStager, TarTool};
use crate::store::{ArtifactStore, GcloudStore, LocalStore, Locator};
use crate::ensure_dir;
use anyhow::Result;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, info_span, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub bug_id: String,
    pub tag: String,
}

impl JobId {
    pub fn new(bug_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            tag: tag.into(),
        }
    }

    /// Both halves become directory names under the work root, so each must
    /// be exactly one normal path component.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (field, value) in [("bug-id", &self.bug_id), ("tag", &self.tag)] {
            let mut components = Path::new(value).components();
            let single_normal = matches!(components.next(), Some(Component::Normal(_)))
                && components.next().is_none();
            if value.is_empty() || value.contains('/') || !single_normal {
                return Err(format!("{} '{}' is not a plain directory name", field, value));
            }
        }
        Ok(())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.bug_id, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LtpSource {
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub locator: Locator,
    pub suites: Vec<String>,
    pub ltp: LtpSource,
    pub work_dir: PathBuf,
}

impl Job {
    pub fn new(
        id: JobId,
        locator: Locator,
        suites: Vec<String>,
        ltp: LtpSource,
        work_root: &Path,
    ) -> Self {
        let work_dir = work_root.join(&id.bug_id).join(&id.tag);
        Self {
            id,
            locator,
            suites,
            ltp,
            work_dir,
        }
    }

    pub fn paths(&self) -> JobPaths {
        JobPaths::new(&self.work_dir)
    }
}

/// Fixed layout of a job's exclusive work directory.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub work_dir: PathBuf,
    pub kcache_archive: PathBuf,
    pub kcache: PathBuf,
    pub image_archive: PathBuf,
    /// Scratch directory the image tarball is unpacked into.
    pub image_unpack: PathBuf,
    pub disk: PathBuf,
    pub deliverable_root: PathBuf,
    pub mnt: PathBuf,
    pub report: PathBuf,
    pub kernel: PathBuf,
    pub kernel_config: PathBuf,
    pub harness_tmp: PathBuf,
    pub log: PathBuf,
}

impl JobPaths {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            kcache_archive: work_dir.join("kcache.tar.zstd"),
            kcache: work_dir.join("kcache"),
            image_archive: work_dir.join("image.tar.gz"),
            image_unpack: work_dir.join("image-unpack"),
            disk: work_dir.join("disk.raw"),
            deliverable_root: work_dir.join("ltp-deliverable"),
            mnt: work_dir.join("mnt"),
            report: work_dir.join("report.json"),
            kernel: work_dir.join("kernel"),
            kernel_config: work_dir.join("kernel.config"),
            harness_tmp: work_dir.join("kirk-tmp"),
            log: work_dir.join("stdout.txt"),
        }
    }

    /// Everything cleanup removes. The log is deliberately absent.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let downloads = [
            &self.kcache_archive,
            &self.image_archive,
            &self.disk,
            &self.kernel,
            &self.kernel_config,
        ];
        let mut out: Vec<PathBuf> = downloads.iter().map(|p| p.to_path_buf()).collect();
        out.extend(downloads.iter().map(|p| crate::stager::partial_path(p)));
        out.extend([
            self.kcache.clone(),
            self.image_unpack.clone(),
            self.deliverable_root.clone(),
            self.mnt.clone(),
            self.report.clone(),
            self.harness_tmp.clone(),
        ]);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Clean0,
    Stage,
    Build,
    Compose,
    Execute,
    Collect,
    Clean1,
    Done,
    CleanErr,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Clean0 => "CLEAN0",
            JobState::Stage => "STAGE",
            JobState::Build => "BUILD",
            JobState::Compose => "COMPOSE",
            JobState::Execute => "EXECUTE",
            JobState::Collect => "COLLECT",
            JobState::Clean1 => "CLEAN1",
            JobState::Done => "DONE",
            JobState::CleanErr => "CLEAN_ERR",
            JobState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sequences stage, build, compose, execute and collect for one job, with
/// cleanup before and after.
pub struct JobLifecycle {
    stager: ArtifactStager,
    builder: Arc<dyn BuildEngine>,
    composer: Arc<dyn DiskComposer>,
    runner: Arc<dyn TestRunner>,
    host: Arc<dyn HostOps>,
}

impl JobLifecycle {
    pub fn new(
        stager: ArtifactStager,
        builder: Arc<dyn BuildEngine>,
        composer: Arc<dyn DiskComposer>,
        runner: Arc<dyn TestRunner>,
        host: Arc<dyn HostOps>,
    ) -> Self {
        Self {
            stager,
            builder,
            composer,
            runner,
            host,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let t = &config.timeouts;
        let store: Arc<dyn ArtifactStore> = match &config.store {
            StoreConfig::Gcloud { program } => {
                Arc::new(GcloudStore::new(program, TimeoutConfig::limit(t.fetch)))
            }
            StoreConfig::Local { root } => Arc::new(LocalStore::new(root)),
        };
        let stager = ArtifactStager::new(
            store,
            Arc::new(TarTool::new(TimeoutConfig::limit(t.extract))),
            config.image.clone(),
            config.retry.clone(),
        );
        let builder = Arc::new(DockerBuildEngine::new(
            &config.builder.program,
            &config.builder.image,
            TimeoutConfig::limit(t.build),
        ));
        let host: Arc<dyn HostOps> = Arc::new(SudoHost::new(
            config.host.privilege.clone(),
            TimeoutConfig::limit(t.compose_step),
            TimeoutConfig::limit(t.cleanup),
        ));
        let composer = Arc::new(ImageComposer::new(
            Arc::clone(&host),
            HostSemaphore::new(&config.host.loop_lock, config.host.loop_slots),
            ComposeOptions {
                resize: config.image.resize,
                target_size: parse_size(&config.image.target_size)?,
            },
        ));
        let vm = VmShape {
            sockets: config.harness.sockets,
            cores: config.harness.cores,
            ram: config.harness.ram.clone(),
            user: config.harness.user.clone(),
        };
        let runner = Arc::new(KirkRunner::new(
            &config.harness.program,
            &config.harness.framework,
            vm,
            TimeoutConfig::limit(t.execute),
        ));
        Ok(Self::new(stager, builder, composer, runner, host))
    }

    /// Runs the whole lifecycle. Either returns the harness report or the
    /// error of the first failing stage; cleanup has run in both cases.
    pub fn run(&self, job: &Job) -> std::result::Result<Report, JobError> {
        job.id.validate().map_err(JobError::Invalid)?;
        let span = info_span!("job", bug_id = %job.id.bug_id, tag = %job.id.tag);
        let _enter = span.enter();

        let paths = job.paths();
        ensure_dir(&paths.work_dir).map_err(|source| JobError::Setup {
            path: paths.work_dir.clone(),
            source,
        })?;
        let log = JobLog::open(&paths.log).map_err(|source| JobError::Setup {
            path: paths.log.clone(),
            source,
        })?;

        self.transition(&log, JobState::Clean0);
        if let Err(e) = self.clean(&paths, &log, JobState::Clean0) {
            return Err(self.fail(&log, e));
        }

        let outcome = self.pipeline(job, &paths, &log);
        let cleanup_state = if outcome.is_ok() {
            JobState::Clean1
        } else {
            JobState::CleanErr
        };
        self.transition(&log, cleanup_state);
        let cleaned = self.clean(&paths, &log, cleanup_state);

        match (outcome, cleaned) {
            (Ok(report), Ok(())) => {
                self.transition(&log, JobState::Done);
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(self.fail(&log, e)),
            (Err(e), cleaned) => {
                if let Err(cleanup_err) = cleaned {
                    warn!(error = %cleanup_err, "cleanup after failure also failed");
                    log.note(format_args!("cleanup failed: {}", AsChain(&cleanup_err)));
                }
                Err(self.fail(&log, e))
            }
        }
    }

    fn fail(&self, log: &JobLog, err: JobError) -> JobError {
        log.note(format_args!("{}", AsChain(&err)));
        self.transition(log, JobState::Failed);
        err
    }

    /// Removes every artifact path of the job. Absent paths are fine.
    pub fn clean(
        &self,
        paths: &JobPaths,
        log: &JobLog,
        state: JobState,
    ) -> std::result::Result<(), JobError> {
        self.host
            .remove_all(&paths.artifacts(), log)
            .map_err(|source| JobError::Cleanup {
                state,
                path: paths.work_dir.clone(),
                source,
            })
    }

    fn pipeline(
        &self,
        job: &Job,
        paths: &JobPaths,
        log: &JobLog,
    ) -> std::result::Result<Report, JobError> {
        self.transition(log, JobState::Stage);
        let staged = self.stager.stage(job, paths, log)?;

        self.transition(log, JobState::Build);
        let deliverable = self.builder.build(
            &staged.kcache.path,
            &paths.deliverable_root,
            &job.ltp.repo,
            &job.ltp.branch,
            log,
        )?;

        self.transition(log, JobState::Compose);
        self.composer.compose(
            &ComposeRequest {
                image: &staged.image.path,
                kernel: &staged.kernel.path,
                config: &staged.kernel_config.path,
                deliverable: &deliverable,
                mountpoint: &paths.mnt,
            },
            log,
        )?;

        self.transition(log, JobState::Execute);
        self.runner.execute(
            &ExecuteRequest {
                image: &staged.image.path,
                suites: &job.suites,
                report: &paths.report,
                tmp_dir: &paths.harness_tmp,
            },
            log,
        )?;

        self.transition(log, JobState::Collect);
        Ok(read_report(&paths.report)?)
    }

    fn transition(&self, log: &JobLog, state: JobState) {
        info!(state = %state, "job state");
        log.note(format_args!("state {}", state));
    }
}

/// Renders an error with its full source chain.
struct AsChain<'a>(&'a JobError);

impl fmt::Display for AsChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}
