use crate::config::ClusterConfig;
use crate::ensure_dir;
use crate::job::{Job, JobId, JobLifecycle, JobState, LtpSource};
use crate::process::JobLog;
use crate::scoreboard::{EntryStatus, Scoreboard, ScoreboardEntry};
use crate::store::Locator;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{error, info, warn};

/// One entry of the batch input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "bug-id")]
    pub bug_id: String,
    pub tag: String,
    #[serde(rename = "kgym-bucket-name")]
    pub bucket: String,
    #[serde(rename = "kgym-storage-prefix")]
    pub prefix: String,
}

impl JobSpec {
    pub fn id(&self) -> JobId {
        JobId::new(self.bug_id.clone(), self.tag.clone())
    }
}

pub fn load_batch(path: &Path) -> Result<Vec<JobSpec>> {
    let raw = fs::read(path).with_context(|| format!("failed to read batch {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid batch {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_parallel: usize,
    /// Skip jobs the scoreboard already records as successful.
    pub resume: bool,
    pub suites: Vec<String>,
    pub ltp: LtpSource,
    pub work_root: PathBuf,
}

impl BatchOptions {
    pub fn from_config(config: &ClusterConfig, resume: bool) -> Self {
        Self {
            max_parallel: config.max_parallel,
            resume,
            suites: config.suites.clone(),
            ltp: LtpSource {
                repo: config.ltp.repo.clone(),
                branch: config.ltp.branch.clone(),
            },
            work_root: config.work_root.clone(),
        }
    }

    pub fn scoreboard_path(&self) -> PathBuf {
        self.work_root.join("scoreboard.json")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub submitted: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub queued: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Finished jobs whose entry could not be persisted, even on retry.
    pub unrecorded: usize,
    pub scoreboard: PathBuf,
}

/// Runs a batch of jobs on a bounded pool of worker threads.
///
/// Workers only report completions; the calling thread owns the scoreboard
/// and is its sole writer.
///
/// Jobs share this process. Errors and panics stay inside their job, but an
/// abort, a stack overflow or the OOM killer ends the whole batch; entries
/// recorded before that survive and `--cont` picks up the rest.
pub struct ClusterScheduler {
    lifecycle: Arc<JobLifecycle>,
}

impl ClusterScheduler {
    pub fn new(lifecycle: Arc<JobLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub fn run_batch(&self, specs: Vec<JobSpec>, options: &BatchOptions) -> Result<BatchSummary> {
        ensure_dir(&options.work_root)
            .with_context(|| format!("failed to create {}", options.work_root.display()))?;
        let mut scoreboard = Scoreboard::open(&options.scoreboard_path())?;
        let mut summary = BatchSummary {
            submitted: specs.len(),
            scoreboard: scoreboard.path().to_path_buf(),
            ..BatchSummary::default()
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for spec in specs {
            let id = spec.id();
            if !seen.insert(id.clone()) {
                warn!(bug_id = %id.bug_id, tag = %id.tag, "duplicate job in batch, ignoring");
                summary.duplicates += 1;
                continue;
            }
            if options.resume && scoreboard.succeeded(&id) {
                info!(bug_id = %id.bug_id, tag = %id.tag, "already succeeded, skipping");
                summary.skipped += 1;
                continue;
            }
            queue.push_back(Job::new(
                id,
                Locator::new(spec.bucket, spec.prefix),
                options.suites.clone(),
                options.ltp.clone(),
                &options.work_root,
            ));
        }
        summary.queued = queue.len();
        let workers = options.max_parallel.max(1).min(queue.len());
        info!(
            queued = summary.queued,
            skipped = summary.skipped,
            workers,
            "batch starting"
        );

        let queue = Mutex::new(queue);
        let mut unrecorded = Vec::new();
        let (tx, rx) = mpsc::channel::<(JobId, ScoreboardEntry)>();
        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let lifecycle = self.lifecycle.as_ref();
                s.spawn(move || loop {
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some(job) = next else {
                        break;
                    };
                    let entry = execute_guarded(lifecycle, &job);
                    if tx.send((job.id, entry)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (id, entry) in rx {
                match entry.status {
                    EntryStatus::Success => summary.succeeded += 1,
                    _ => summary.failed += 1,
                }
                info!(
                    bug_id = %id.bug_id,
                    tag = %id.tag,
                    status = ?entry.status,
                    "job finished"
                );
                if let Err(err) = scoreboard.record(&id, entry.clone()) {
                    let detail = format!("{:#}", err);
                    warn!(
                        bug_id = %id.bug_id,
                        tag = %id.tag,
                        error = %detail,
                        "failed to persist scoreboard, will retry"
                    );
                    unrecorded.push((id, entry));
                }
            }
        });
        summary.unrecorded = retry_unrecorded(&mut scoreboard, unrecorded);

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            unrecorded = summary.unrecorded,
            "batch finished"
        );
        Ok(summary)
    }
}

/// Gives each entry the first persist dropped one more attempt and returns
/// how many are still missing from the scoreboard.
fn retry_unrecorded(
    scoreboard: &mut Scoreboard,
    pending: Vec<(JobId, ScoreboardEntry)>,
) -> usize {
    let mut lost = 0;
    for (id, entry) in pending {
        if let Err(err) = scoreboard.record(&id, entry) {
            let detail = format!("{:#}", err);
            error!(bug_id = %id.bug_id, tag = %id.tag, error = %detail, "scoreboard entry lost");
            lost += 1;
        }
    }
    lost
}

/// Runs one job and turns every outcome, panics included, into an entry.
fn execute_guarded(lifecycle: &JobLifecycle, job: &Job) -> ScoreboardEntry {
    match panic::catch_unwind(AssertUnwindSafe(|| lifecycle.run(job))) {
        Ok(Ok(report)) => ScoreboardEntry::success(report),
        Ok(Err(err)) => {
            let context = format!(
                "job {} failed in {} (log: {})",
                job.id,
                err.state(),
                job.paths().log.display()
            );
            ScoreboardEntry::exception(format!("{:?}", anyhow::Error::new(err).context(context)))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(bug_id = %job.id.bug_id, tag = %job.id.tag, panic = %message, "job panicked");
            if job.id.validate().is_ok() {
                let paths = job.paths();
                if let Ok(log) = JobLog::open(&paths.log) {
                    log.note(format_args!("panic: {}", message));
                    if let Err(err) = lifecycle.clean(&paths, &log, JobState::CleanErr) {
                        warn!(bug_id = %job.id.bug_id, error = %err, "cleanup after panic failed");
                    }
                }
            }
            ScoreboardEntry::exception(format!("job {} panicked: {}", job.id, message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
