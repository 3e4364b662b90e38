use crate::job::JobState;
use crate::process::Termination;
use crate::store::StoreError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to fetch {artifact} from {locator}")]
    Fetch {
        artifact: &'static str,
        locator: String,
        #[source]
        error: StoreError,
    },
    #[error("failed to extract {artifact}: {termination}")]
    Extract {
        artifact: &'static str,
        termination: Termination,
    },
    #[error("failed to place base image at {path}: {termination}")]
    Image {
        path: PathBuf,
        termination: Termination,
    },
    #[error("{artifact} archive extracted to nothing")]
    EmptyArchive { artifact: &'static str },
    #[error("image tarball did not contain {expected}")]
    MissingImage { expected: PathBuf },
    #[error("staging i/o on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build environment failed: {0}")]
    Failed(Termination),
    #[error("failed to launch build environment")]
    Launch(#[source] io::Error),
    #[error("failed to prepare build output {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Privileged sub-steps of image composition, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComposeStep {
    GrowImage,
    Losetup,
    Growpart,
    E2fsck,
    Resize2fs,
    Mkdir,
    Mount,
    CopyConfig,
    CopyKernel,
    CopyDeliverable,
    Inputrc,
    Umount,
    Detach,
}

impl ComposeStep {
    pub const ALL: [ComposeStep; 13] = [
        ComposeStep::GrowImage,
        ComposeStep::Losetup,
        ComposeStep::Growpart,
        ComposeStep::E2fsck,
        ComposeStep::Resize2fs,
        ComposeStep::Mkdir,
        ComposeStep::Mount,
        ComposeStep::CopyConfig,
        ComposeStep::CopyKernel,
        ComposeStep::CopyDeliverable,
        ComposeStep::Inputrc,
        ComposeStep::Umount,
        ComposeStep::Detach,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeStep::GrowImage => "grow-image",
            ComposeStep::Losetup => "losetup",
            ComposeStep::Growpart => "growpart",
            ComposeStep::E2fsck => "e2fsck",
            ComposeStep::Resize2fs => "resize2fs",
            ComposeStep::Mkdir => "mkdir",
            ComposeStep::Mount => "mount",
            ComposeStep::CopyConfig => "cp kernel.config",
            ComposeStep::CopyKernel => "cp vmlinuz",
            ComposeStep::CopyDeliverable => "cp ltp",
            ComposeStep::Inputrc => "inputrc",
            ComposeStep::Umount => "umount",
            ComposeStep::Detach => "losetup -d",
        }
    }
}

impl fmt::Display for ComposeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("{0}")]
    Exit(Termination),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Output(String),
}

#[derive(Debug, Error)]
#[error("compose step `{step}` failed: {failure}")]
pub struct ComposeError {
    pub step: ComposeStep,
    pub failure: StepFailure,
}

impl ComposeError {
    pub fn exit(step: ComposeStep, termination: Termination) -> Self {
        Self {
            step,
            failure: StepFailure::Exit(termination),
        }
    }

    pub fn io(step: ComposeStep, err: io::Error) -> Self {
        Self {
            step,
            failure: StepFailure::Io(err),
        }
    }

    pub fn output(step: ComposeStep, msg: impl Into<String>) -> Self {
        Self {
            step,
            failure: StepFailure::Output(msg.into()),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.failure {
            StepFailure::Exit(t) => t.code(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("test harness failed: {0}")]
    Failed(Termination),
    #[error("failed to launch test harness")]
    Launch(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report not found at {path}")]
    Missing { path: PathBuf },
    #[error("failed to read report {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed report {path}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("report {path} is not a JSON object")]
    NotAnObject { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("staging failed")]
    Staging(#[from] StagingError),
    #[error("build failed")]
    Build(#[from] BuildError),
    #[error("image composition failed")]
    Compose(#[from] ComposeError),
    #[error("test execution failed")]
    Execution(#[from] ExecutionError),
    #[error("report collection failed")]
    Report(#[from] ReportError),
    #[error("failed to prepare work directory {path}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cleanup of {path} failed in {state}")]
    Cleanup {
        state: JobState,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid job: {0}")]
    Invalid(String),
}

impl JobError {
    /// Lifecycle state the job was in when the error surfaced.
    pub fn state(&self) -> JobState {
        match self {
            JobError::Staging(_) => JobState::Stage,
            JobError::Build(_) => JobState::Build,
            JobError::Compose(_) => JobState::Compose,
            JobError::Execution(_) => JobState::Execute,
            JobError::Report(_) => JobState::Collect,
            JobError::Setup { .. } | JobError::Invalid(_) => JobState::Clean0,
            JobError::Cleanup { state, .. } => *state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_error_names_step_and_exit_code() {
        let err = ComposeError::exit(ComposeStep::Mount, Termination::Exited(32));
        assert_eq!(err.exit_code(), Some(32));
        let msg = err.to_string();
        assert!(msg.contains("`mount`"), "unexpected message: {}", msg);
        assert!(msg.contains("32"), "unexpected message: {}", msg);
    }

    #[test]
    fn job_error_chain_keeps_inner_detail() {
        let err = JobError::from(ExecutionError::Failed(Termination::Exited(2)));
        assert_eq!(err.state(), JobState::Execute);
        let rendered = format!("{:#}", anyhow::Error::new(err));
        assert!(rendered.contains("test execution failed"), "{}", rendered);
        assert!(rendered.contains("exit code 2"), "{}", rendered);
    }

    #[test]
    fn compose_steps_have_distinct_names() {
        let mut names: Vec<_> = ComposeStep::ALL.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ComposeStep::ALL.len());
    }
}
