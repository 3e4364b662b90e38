use crate::error::{ExecutionError, ReportError};
use crate::process::{run_logged, JobLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Structured result written by the test harness, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report(Value);

impl Report {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl TryFrom<Value> for Report {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if value.is_object() {
            Ok(Report(value))
        } else {
            Err(value)
        }
    }
}

pub fn read_report(path: &Path) -> Result<Report, ReportError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ReportError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ReportError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_slice(&bytes).map_err(|source| ReportError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    Report::try_from(value).map_err(|_| ReportError::NotAnObject {
        path: path.to_path_buf(),
    })
}

/// Guest shape handed to the harness' qemu backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmShape {
    pub sockets: u32,
    pub cores: u32,
    pub ram: String,
    pub user: String,
}

impl Default for VmShape {
    fn default() -> Self {
        Self {
            sockets: 2,
            cores: 1,
            ram: "8G".to_string(),
            user: "root".to_string(),
        }
    }
}

impl VmShape {
    pub fn sut_descriptor(&self, image: &Path) -> String {
        format!(
            "qemu:image={}:user={}:smp={},sockets={},cores={}:ram={}",
            image.display(),
            self.user,
            self.sockets * self.cores,
            self.sockets,
            self.cores,
            self.ram
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteRequest<'a> {
    pub image: &'a Path,
    pub suites: &'a [String],
    pub report: &'a Path,
    pub tmp_dir: &'a Path,
}

pub trait TestRunner: Send + Sync {
    /// Boots the composed image and runs the suites; the report is written
    /// to `req.report` by the harness itself.
    fn execute(&self, req: &ExecuteRequest<'_>, log: &JobLog) -> Result<(), ExecutionError>;
}

/// Drives the kirk harness with a qemu SUT.
#[derive(Debug, Clone)]
pub struct KirkRunner {
    program: PathBuf,
    framework: String,
    vm: VmShape,
    timeout: Option<Duration>,
}

impl KirkRunner {
    pub fn new(
        program: impl Into<PathBuf>,
        framework: impl Into<String>,
        vm: VmShape,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            program: program.into(),
            framework: framework.into(),
            vm,
            timeout,
        }
    }

    fn command(&self, req: &ExecuteRequest<'_>) -> Command {
        let image = fs::canonicalize(req.image).unwrap_or_else(|_| req.image.to_path_buf());
        let mut cmd = Command::new(&self.program);
        cmd.arg("--framework")
            .arg(&self.framework)
            .arg("--sut")
            .arg(self.vm.sut_descriptor(&image))
            .arg("--run-suite")
            .args(req.suites)
            .arg("--json-report")
            .arg(req.report)
            .arg("--tmp-dir")
            .arg(req.tmp_dir);
        cmd
    }
}

impl TestRunner for KirkRunner {
    fn execute(&self, req: &ExecuteRequest<'_>, log: &JobLog) -> Result<(), ExecutionError> {
        fs::create_dir_all(req.tmp_dir).map_err(ExecutionError::Launch)?;
        let mut cmd = self.command(req);
        let termination =
            run_logged(&mut cmd, log, self.timeout).map_err(ExecutionError::Launch)?;
        if termination.success() {
            Ok(())
        } else {
            Err(ExecutionError::Failed(termination))
        }
    }
}
