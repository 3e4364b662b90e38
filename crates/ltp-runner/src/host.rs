//! Privileged host operations used while composing a disk image.
//!
//! Everything that needs root (loop devices, mounts, writes into the
//! mounted guest filesystem, removal of root-owned build output) goes
//! through [`HostOps`], so the composer's acquire/release discipline can be
//! exercised against an in-memory double.

use crate::error::{ComposeError, ComposeStep};
use crate::process::{run_captured, run_logged, run_with_input, JobLog, Termination};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const NODE_WAIT: Duration = Duration::from_secs(5);
const NODE_POLL: Duration = Duration::from_millis(100);

pub trait HostOps: Send + Sync {
    /// Binds `image` to the next free loop device with partition scanning
    /// and returns the device path.
    fn attach_loop(&self, image: &Path, log: &JobLog) -> Result<PathBuf, ComposeError>;
    fn detach_loop(&self, device: &Path, log: &JobLog) -> Result<(), ComposeError>;
    fn grow_partition(&self, device: &Path, log: &JobLog) -> Result<(), ComposeError>;
    fn check_filesystem(&self, partition: &Path, log: &JobLog) -> Result<(), ComposeError>;
    fn resize_filesystem(&self, partition: &Path, log: &JobLog) -> Result<(), ComposeError>;
    fn make_dir(&self, dir: &Path, log: &JobLog) -> Result<(), ComposeError>;
    fn mount(&self, partition: &Path, mountpoint: &Path, log: &JobLog)
        -> Result<(), ComposeError>;
    /// `lazy` detaches the mount from the namespace even while busy.
    fn unmount(&self, mountpoint: &Path, lazy: bool, log: &JobLog) -> Result<(), ComposeError>;
    fn copy(
        &self,
        src: &Path,
        dst: &Path,
        recursive: bool,
        step: ComposeStep,
        log: &JobLog,
    ) -> Result<(), ComposeError>;
    fn append_line(&self, file: &Path, line: &str, log: &JobLog) -> Result<(), ComposeError>;
    /// Recursively removes every path; missing paths are not an error.
    fn remove_all(&self, paths: &[PathBuf], log: &JobLog) -> io::Result<()>;
}

/// Device node of partition `n` on a partition-scanned loop device.
pub fn partition_of(device: &Path, n: u32) -> PathBuf {
    PathBuf::from(format!("{}p{}", device.display(), n))
}

/// Runs host tools behind a privilege prefix such as `sudo`.
///
/// A privileged tool runs as another user, so a deadline kill sent from this
/// process cannot reach it. When a prefix is set, each bounded tool is
/// therefore wrapped in `timeout -k` on the far side of the prefix, and the
/// local deadline only backs that up.
#[derive(Debug, Clone)]
pub struct SudoHost {
    privilege: Vec<String>,
    step_timeout: Option<Duration>,
    cleanup_timeout: Option<Duration>,
}

impl SudoHost {
    pub fn new(
        privilege: Vec<String>,
        step_timeout: Option<Duration>,
        cleanup_timeout: Option<Duration>,
    ) -> Self {
        Self {
            privilege,
            step_timeout,
            cleanup_timeout,
        }
    }

    fn command(&self, program: &str, limit: Option<Duration>) -> Command {
        let Some((prefix, rest)) = self.privilege.split_first() else {
            return Command::new(program);
        };
        let mut cmd = Command::new(prefix);
        cmd.args(rest);
        if let Some(limit) = limit {
            cmd.arg("timeout")
                .arg("-k")
                .arg(seconds(KILL_AFTER))
                .arg(seconds(limit));
        }
        cmd.arg(program);
        cmd
    }

    /// Local deadline for a command built by [`Self::command`].
    fn wait_limit(&self, limit: Option<Duration>) -> Option<Duration> {
        if self.privilege.is_empty() {
            limit
        } else {
            limit.map(|l| l + KILL_AFTER + KILL_AFTER)
        }
    }

    /// Maps the exit statuses of a fired inner `timeout` back to a timeout.
    fn settle(&self, termination: Termination, limit: Option<Duration>) -> Termination {
        match (termination, limit) {
            (Termination::Exited(TIMEOUT_EXIT | TIMEOUT_KILLED_EXIT), Some(limit))
                if !self.privilege.is_empty() =>
            {
                Termination::TimedOut(limit)
            }
            (other, _) => other,
        }
    }

    fn step(
        &self,
        step: ComposeStep,
        program: &str,
        args: &[&OsStr],
        log: &JobLog,
    ) -> Result<(), ComposeError> {
        let limit = self.step_timeout;
        let mut cmd = self.command(program, limit);
        cmd.args(args);
        let termination = run_logged(&mut cmd, log, self.wait_limit(limit))
            .map_err(|e| ComposeError::io(step, e))?;
        expect_success(step, self.settle(termination, limit))
    }
}

/// Grace period between the inner `timeout`'s TERM and its KILL.
const KILL_AFTER: Duration = Duration::from_secs(5);
/// `timeout` exit status when the limit fired.
const TIMEOUT_EXIT: i32 = 124;
/// `timeout` exit status when it also had to send KILL (128 + 9).
const TIMEOUT_KILLED_EXIT: i32 = 137;

fn seconds(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{}", d.as_secs_f64())
    }
}

fn expect_success(step: ComposeStep, termination: Termination) -> Result<(), ComposeError> {
    if termination.success() {
        Ok(())
    } else {
        Err(ComposeError::exit(step, termination))
    }
}

fn wait_for_node(node: &Path) -> bool {
    let deadline = Instant::now() + NODE_WAIT;
    while !node.exists() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(NODE_POLL);
    }
    true
}

impl HostOps for SudoHost {
    fn attach_loop(&self, image: &Path, log: &JobLog) -> Result<PathBuf, ComposeError> {
        let limit = self.step_timeout;
        let mut cmd = self.command("losetup", limit);
        cmd.args(["-fP", "--show"]).arg(image);
        let (termination, stdout) = run_captured(&mut cmd, log, self.wait_limit(limit))
            .map_err(|e| ComposeError::io(ComposeStep::Losetup, e))?;
        expect_success(ComposeStep::Losetup, self.settle(termination, limit))?;
        let device = stdout.trim();
        if device.is_empty() {
            return Err(ComposeError::output(
                ComposeStep::Losetup,
                "losetup did not report a device",
            ));
        }
        log.note(format_args!("attached {} to {}", image.display(), device));
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path, log: &JobLog) -> Result<(), ComposeError> {
        self.step(
            ComposeStep::Detach,
            "losetup",
            &[OsStr::new("-d"), device.as_os_str()],
            log,
        )
    }

    fn grow_partition(&self, device: &Path, log: &JobLog) -> Result<(), ComposeError> {
        self.step(
            ComposeStep::Growpart,
            "growpart",
            &[device.as_os_str(), OsStr::new("1")],
            log,
        )
    }

    fn check_filesystem(&self, partition: &Path, log: &JobLog) -> Result<(), ComposeError> {
        let limit = self.step_timeout;
        let mut cmd = self.command("e2fsck", limit);
        cmd.args(["-f", "-y"]).arg(partition);
        let termination = run_logged(&mut cmd, log, self.wait_limit(limit))
            .map_err(|e| ComposeError::io(ComposeStep::E2fsck, e))?;
        // 1 means errors were found and corrected
        match self.settle(termination, limit) {
            Termination::Exited(0) | Termination::Exited(1) => Ok(()),
            other => Err(ComposeError::exit(ComposeStep::E2fsck, other)),
        }
    }

    fn resize_filesystem(&self, partition: &Path, log: &JobLog) -> Result<(), ComposeError> {
        self.step(
            ComposeStep::Resize2fs,
            "resize2fs",
            &[partition.as_os_str()],
            log,
        )
    }

    fn make_dir(&self, dir: &Path, _log: &JobLog) -> Result<(), ComposeError> {
        fs::create_dir_all(dir).map_err(|e| ComposeError::io(ComposeStep::Mkdir, e))
    }

    fn mount(
        &self,
        partition: &Path,
        mountpoint: &Path,
        log: &JobLog,
    ) -> Result<(), ComposeError> {
        if !wait_for_node(partition) {
            debug!(partition = %partition.display(), "partition node still missing, mounting anyway");
            log.note(format_args!("{} did not appear in time", partition.display()));
        }
        self.step(
            ComposeStep::Mount,
            "mount",
            &[partition.as_os_str(), mountpoint.as_os_str()],
            log,
        )
    }

    fn unmount(&self, mountpoint: &Path, lazy: bool, log: &JobLog) -> Result<(), ComposeError> {
        let mut args = Vec::new();
        if lazy {
            args.push(OsStr::new("-l"));
        }
        args.push(mountpoint.as_os_str());
        self.step(ComposeStep::Umount, "umount", &args, log)
    }

    fn copy(
        &self,
        src: &Path,
        dst: &Path,
        recursive: bool,
        step: ComposeStep,
        log: &JobLog,
    ) -> Result<(), ComposeError> {
        let mut args = Vec::new();
        if recursive {
            // -T copies the tree's contents onto dst instead of nesting it
            args.extend([OsStr::new("-r"), OsStr::new("-T")]);
        }
        args.extend([src.as_os_str(), dst.as_os_str()]);
        self.step(step, "cp", &args, log)
    }

    fn append_line(&self, file: &Path, line: &str, log: &JobLog) -> Result<(), ComposeError> {
        let limit = self.step_timeout;
        let mut cmd = self.command("tee", limit);
        cmd.arg("-a").arg(file);
        let input = format!("{}\n", line);
        let termination = run_with_input(&mut cmd, input.as_bytes(), log, self.wait_limit(limit))
            .map_err(|e| ComposeError::io(ComposeStep::Inputrc, e))?;
        expect_success(ComposeStep::Inputrc, self.settle(termination, limit))
    }

    fn remove_all(&self, paths: &[PathBuf], log: &JobLog) -> io::Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let limit = self.cleanup_timeout;
        let mut cmd = self.command("rm", limit);
        cmd.args(["-rf", "--one-file-system", "--"]).args(paths);
        let termination = run_logged(&mut cmd, log, self.wait_limit(limit))?;
        match self.settle(termination, limit) {
            t if t.success() => Ok(()),
            t => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("rm ended with {}", t),
            )),
        }
    }
}
