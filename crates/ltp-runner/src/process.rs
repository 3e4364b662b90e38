//! External process supervision.
//!
//! Every tool the pipeline drives (downloads, tar, docker, losetup, mount,
//! the test harness) goes through here so that its output lands in the job
//! log and its wait is bounded by a deadline.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TREE_SCAN_ROUNDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut(Duration),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Termination::Exited(c) => Some(*c),
            _ => None,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Termination::Exited(code)
        } else if let Some(sig) = status.signal() {
            Termination::Signaled(sig)
        } else {
            Termination::Exited(-1)
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {}", code),
            Termination::Signaled(sig) => write!(f, "killed by signal {}", sig),
            Termination::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
        }
    }
}

/// Append-only sink for everything a job's external processes print.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JobLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stdio(&self) -> io::Result<Stdio> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Stdio::from(file.try_clone()?))
    }

    pub fn note(&self, line: impl fmt::Display) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), line);
    }
}

pub fn run_logged(
    cmd: &mut Command,
    log: &JobLog,
    timeout: Option<Duration>,
) -> io::Result<Termination> {
    supervise(cmd, log, timeout, None, false).map(|(t, _)| t)
}

/// Like [`run_logged`] but returns stdout instead of sending it to the log.
pub fn run_captured(
    cmd: &mut Command,
    log: &JobLog,
    timeout: Option<Duration>,
) -> io::Result<(Termination, String)> {
    supervise(cmd, log, timeout, None, true)
}

pub fn run_with_input(
    cmd: &mut Command,
    input: &[u8],
    log: &JobLog,
    timeout: Option<Duration>,
) -> io::Result<Termination> {
    supervise(cmd, log, timeout, Some(input), false).map(|(t, _)| t)
}

fn supervise(
    cmd: &mut Command,
    log: &JobLog,
    timeout: Option<Duration>,
    input: Option<&[u8]>,
    capture: bool,
) -> io::Result<(Termination, String)> {
    log.note(format_args!("$ {}", describe(cmd)));
    cmd.process_group(0);
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(if capture { Stdio::piped() } else { log.stdio()? });
    cmd.stderr(log.stdio()?);

    let mut child = cmd.spawn()?;
    if let Some(bytes) = input {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(bytes) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            }
        }
    }
    let reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = out.read_to_string(&mut buf);
            buf
        })
    });

    let termination = wait_with_deadline(&mut child, timeout)?;
    let captured = reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    if !termination.success() {
        log.note(format_args!("{} ended with {}", program_name(cmd), termination));
    }
    Ok((termination, captured))
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> io::Result<Termination> {
    let Some(limit) = timeout else {
        return child.wait().map(Termination::from_status);
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Termination::from_status(status));
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(pid = child.id(), "process exceeded {}s, killing its tree", limit.as_secs());
            terminate_tree(child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Termination::TimedOut(limit));
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Force-kills `root` together with every descendant found in `/proc`,
/// including ones that left its process group or session.
///
/// Everything is stopped before the scan so nothing can fork out from under
/// it. Processes owned by another user (a command behind `sudo`) ignore the
/// signals; those are bounded on their own side of the privilege boundary.
fn terminate_tree(root: u32) {
    let group = -(root as libc::pid_t);
    signal(group, libc::SIGSTOP);
    let mut seen = BTreeSet::from([root]);
    for _ in 0..TREE_SCAN_ROUNDS {
        let fresh: Vec<u32> = descendants(root, Path::new("/proc"))
            .into_iter()
            .filter(|pid| seen.insert(*pid))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for pid in fresh {
            signal(pid as libc::pid_t, libc::SIGSTOP);
        }
    }
    signal(group, libc::SIGKILL);
    for pid in seen {
        signal(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn signal(target: libc::pid_t, sig: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions. A negative target
    // addresses the group the child leads, since it was spawned with
    // process_group(0).
    #[allow(unsafe_code)]
    unsafe {
        libc::kill(target, sig);
    }
}

/// Every live descendant of `root`, from the `PPid` lines under `proc_root`.
fn descendants(root: u32, proc_root: &Path) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Some(ppid) = read_ppid(&entry.path().join("status")) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for &pid in children.get(&current).map(Vec::as_slice).unwrap_or_default() {
            if pid != root && !out.contains(&pid) {
                out.push(pid);
                queue.push_back(pid);
            }
        }
    }
    out
}

fn read_ppid(status: &Path) -> Option<u32> {
    let content = fs::read_to_string(status).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().to_string()
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![program_name(cmd)];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}
