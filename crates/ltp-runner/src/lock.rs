use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive `flock` held for the lifetime of the value.
///
/// Locks are per open file description, so two handles in one process
/// exclude each other just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        flock(&file, libc::LOCK_EX)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(libc::EWOULDBLOCK) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Host-wide counting semaphore built from `slots` lock files.
///
/// Guards the loop-device critical section; with one slot it is a mutex
/// shared by every worker thread and every process on the host.
#[derive(Debug, Clone)]
pub struct HostSemaphore {
    base: PathBuf,
    slots: usize,
}

#[derive(Debug)]
pub struct SemaphorePermit {
    _lock: FileLock,
    slot: usize,
}

impl SemaphorePermit {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl HostSemaphore {
    pub fn new(base: impl Into<PathBuf>, slots: usize) -> Self {
        Self {
            base: base.into(),
            slots: slots.max(1),
        }
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        let name = self
            .base
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "loop.lock".to_string());
        self.base.with_file_name(format!("{}.{}", name, slot))
    }

    pub fn try_acquire(&self) -> io::Result<Option<SemaphorePermit>> {
        for slot in 0..self.slots {
            if let Some(lock) = FileLock::try_acquire(&self.slot_path(slot))? {
                return Ok(Some(SemaphorePermit { _lock: lock, slot }));
            }
        }
        Ok(None)
    }

    pub fn acquire(&self) -> io::Result<SemaphorePermit> {
        let started = Instant::now();
        loop {
            if let Some(permit) = self.try_acquire()? {
                if started.elapsed() > RETRY_INTERVAL {
                    debug!(
                        slot = permit.slot,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "acquired host loop-device slot"
                    );
                }
                return Ok(permit);
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn file_lock_is_exclusive_within_one_process() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("scoreboard.json.lock");
        let first = FileLock::acquire(&path).expect("first lock");
        assert!(FileLock::try_acquire(&path).expect("try").is_none());
        drop(first);
        assert!(FileLock::try_acquire(&path).expect("try").is_some());
    }

    #[test]
    fn semaphore_hands_out_at_most_slots_permits() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sem = HostSemaphore::new(dir.path().join("loop.lock"), 2);
        let a = sem.try_acquire().expect("try").expect("slot a");
        let b = sem.try_acquire().expect("try").expect("slot b");
        assert_ne!(a.slot(), b.slot());
        assert!(sem.try_acquire().expect("try").is_none());
        drop(a);
        assert!(sem.try_acquire().expect("try").is_some());
        drop(b);
    }

    #[test]
    fn single_slot_serializes_threads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sem = HostSemaphore::new(dir.path().join("loop.lock"), 1);
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        thread::scope(|s| {
            for _ in 0..6 {
                let sem = sem.clone();
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                s.spawn(move || {
                    let _permit = sem.acquire().expect("acquire");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
