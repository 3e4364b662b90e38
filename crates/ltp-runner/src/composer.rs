use crate::error::{ComposeError, ComposeStep};
use crate::host::{partition_of, HostOps};
use crate::lock::HostSemaphore;
use crate::process::JobLog;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const INPUTRC_LINE: &str = "set enable-bracketed-paste off";

#[derive(Debug, Clone, Copy)]
pub struct ComposeRequest<'a> {
    pub image: &'a Path,
    pub kernel: &'a Path,
    pub config: &'a Path,
    pub deliverable: &'a Path,
    pub mountpoint: &'a Path,
}

pub trait DiskComposer: Send + Sync {
    /// Injects kernel, config and test suite into the image in place. Any
    /// loop device or mount taken here is released before returning.
    fn compose(&self, req: &ComposeRequest<'_>, log: &JobLog) -> Result<(), ComposeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeOptions {
    pub resize: bool,
    /// Bytes; only consulted when `resize` is set.
    pub target_size: u64,
}

pub struct ImageComposer {
    host: Arc<dyn HostOps>,
    semaphore: HostSemaphore,
    options: ComposeOptions,
}

impl ImageComposer {
    pub fn new(host: Arc<dyn HostOps>, semaphore: HostSemaphore, options: ComposeOptions) -> Self {
        Self {
            host,
            semaphore,
            options,
        }
    }
}

/// Grows the sparse image file, never shrinking it.
fn grow_image(image: &Path, target: u64) -> Result<(), ComposeError> {
    let io = |e| ComposeError::io(ComposeStep::GrowImage, e);
    let file = OpenOptions::new().write(true).open(image).map_err(io)?;
    let current = file.metadata().map_err(io)?.len();
    if current < target {
        file.set_len(target).map_err(io)?;
    }
    Ok(())
}

impl DiskComposer for ImageComposer {
    fn compose(&self, req: &ComposeRequest<'_>, log: &JobLog) -> Result<(), ComposeError> {
        if self.options.resize {
            grow_image(req.image, self.options.target_size)?;
        }

        let permit = self
            .semaphore
            .acquire()
            .map_err(|e| ComposeError::io(ComposeStep::Losetup, e))?;
        debug!(slot = permit.slot(), "holding loop-device slot");

        let device = LoopDevice::attach(self.host.as_ref(), req.image, log)?;
        let partition = partition_of(device.path(), 1);
        if self.options.resize {
            self.host.grow_partition(device.path(), log)?;
            self.host.check_filesystem(&partition, log)?;
            self.host.resize_filesystem(&partition, log)?;
        }

        self.host.make_dir(req.mountpoint, log)?;
        let mount = Mount::mount(self.host.as_ref(), &partition, req.mountpoint, log)?;
        let root = req.mountpoint;
        self.host.copy(
            req.config,
            &root.join("boot").join("kernel.config"),
            false,
            ComposeStep::CopyConfig,
            log,
        )?;
        self.host
            .copy(req.kernel, &root.join("vmlinuz"), false, ComposeStep::CopyKernel, log)?;
        self.host.copy(
            req.deliverable,
            &root.join("opt").join("ltp"),
            true,
            ComposeStep::CopyDeliverable,
            log,
        )?;
        self.host
            .append_line(&root.join("etc").join("inputrc"), INPUTRC_LINE, log)?;

        mount.release()?;
        device.release()
    }
}

/// Attached loop device; detached on release or drop.
struct LoopDevice<'a> {
    host: &'a dyn HostOps,
    path: PathBuf,
    log: &'a JobLog,
    done: bool,
}

impl<'a> LoopDevice<'a> {
    fn attach(host: &'a dyn HostOps, image: &Path, log: &'a JobLog) -> Result<Self, ComposeError> {
        let path = host.attach_loop(image, log)?;
        Ok(Self {
            host,
            path,
            log,
            done: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn detach(&self) -> Result<(), ComposeError> {
        match self.host.detach_loop(&self.path, self.log) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(device = %self.path.display(), error = %first, "loop detach failed, retrying");
                match self.host.detach_loop(&self.path, self.log) {
                    Ok(()) => Err(first),
                    Err(second) => {
                        warn!(device = %self.path.display(), error = %second, "loop device leaked");
                        Err(first)
                    }
                }
            }
        }
    }

    fn release(mut self) -> Result<(), ComposeError> {
        self.done = true;
        self.detach()
    }
}

impl Drop for LoopDevice<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.detach();
        }
    }
}

/// Mounted partition; unmounted on release or drop, falling back to a lazy
/// unmount so the mountpoint never outlives the compose call.
struct Mount<'a> {
    host: &'a dyn HostOps,
    mountpoint: PathBuf,
    log: &'a JobLog,
    done: bool,
}

impl<'a> Mount<'a> {
    fn mount(
        host: &'a dyn HostOps,
        partition: &Path,
        mountpoint: &Path,
        log: &'a JobLog,
    ) -> Result<Self, ComposeError> {
        host.mount(partition, mountpoint, log)?;
        Ok(Self {
            host,
            mountpoint: mountpoint.to_path_buf(),
            log,
            done: false,
        })
    }

    fn unmount(&self) -> Result<(), ComposeError> {
        let err = match self.host.unmount(&self.mountpoint, false, self.log) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(mountpoint = %self.mountpoint.display(), error = %err, "umount failed, detaching lazily");
        if let Err(lazy) = self.host.unmount(&self.mountpoint, true, self.log) {
            warn!(mountpoint = %self.mountpoint.display(), error = %lazy, "lazy umount failed");
        }
        Err(err)
    }

    fn release(mut self) -> Result<(), ComposeError> {
        self.done = true;
        self.unmount()
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.unmount();
        }
    }
}
