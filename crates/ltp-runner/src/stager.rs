use crate::config::{ImageConfig, ImageSourceFormat, RetryConfig};
use crate::error::StagingError;
use crate::job::{Job, JobPaths};
use crate::process::{run_logged, JobLog, Termination};
use crate::store::{ArtifactStore, StoreError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

const KCACHE_OBJECT: &str = "kcache.tar.zstd";
const KERNEL_OBJECT: &str = "kernel";
const CONFIG_OBJECT: &str = "kernel.config";
const DISK_MEMBER: &str = "disk.raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Kcache,
    Kernel,
    KernelConfig,
    VmImage,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Kcache => "kcache",
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::KernelConfig => "kernel.config",
            ArtifactKind::VmImage => "vm image",
        }
    }
}

/// A staged input: present and fully extracted at `path`.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub kind: ArtifactKind,
    pub source: String,
    pub path: PathBuf,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StagedArtifacts {
    pub kcache: StagedArtifact,
    pub kernel: StagedArtifact,
    pub kernel_config: StagedArtifact,
    pub image: StagedArtifact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zstd decompressed on all cores.
    ZstdMt,
    Gzip,
}

pub trait ArchiveTool: Send + Sync {
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        compression: Compression,
        log: &JobLog,
    ) -> io::Result<Termination>;

    /// Copies a raw disk image, keeping holes sparse.
    fn clone_image(&self, src: &Path, dest: &Path, log: &JobLog) -> io::Result<Termination>;
}

#[derive(Debug, Clone)]
pub struct TarTool {
    timeout: Option<Duration>,
}

impl TarTool {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ArchiveTool for TarTool {
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        compression: Compression,
        log: &JobLog,
    ) -> io::Result<Termination> {
        let mut cmd = Command::new("tar");
        match compression {
            Compression::ZstdMt => cmd.args(["-x", "--use-compress-program=zstdmt", "-f"]),
            Compression::Gzip => cmd.args(["-x", "-z", "-f"]),
        };
        cmd.arg(archive).arg("-C").arg(dest);
        run_logged(&mut cmd, log, self.timeout)
    }

    fn clone_image(&self, src: &Path, dest: &Path, log: &JobLog) -> io::Result<Termination> {
        let mut cmd = Command::new("cp");
        cmd.arg("--sparse=always").arg(src).arg(dest);
        run_logged(&mut cmd, log, self.timeout)
    }
}

/// Sibling path a download is written to before it is renamed into place.
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub struct ArtifactStager {
    store: Arc<dyn ArtifactStore>,
    archive: Arc<dyn ArchiveTool>,
    image: ImageConfig,
    retry: RetryConfig,
}

impl ArtifactStager {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        archive: Arc<dyn ArchiveTool>,
        image: ImageConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            archive,
            image,
            retry,
        }
    }

    pub fn stage(
        &self,
        job: &Job,
        paths: &JobPaths,
        log: &JobLog,
    ) -> Result<StagedArtifacts, StagingError> {
        let kcache = self.stage_kcache(job, paths, log)?;
        let kernel_config = self.fetch_verified(
            job,
            ArtifactKind::KernelConfig,
            CONFIG_OBJECT,
            &paths.kernel_config,
            log,
        )?;
        let kernel =
            self.fetch_verified(job, ArtifactKind::Kernel, KERNEL_OBJECT, &paths.kernel, log)?;
        let image = self.stage_image(job, paths, log)?;
        Ok(StagedArtifacts {
            kcache,
            kernel,
            kernel_config,
            image,
        })
    }

    fn stage_kcache(
        &self,
        job: &Job,
        paths: &JobPaths,
        log: &JobLog,
    ) -> Result<StagedArtifact, StagingError> {
        let kind = ArtifactKind::Kcache;
        self.fetch(job, kind, KCACHE_OBJECT, &paths.kcache_archive, log)?;
        create_dir(&paths.kcache)?;
        let termination = self
            .archive
            .extract(&paths.kcache_archive, &paths.kcache, Compression::ZstdMt, log)
            .map_err(|source| StagingError::Io {
                path: paths.kcache_archive.clone(),
                source,
            })?;
        if !termination.success() {
            let _ = fs::remove_dir_all(&paths.kcache);
            return Err(StagingError::Extract {
                artifact: kind.as_str(),
                termination,
            });
        }
        let populated = WalkDir::new(&paths.kcache)
            .min_depth(1)
            .into_iter()
            .any(|entry| entry.is_ok());
        if !populated {
            return Err(StagingError::EmptyArchive {
                artifact: kind.as_str(),
            });
        }
        remove_file(&paths.kcache_archive)?;
        Ok(StagedArtifact {
            kind,
            source: job.locator.url(KCACHE_OBJECT),
            path: paths.kcache.clone(),
            sha256: None,
        })
    }

    fn stage_image(
        &self,
        job: &Job,
        paths: &JobPaths,
        log: &JobLog,
    ) -> Result<StagedArtifact, StagingError> {
        let kind = ArtifactKind::VmImage;
        let source = match self.image.source_format {
            ImageSourceFormat::Raw => {
                let termination = self
                    .archive
                    .clone_image(&self.image.base_image, &paths.disk, log)
                    .map_err(|source| StagingError::Io {
                        path: self.image.base_image.clone(),
                        source,
                    })?;
                if !termination.success() {
                    let _ = fs::remove_file(&paths.disk);
                    return Err(StagingError::Image {
                        path: self.image.base_image.clone(),
                        termination,
                    });
                }
                self.image.base_image.display().to_string()
            }
            ImageSourceFormat::Tarball => {
                let object = &self.image.tarball_object;
                self.fetch(job, kind, object, &paths.image_archive, log)?;
                // unpack aside so stray members can neither clobber the job
                // log nor escape cleanup
                create_dir(&paths.image_unpack)?;
                let termination = self
                    .archive
                    .extract(&paths.image_archive, &paths.image_unpack, Compression::Gzip, log)
                    .map_err(|source| StagingError::Io {
                        path: paths.image_archive.clone(),
                        source,
                    })?;
                if !termination.success() {
                    return Err(StagingError::Extract {
                        artifact: kind.as_str(),
                        termination,
                    });
                }
                let unpacked = paths.image_unpack.join(DISK_MEMBER);
                if !unpacked.is_file() {
                    return Err(StagingError::MissingImage { expected: unpacked });
                }
                fs::rename(&unpacked, &paths.disk).map_err(|source| StagingError::Io {
                    path: unpacked.clone(),
                    source,
                })?;
                fs::remove_dir_all(&paths.image_unpack).map_err(|source| StagingError::Io {
                    path: paths.image_unpack.clone(),
                    source,
                })?;
                remove_file(&paths.image_archive)?;
                job.locator.url(object)
            }
        };
        Ok(StagedArtifact {
            kind,
            source,
            path: paths.disk.clone(),
            sha256: None,
        })
    }

    fn fetch_verified(
        &self,
        job: &Job,
        kind: ArtifactKind,
        name: &str,
        dest: &Path,
        log: &JobLog,
    ) -> Result<StagedArtifact, StagingError> {
        self.fetch(job, kind, name, dest, log)?;
        let digest = sha256_file(dest).map_err(|source| StagingError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        log.note(format_args!("{} sha256 {}", kind.as_str(), digest));
        info!(artifact = kind.as_str(), sha256 = %digest, "artifact staged");
        Ok(StagedArtifact {
            kind,
            source: job.locator.url(name),
            path: dest.to_path_buf(),
            sha256: Some(digest),
        })
    }

    /// Downloads into a `.partial` sibling and renames on success, retrying
    /// with backoff when configured.
    fn fetch(
        &self,
        job: &Job,
        kind: ArtifactKind,
        name: &str,
        dest: &Path,
        log: &JobLog,
    ) -> Result<(), StagingError> {
        let object = job.locator.object(name);
        let partial = partial_path(dest);
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .store
                .fetch(&job.locator.bucket, &object, &partial, log)
                .and_then(|()| fs::rename(&partial, dest).map_err(StoreError::from));
            let error = match result {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            let _ = fs::remove_file(&partial);
            if attempt >= attempts {
                return Err(StagingError::Fetch {
                    artifact: kind.as_str(),
                    locator: job.locator.url(name),
                    error,
                });
            }
            let delay = self.retry.delay_for(attempt);
            warn!(
                artifact = kind.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "fetch failed, retrying"
            );
            log.note(format_args!(
                "fetch of {} failed ({}), retry {} of {}",
                object,
                error,
                attempt,
                attempts - 1
            ));
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

fn create_dir(path: &Path) -> Result<(), StagingError> {
    fs::create_dir_all(path).map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_file(path: &Path) -> Result<(), StagingError> {
    fs::remove_file(path).map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}
