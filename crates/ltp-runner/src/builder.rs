use crate::error::BuildError;
use crate::process::{run_logged, JobLog, Termination};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

const SOURCE_MOUNT: &str = "/opt/ltp-build/linux";
const OUTPUT_MOUNT: &str = "/opt/ltp-build/ltp-deliverable";
const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the build environment leaves the installed test suite.
pub fn deliverable_path(output_dir: &Path) -> PathBuf {
    output_dir.join("opt").join("ltp")
}

pub trait BuildEngine: Send + Sync {
    fn build(
        &self,
        kcache: &Path,
        output_dir: &Path,
        repo_url: &str,
        branch: &str,
        log: &JobLog,
    ) -> Result<PathBuf, BuildError>;
}

/// Builds LTP in a throwaway container with the kernel tree bind-mounted in.
#[derive(Debug, Clone)]
pub struct DockerBuildEngine {
    program: String,
    image: String,
    timeout: Option<Duration>,
}

impl DockerBuildEngine {
    pub fn new(program: impl Into<String>, image: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            image: image.into(),
            timeout,
        }
    }

    fn command(
        &self,
        name: &str,
        kcache: &Path,
        output_dir: &Path,
        repo_url: &str,
        branch: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("run").arg("--rm").arg("--name").arg(name);
        cmd.arg("--mount").arg(format!(
            "type=bind,src={},dst={}",
            kcache.display(),
            SOURCE_MOUNT
        ));
        cmd.arg("--mount").arg(format!(
            "type=bind,src={},dst={}",
            output_dir.display(),
            OUTPUT_MOUNT
        ));
        cmd.arg("-e").arg(format!("LTP_REPO={}", repo_url));
        cmd.arg("-e").arg(format!("LTP_BRANCH={}", branch));
        cmd.arg(&self.image);
        cmd
    }

    /// Kills and removes a container whose client was stopped at the deadline.
    fn remove_container(&self, name: &str, log: &JobLog) {
        let attempts: [&[&str]; 2] = [&["kill", name], &["rm", "-f", name]];
        for args in attempts {
            let mut cmd = Command::new(&self.program);
            cmd.args(args);
            match run_logged(&mut cmd, log, Some(CONTAINER_STOP_TIMEOUT)) {
                Ok(t) if t.success() => {}
                Ok(t) => debug!(container = name, action = args[0], result = %t, "container cleanup"),
                Err(err) => warn!(container = name, action = args[0], error = %err, "container cleanup"),
            }
        }
    }
}

/// A name unique to the job's build output on this host, so a timed-out
/// build can be found again.
fn container_name(output_dir: &Path) -> String {
    let job: Vec<String> = output_dir
        .parent()
        .map(|work_dir| {
            work_dir
                .iter()
                .rev()
                .take(2)
                .map(|c| c.to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    let mut name = String::from("ltp");
    for part in job.iter().rev() {
        name.push('-');
        name.extend(part.chars().map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        }));
    }
    name.push_str(&format!("-{}", std::process::id()));
    name
}

impl BuildEngine for DockerBuildEngine {
    fn build(
        &self,
        kcache: &Path,
        output_dir: &Path,
        repo_url: &str,
        branch: &str,
        log: &JobLog,
    ) -> Result<PathBuf, BuildError> {
        fs::create_dir_all(output_dir).map_err(|source| BuildError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        // bind mounts need absolute sources
        let abs = |p: &Path| {
            fs::canonicalize(p).map_err(|source| BuildError::Io {
                path: p.to_path_buf(),
                source,
            })
        };
        let kcache = abs(kcache)?;
        let output_abs = abs(output_dir)?;

        let name = container_name(&output_abs);
        let mut cmd = self.command(&name, &kcache, &output_abs, repo_url, branch);
        let termination = run_logged(&mut cmd, log, self.timeout).map_err(BuildError::Launch)?;
        if let Termination::TimedOut(_) = termination {
            // the container belongs to the daemon and outlives its client
            self.remove_container(&name, log);
        }
        if !termination.success() {
            return Err(BuildError::Failed(termination));
        }
        Ok(deliverable_path(output_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn docker_command_binds_tree_and_passes_source_env() {
        let engine = DockerBuildEngine::new("docker", "kaloronahuang/ltp-builder", None);
        let cmd = engine.command(
            "ltp-K1-base-7",
            Path::new("/w/K1/base/kcache"),
            Path::new("/w/K1/base/ltp-deliverable"),
            "https://example.org/ltp.git",
            "kgym/main",
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--name",
                "ltp-K1-base-7",
                "--mount",
                "type=bind,src=/w/K1/base/kcache,dst=/opt/ltp-build/linux",
                "--mount",
                "type=bind,src=/w/K1/base/ltp-deliverable,dst=/opt/ltp-build/ltp-deliverable",
                "-e",
                "LTP_REPO=https://example.org/ltp.git",
                "-e",
                "LTP_BRANCH=kgym/main",
                "kaloronahuang/ltp-builder",
            ]
        );
    }

    #[test]
    fn exit_status_alone_decides_success() {
        let dir = tempfile::tempdir().expect("temp dir");
        let kcache = dir.path().join("kcache");
        fs::create_dir_all(&kcache).expect("kcache");
        let out = dir.path().join("ltp-deliverable");
        let log = JobLog::open(&dir.path().join("stdout.txt")).expect("log");

        let ok = DockerBuildEngine::new("true", "img", None);
        let path = ok.build(&kcache, &out, "repo", "branch", &log).expect("true succeeds");
        assert_eq!(path, out.join("opt").join("ltp"));

        let failing = DockerBuildEngine::new("false", "img", None);
        let err = failing
            .build(&kcache, &out, "repo", "branch", &log)
            .expect_err("false fails");
        assert!(matches!(err, BuildError::Failed(Termination::Exited(1))));
    }

    #[test]
    fn container_names_follow_the_job() {
        let name = container_name(Path::new("/w/K1/base v2/ltp-deliverable"));
        assert_eq!(name, format!("ltp-K1-base_v2-{}", std::process::id()));
    }

    #[test]
    fn timed_out_build_kills_its_container() {
        let dir = tempfile::tempdir().expect("temp dir");
        let calls = dir.path().join("docker-calls");
        let docker = dir.path().join("docker");
        fs::write(
            &docker,
            format!(
                "#!/bin/sh\nif [ \"$1\" = run ]; then exec sleep 30; fi\necho \"$@\" >> {}\n",
                calls.display()
            ),
        )
        .expect("fake docker");
        fs::set_permissions(&docker, fs::Permissions::from_mode(0o755)).expect("chmod");
        let work_dir = dir.path().join("K1").join("base");
        let kcache = work_dir.join("kcache");
        fs::create_dir_all(&kcache).expect("kcache");
        let log = JobLog::open(&work_dir.join("stdout.txt")).expect("log");

        let engine = DockerBuildEngine::new(
            docker.to_string_lossy(),
            "img",
            Some(Duration::from_millis(300)),
        );
        let err = engine
            .build(&kcache, &work_dir.join("ltp-deliverable"), "repo", "branch", &log)
            .expect_err("build hangs");
        assert!(matches!(err, BuildError::Failed(Termination::TimedOut(_))));
        let name = format!("ltp-K1-base-{}", std::process::id());
        assert_eq!(
            fs::read_to_string(&calls).expect("cleanup calls"),
            format!("kill {}\nrm -f {}\n", name, name)
        );
    }
}
