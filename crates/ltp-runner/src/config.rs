use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LTP_REPO: &str = "https://github.com/kaloronahuang/ltp.git";
pub const DEFAULT_LTP_BRANCH: &str = "kgym/main";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub work_root: PathBuf,
    pub max_parallel: usize,
    pub suites: Vec<String>,
    pub ltp: LtpConfig,
    pub store: StoreConfig,
    pub image: ImageConfig,
    pub builder: BuilderConfig,
    pub harness: HarnessConfig,
    pub host: HostConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("work_dir"),
            max_parallel: 4,
            suites: vec!["syscalls".to_string()],
            ltp: LtpConfig::default(),
            store: StoreConfig::default(),
            image: ImageConfig::default(),
            builder: BuilderConfig::default(),
            harness: HarnessConfig::default(),
            host: HostConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LtpConfig {
    pub repo: String,
    pub branch: String,
}

impl Default for LtpConfig {
    fn default() -> Self {
        Self {
            repo: DEFAULT_LTP_REPO.to_string(),
            branch: DEFAULT_LTP_BRANCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Gcloud {
        #[serde(default = "default_gcloud")]
        program: String,
    },
    Local {
        root: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Gcloud {
            program: default_gcloud(),
        }
    }
}

fn default_gcloud() -> String {
    "gcloud".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSourceFormat {
    /// Copy a local base image.
    Raw,
    /// Fetch a gzipped tarball holding `disk.raw` from the job's storage prefix.
    Tarball,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    pub source_format: ImageSourceFormat,
    pub base_image: PathBuf,
    pub tarball_object: String,
    pub resize: bool,
    pub target_size: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            source_format: ImageSourceFormat::Raw,
            base_image: PathBuf::from("./ltp.raw"),
            tarball_object: "image.tar.gz".to_string(),
            resize: false,
            target_size: "20G".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub program: String,
    pub image: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            image: "kaloronahuang/ltp-builder".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub program: PathBuf,
    pub framework: String,
    pub sockets: u32,
    pub cores: u32,
    pub ram: String,
    pub user: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./kirk"),
            framework: "ltp".to_string(),
            sockets: 2,
            cores: 1,
            ram: "8G".to_string(),
            user: "root".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Command prefix for privileged steps; empty when already running as root.
    pub privilege: Vec<String>,
    pub loop_lock: PathBuf,
    pub loop_slots: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            privilege: vec!["sudo".to_string()],
            loop_lock: std::env::temp_dir().join("ltp-cluster-loop.lock"),
            loop_slots: 1,
        }
    }
}

/// Per-class deadlines in seconds. Zero disables the deadline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub fetch: u64,
    pub extract: u64,
    pub build: u64,
    pub compose_step: u64,
    pub execute: u64,
    pub cleanup: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: 1800,
            extract: 1800,
            build: 7200,
            compose_step: 600,
            execute: 6 * 3600,
            cleanup: 600,
        }
    }
}

impl TimeoutConfig {
    pub fn limit(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total fetch attempts per artifact; 1 means no retry.
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl ClusterConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                serde_yaml::from_str::<ClusterConfig>(&raw)
                    .with_context(|| format!("invalid config {}", p.display()))?
            }
            None => ClusterConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be at least 1"));
        }
        if self.suites.is_empty() {
            return Err(anyhow!("at least one suite must be selected"));
        }
        if self.host.loop_slots == 0 {
            return Err(anyhow!("host.loop_slots must be at least 1"));
        }
        if self.retry.attempts == 0 {
            return Err(anyhow!("retry.attempts must be at least 1"));
        }
        if self.harness.sockets == 0 || self.harness.cores == 0 {
            return Err(anyhow!("harness vm needs at least one socket and one core"));
        }
        parse_size(&self.harness.ram).context("harness.ram")?;
        parse_size(&self.image.target_size).context("image.target_size")?;
        Ok(())
    }

    pub fn scoreboard_path(&self) -> PathBuf {
        self.work_root.join("scoreboard.json")
    }
}

/// Parses sizes like `8G` or `512M` into bytes.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx),
        None => (raw, ""),
    };
    if digits.is_empty() {
        return Err(anyhow!("invalid size '{}': expected <digits>[KMGT]", raw));
    }
    let value: u64 = digits.parse()?;
    let shift = match unit {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(anyhow!("invalid size unit in '{}': expected K, M, G or T", raw)),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow!("size '{}' overflows", raw))
}
