//! Environment-driven configuration
//!
//! All knobs come from environment variables (optionally seeded from a
//! `.env` file by the binary). Malformed values fall back to the same
//! defaults the platform shipped with, so a broken deployment env never
//! prevents startup.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Resource limits for one side of the evaluation (participant or organizer).
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Wall-clock deadline for the container.
    pub timeout: Duration,
    /// CPU quota in whole cores (converted to nano-CPUs at the runtime boundary).
    pub cpu_cores: u64,
    /// Memory ceiling in bytes.
    pub mem_limit_bytes: i64,
}

impl RunLimits {
    /// CPU quota expressed in nano-CPUs, the unit the container runtime expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores as i64) * 1_000_000_000
    }
}

/// Platform configuration.
///
/// Upload size ceilings are enforced by the ingress before a submission
/// is created; the evaluation core only consumes `base_dir`, the queue
/// file path and the two [`RunLimits`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding one subdirectory per contest.
    pub base_dir: PathBuf,
    /// Scratch directory for in-flight uploads.
    pub upload_dir: PathBuf,
    /// Path of the persistent task queue file.
    pub queue_file: PathBuf,
    /// Maximum accepted dataset archive size in bytes.
    pub zip_max_size: u64,
    /// Maximum accepted image tarball size in bytes.
    pub tar_max_size: u64,
    /// Maximum accepted cover image size in bytes.
    pub image_max_size: u64,
    /// Extensions accepted for image tarballs (lowercase, no leading dot).
    pub allowed_tar_extensions: HashSet<String>,
    /// Extensions accepted for dataset archives (lowercase, no leading dot).
    pub allowed_zip_extensions: HashSet<String>,
    pub participant: RunLimits,
    pub organizer: RunLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./projects"),
            upload_dir: PathBuf::from("./uploads"),
            queue_file: PathBuf::from("./task_queue.json"),
            zip_max_size: 524_288_000,
            tar_max_size: 524_288_000,
            image_max_size: 5 * 1024 * 1024,
            allowed_tar_extensions: ["tar", "tar.gz"].iter().map(|s| s.to_string()).collect(),
            allowed_zip_extensions: ["zip"].iter().map(|s| s.to_string()).collect(),
            participant: RunLimits {
                timeout: Duration::from_secs(300),
                cpu_cores: 2,
                mem_limit_bytes: 2 * 1024 * 1024 * 1024,
            },
            organizer: RunLimits {
                timeout: Duration::from_secs(300),
                cpu_cores: 1,
                mem_limit_bytes: 1024 * 1024 * 1024,
            },
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Every variable is optional; anything absent or unparseable keeps
    /// its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_dir: env_path("BASE_DIR", defaults.base_dir),
            upload_dir: env_path("UPLOAD_FOLDER", defaults.upload_dir),
            queue_file: env_path("QUEUE_FILE", defaults.queue_file),
            zip_max_size: env_parse("ZIP_MAX_SIZE", defaults.zip_max_size),
            tar_max_size: env_parse("TAR_MAX_SIZE", defaults.tar_max_size),
            image_max_size: env_parse("IMAGE_MAX_SIZE", defaults.image_max_size),
            allowed_tar_extensions: env_set("ALLOWED_TAR_EXTENSIONS", defaults.allowed_tar_extensions),
            allowed_zip_extensions: env_set("ALLOWED_ZIP_EXTENSIONS", defaults.allowed_zip_extensions),
            participant: RunLimits {
                timeout: Duration::from_secs(env_parse("PARTICIPANT_TIMEOUT", 300)),
                cpu_cores: env_parse("PARTICIPANT_CPU_CORES", 2),
                mem_limit_bytes: env_mem("PARTICIPANT_MEM_LIMIT", defaults.participant.mem_limit_bytes),
            },
            organizer: RunLimits {
                timeout: Duration::from_secs(env_parse("ORGANIZER_TIMEOUT", 300)),
                cpu_cores: env_parse("ORGANIZER_CPU_CORES", 1),
                mem_limit_bytes: env_mem("ORGANIZER_MEM_LIMIT", defaults.organizer.mem_limit_bytes),
            },
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_set(key: &str, default: HashSet<String>) -> HashSet<String> {
    match env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}

fn env_mem(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| parse_mem_limit(&v))
        .unwrap_or(default)
}

/// Parse a memory limit with an optional `b`/`k`/`m`/`g` suffix into bytes.
///
/// Returns `None` for anything that is not a positive number with a
/// recognized suffix.
///
/// # Examples
///
/// ```
/// use verdict::config::parse_mem_limit;
///
/// assert_eq!(parse_mem_limit("2g"), Some(2 * 1024 * 1024 * 1024));
/// assert_eq!(parse_mem_limit("512m"), Some(512 * 1024 * 1024));
/// assert_eq!(parse_mem_limit("oops"), None);
/// ```
pub fn parse_mem_limit(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    let (digits, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' => (&value[..value.len() - 1], 1024),
        b'b' => (&value[..value.len() - 1], 1),
        _ => (value.as_str(), 1),
    };
    let n: i64 = digits.trim().parse().ok()?;
    if n <= 0 {
        return None;
    }
    n.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_limit_suffixes() {
        assert_eq!(parse_mem_limit("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_mem_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_mem_limit("64k"), Some(64 * 1024));
        assert_eq!(parse_mem_limit("100b"), Some(100));
        assert_eq!(parse_mem_limit("1048576"), Some(1_048_576));
        assert_eq!(parse_mem_limit(" 1G "), Some(1024 * 1024 * 1024));
    }

    #[test]
    fn test_parse_mem_limit_rejects_garbage() {
        assert_eq!(parse_mem_limit(""), None);
        assert_eq!(parse_mem_limit("g"), None);
        assert_eq!(parse_mem_limit("-1g"), None);
        assert_eq!(parse_mem_limit("0"), None);
        assert_eq!(parse_mem_limit("two gigs"), None);
    }

    #[test]
    fn test_defaults_match_shipped_configuration() {
        let config = Config::default();
        assert_eq!(config.participant.timeout, Duration::from_secs(300));
        assert_eq!(config.participant.cpu_cores, 2);
        assert_eq!(config.participant.mem_limit_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.organizer.cpu_cores, 1);
        assert_eq!(config.participant.nano_cpus(), 2_000_000_000);
        assert!(config.allowed_tar_extensions.contains("tar.gz"));
        assert_eq!(config.zip_max_size, 524_288_000);
    }
}
