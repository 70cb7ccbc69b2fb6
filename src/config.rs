//! Limit configuration
//!
//! One immutable `LimitConfig` per run. Built from fixed defaults, then
//! overridden by an optional TOML file, environment variables and finally
//! the command line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default memory ceiling (64 MiB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
/// Default wall-clock timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

pub const ENV_CONFIG: &str = "LABTEST_CONFIG";
pub const ENV_MEMORY_LIMIT_KIB: &str = "LABTEST_MEMORY_LIMIT_KIB";
pub const ENV_TIMEOUT_SECS: &str = "LABTEST_TIMEOUT_SECS";

/// Memory and time limits for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Peak memory ceiling in bytes
    pub memory_limit_bytes: u64,
    /// Wall-clock timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl LimitConfig {
    pub fn new(memory_limit_bytes: u64, timeout_secs: u64) -> Self {
        Self {
            memory_limit_bytes,
            timeout_secs,
        }
    }

    /// Override the memory ceiling, given in KiB
    pub fn with_memory_limit_kib(mut self, kib: u64) -> Self {
        self.memory_limit_bytes = kib.saturating_mul(1024);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Memory ceiling in KiB, rounded up (the unit of the `-m` flag)
    pub fn memory_limit_kib(&self) -> u64 {
        self.memory_limit_bytes.div_ceil(1024)
    }

    /// Apply the `[limits]` table of a TOML config file
    pub fn merge_file(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        self.merge_toml(&content)
            .with_context(|| format!("Invalid config file {:?}", path))
    }

    fn merge_toml(self, content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let mut config = self;
        if let Some(kib) = raw.limits.memory_limit_kib {
            config = config.with_memory_limit_kib(nonzero("memory_limit_kib", kib)?);
        }
        if let Some(secs) = raw.limits.timeout_secs {
            config = config.with_timeout_secs(nonzero("timeout_secs", secs)?);
        }
        Ok(config)
    }

    /// Apply `LABTEST_MEMORY_LIMIT_KIB` and `LABTEST_TIMEOUT_SECS`
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = self;
        if let Some(value) = lookup(ENV_MEMORY_LIMIT_KIB) {
            config = config.with_memory_limit_kib(parse_var(ENV_MEMORY_LIMIT_KIB, &value)?);
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            config = config.with_timeout_secs(parse_var(ENV_TIMEOUT_SECS, &value)?);
        }
        Ok(config)
    }
}

/// Raw TOML configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    limits: RawLimits,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    memory_limit_kib: Option<u64>,
    timeout_secs: Option<u64>,
}

fn parse_var(key: &str, value: &str) -> Result<u64> {
    let parsed: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a positive integer, got {:?}", key, value))?;
    nonzero(key, parsed)
}

fn nonzero(key: &str, value: u64) -> Result<u64> {
    if value == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(value)
}
