//! Credit accounting configuration
//!
//! Precedence: env vars > config file > defaults. The file holds a single
//! `[credit]` table; every field is optional.
//!
//! ```toml
//! [credit]
//! usage_reporting_threshold = 0.8
//! extra_quota_margin = 1024
//! terminate_on_exhaust = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Env var overriding `usage_reporting_threshold`
pub const THRESHOLD_ENV: &str = "CREDIT_USAGE_REPORTING_THRESHOLD";

/// Env var naming the config file when no CLI path is given
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

pub const DEFAULT_USAGE_REPORTING_THRESHOLD: f64 = 0.8;

/// Tunables shared by every credit in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditConfig {
    /// Fraction of the quota left at the last report that must be consumed
    /// before the credit asks for more. Range (0, 1].
    #[serde(default = "default_threshold")]
    pub usage_reporting_threshold: f64,
    /// Bytes a subscriber may overrun a grant before the credit is exhausted.
    #[serde(default)]
    pub extra_quota_margin: u64,
    /// When false, exhaustion never produces an enforcement action and a
    /// non-final credit keeps requesting quota instead.
    #[serde(default = "default_terminate_on_exhaust")]
    pub terminate_on_exhaust: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    credit: CreditConfig,
}

fn default_threshold() -> f64 {
    DEFAULT_USAGE_REPORTING_THRESHOLD
}

fn default_terminate_on_exhaust() -> bool {
    true
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            usage_reporting_threshold: DEFAULT_USAGE_REPORTING_THRESHOLD,
            extra_quota_margin: 0,
            terminate_on_exhaust: true,
        }
    }
}

impl CreditConfig {
    /// Load from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&contents)?;

        if let Ok(raw) = std::env::var(THRESHOLD_ENV) {
            config.usage_reporting_threshold = raw.trim().parse().map_err(|e| {
                Error::Config(format!("{THRESHOLD_ENV} is not a number ({raw}): {e}"))
            })?;
            config.validate()?;
        }

        Ok(config)
    }

    /// Parse and validate a TOML document without touching the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;
        file.credit.validate()?;
        Ok(file.credit)
    }

    /// Reject values the credit state machine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.usage_reporting_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "usage_reporting_threshold must be in (0, 1], got: {threshold}"
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from("credit.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("credit.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_when_table_missing() {
        let config = CreditConfig::from_toml_str("").unwrap();
        assert_eq!(config, CreditConfig::default());
        assert_eq!(config.usage_reporting_threshold, 0.8);
        assert_eq!(config.extra_quota_margin, 0);
        assert!(config.terminate_on_exhaust);
    }

    #[test]
    fn parses_all_fields() {
        let config = CreditConfig::from_toml_str(
            r#"
[credit]
usage_reporting_threshold = 0.5
extra_quota_margin = 2048
terminate_on_exhaust = false
"#,
        )
        .unwrap();
        assert_eq!(config.usage_reporting_threshold, 0.5);
        assert_eq!(config.extra_quota_margin, 2048);
        assert!(!config.terminate_on_exhaust);
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = CreditConfig::from_toml_str("[credit]\nusage_reporting_threshold = 0.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("usage_reporting_threshold"));
    }

    #[test]
    fn rejects_threshold_above_one() {
        assert!(
            CreditConfig::from_toml_str("[credit]\nusage_reporting_threshold = 1.5\n").is_err()
        );
    }

    #[test]
    fn rejects_unknown_field() {
        assert!(CreditConfig::from_toml_str("[credit]\nthreshold = 0.5\n").is_err());
    }

    #[test]
    fn load_missing_file() {
        let result = CreditConfig::load(Path::new("/nonexistent/path/credit.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn env_overrides_threshold() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[credit]\nusage_reporting_threshold = 0.5\n");

        unsafe { set_env(THRESHOLD_ENV, "0.9") };
        let config = CreditConfig::load(&path);
        unsafe { remove_env(THRESHOLD_ENV) };

        assert_eq!(config.unwrap().usage_reporting_threshold, 0.9);
    }

    #[test]
    fn env_threshold_is_validated() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        unsafe { set_env(THRESHOLD_ENV, "not-a-number") };
        let bad = CreditConfig::load(&path);
        unsafe { set_env(THRESHOLD_ENV, "2") };
        let out_of_range = CreditConfig::load(&path);
        unsafe { remove_env(THRESHOLD_ENV) };

        assert!(bad.is_err());
        assert!(out_of_range.is_err());
    }

    #[test]
    fn resolve_path_prefers_cli() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env(CONFIG_PATH_ENV, "/etc/credit/env.toml") };
        let cli = CreditConfig::resolve_path(Some("/tmp/cli.toml"));
        let env = CreditConfig::resolve_path(None);
        unsafe { remove_env(CONFIG_PATH_ENV) };
        let fallback = CreditConfig::resolve_path(None);

        assert_eq!(cli, PathBuf::from("/tmp/cli.toml"));
        assert_eq!(env, PathBuf::from("/etc/credit/env.toml"));
        assert_eq!(fallback, PathBuf::from("credit.toml"));
    }
}
