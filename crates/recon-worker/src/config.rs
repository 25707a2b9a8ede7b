use anyhow::{bail, Context, Result};
use recon_engine::EngineConfig;
use recon_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What the batch entry point does after a record fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Stop at the first failing record; records committed before it stay committed.
    #[default]
    Halt,
    Continue,
}

impl BatchFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchFailurePolicy::Halt => "halt",
            BatchFailurePolicy::Continue => "continue",
        }
    }
}

impl fmt::Display for BatchFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(BatchFailurePolicy::Halt),
            "continue" => Ok(BatchFailurePolicy::Continue),
            other => bail!("unknown batch failure policy: {other} (expected halt or continue)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub failure_policy: BatchFailurePolicy,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// TOML file with [store] and [engine] tables
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,
    #[arg(long, global = true)]
    pub pool_size: Option<u32>,
    #[arg(long, global = true)]
    pub lock_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
    #[arg(long, global = true)]
    pub deadline_ms: Option<u64>,
    #[arg(long, global = true)]
    pub failure_policy: Option<BatchFailurePolicy>,
}

impl WorkerConfig {
    /// Defaults, then the TOML file, then `RECON_*` variables, then command line flags.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    fn resolve<F>(overrides: &ConfigOverrides, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = overrides
            .config
            .clone()
            .or_else(|| lookup("RECON_CONFIG_PATH").map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("RECON_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(pool_size) = parse_env(lookup, "RECON_POOL_SIZE")? {
            self.store.pool_size = pool_size;
        }
        if let Some(lock_timeout_ms) = parse_env(lookup, "RECON_LOCK_TIMEOUT_MS")? {
            self.engine.lock_timeout_ms = lock_timeout_ms;
        }
        if let Some(max_retries) = parse_env(lookup, "RECON_MAX_RETRIES")? {
            self.engine.max_retries = max_retries;
        }
        if let Some(deadline_ms) = parse_env(lookup, "RECON_DEADLINE_MS")? {
            self.engine.deadline_ms = Some(deadline_ms);
        }
        if let Some(policy) = parse_env(lookup, "RECON_FAILURE_POLICY")? {
            self.failure_policy = policy;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(path) = &overrides.db_path {
            self.store.path = path.clone();
        }
        if let Some(pool_size) = overrides.pool_size {
            self.store.pool_size = pool_size;
        }
        if let Some(lock_timeout_ms) = overrides.lock_timeout_ms {
            self.engine.lock_timeout_ms = lock_timeout_ms;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.engine.max_retries = max_retries;
        }
        if let Some(deadline_ms) = overrides.deadline_ms {
            self.engine.deadline_ms = Some(deadline_ms);
        }
        if let Some(policy) = overrides.failure_policy {
            self.failure_policy = policy;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.engine.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be positive");
        }
        if self.engine.deadline_ms == Some(0) {
            bail!("deadline_ms must be positive when set");
        }
        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("invalid {key}={raw}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let config = WorkerConfig::resolve(&ConfigOverrides::default(), env(&[])).expect("config");
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.engine.lock_timeout_ms, 3_000);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.failure_policy, BatchFailurePolicy::Halt);
    }

    #[test]
    fn layers_apply_file_then_env_then_flags() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("worker.toml");
        fs::write(
            &path,
            r#"
failure_policy = "continue"

[store]
path = "/var/lib/recon/from-file.db"
pool_size = 2

[engine]
lock_timeout_ms = 1000
max_retries = 5
"#,
        )
        .expect("write config");

        let overrides = ConfigOverrides {
            max_retries: Some(7),
            ..ConfigOverrides::default()
        };
        let config = WorkerConfig::resolve(
            &overrides,
            env(&[
                ("RECON_CONFIG_PATH", path.to_str().expect("utf-8 path")),
                ("RECON_POOL_SIZE", "8"),
                ("RECON_MAX_RETRIES", "6"),
                ("RECON_DEADLINE_MS", "9000"),
            ]),
        )
        .expect("config");

        assert_eq!(config.store.path, PathBuf::from("/var/lib/recon/from-file.db"));
        assert_eq!(config.store.pool_size, 8);
        assert_eq!(config.engine.lock_timeout_ms, 1_000);
        assert_eq!(config.engine.max_retries, 7);
        assert_eq!(config.engine.deadline_ms, Some(9_000));
        assert_eq!(config.failure_policy, BatchFailurePolicy::Continue);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let err = WorkerConfig::resolve(&ConfigOverrides::default(), env(&[("RECON_POOL_SIZE", "0")]))
            .expect_err("zero pool");
        assert!(err.to_string().contains("pool_size"));

        let err = WorkerConfig::resolve(
            &ConfigOverrides::default(),
            env(&[("RECON_FAILURE_POLICY", "retry-forever")]),
        )
        .expect_err("unknown policy");
        assert!(err.to_string().contains("RECON_FAILURE_POLICY"));

        let err = WorkerConfig::resolve(
            &ConfigOverrides::default(),
            env(&[("RECON_LOCK_TIMEOUT_MS", "soon")]),
        )
        .expect_err("non-numeric timeout");
        assert!(err.to_string().contains("RECON_LOCK_TIMEOUT_MS"));
    }

    #[test]
    fn missing_config_file_is_reported_with_path() {
        let overrides = ConfigOverrides {
            config: Some(PathBuf::from("/nonexistent/recon.toml")),
            ..ConfigOverrides::default()
        };
        let err = WorkerConfig::resolve(&overrides, env(&[])).expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/recon.toml"));
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!(
            "Continue".parse::<BatchFailurePolicy>().expect("policy"),
            BatchFailurePolicy::Continue
        );
        assert_eq!(BatchFailurePolicy::Halt.to_string(), "halt");
    }
}
