//! Instance spec resolution and dispatch tunables.
//!
//! Every configurable value follows the same precedence:
//! explicit per-step value, then `CVMSTEP_*` environment variable, then the
//! built-in default. Resolution is a pure function over immutable inputs so
//! a step's effective configuration is computed exactly once.

use std::{collections::HashMap, env, time::Duration};

use cvmstep_types::InstanceSpec;
use cvmstep_util::RetryPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const IMAGE_ENV: &str = "CVMSTEP_IMAGE";
pub const CPU_ENV: &str = "CVMSTEP_CPU";
pub const MEMORY_ENV: &str = "CVMSTEP_MEMORY";
pub const DISK_ENV: &str = "CVMSTEP_DISK";
pub const TIMEOUT_ENV: &str = "CVMSTEP_TIMEOUT";
/// Comma-separated `KEY=VALUE` pairs merged into the step environment.
pub const ENV_LIST_ENV: &str = "CVMSTEP_ENV";
/// Seconds between sentinel checks.
pub const POLL_INTERVAL_ENV: &str = "CVMSTEP_POLL_INTERVAL";

const ENV_PREFIX: &str = "CVMSTEP_";

/// Errors raised while resolving configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{variable} must be a positive integer; got '{value}'")]
    InvalidNumber { variable: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("malformed {source_name} entry '{entry}'; expected KEY=VALUE")]
    InvalidEnvEntry { source_name: &'static str, entry: String },
    #[error("image must not be empty")]
    EmptyImage,
}

/// Values set explicitly on one step. `None` falls through to the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    pub image: Option<String>,
    pub cpu: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

/// Immutable view of the `CVMSTEP_*` process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self::from_pairs(env::vars().filter(|(name, _)| name.starts_with(ENV_PREFIX)))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(key, value)| (key.into(), value.into())).collect(),
        }
    }

    /// Value of `name`, ignoring unset or blank variables.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|value| value.trim()).filter(|value| !value.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, variable: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(raw) = self.get(variable) else {
            return Ok(None);
        };
        raw.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidNumber {
            variable,
            value: raw.to_string(),
        })
    }
}

/// Fallback values used when neither the step nor the environment sets one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDefaults {
    pub image: String,
    pub cpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub timeout_s: u64,
    pub env: IndexMap<String, String>,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            cpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
            timeout_s: 3600,
            env: IndexMap::new(),
        }
    }
}

/// Merge explicit options, environment overrides and built-in defaults.
///
/// Scalars take the first value present in explicit, env, builtin order.
/// Environment maps are unioned (builtin, then `CVMSTEP_ENV`, then explicit)
/// with later sources winning on key collisions.
pub fn resolve_spec(explicit: &StepOptions, env: &EnvSnapshot, builtin: &BuiltinDefaults) -> Result<InstanceSpec, ConfigError> {
    let image = explicit
        .image
        .as_deref()
        .map(str::trim)
        .filter(|image| !image.is_empty())
        .or_else(|| env.get(IMAGE_ENV))
        .unwrap_or(builtin.image.as_str())
        .to_string();
    if image.trim().is_empty() {
        return Err(ConfigError::EmptyImage);
    }

    let cpu = pick(explicit.cpu, env.number(CPU_ENV)?, builtin.cpu);
    let memory_mb = pick(explicit.memory_mb, env.number(MEMORY_ENV)?, builtin.memory_mb);
    let disk_gb = pick(explicit.disk_gb, env.number(DISK_ENV)?, builtin.disk_gb);
    let timeout_s = pick(explicit.timeout_s, env.number(TIMEOUT_ENV)?, builtin.timeout_s);

    for (field, value) in [("cpu", u64::from(cpu)), ("memory", u64::from(memory_mb)), ("disk", u64::from(disk_gb)), ("timeout", timeout_s)] {
        if value == 0 {
            return Err(ConfigError::ZeroValue { field });
        }
    }

    let mut merged_env = builtin.env.clone();
    if let Some(raw) = env.get(ENV_LIST_ENV) {
        merged_env.extend(parse_env_list(ENV_LIST_ENV, raw)?);
    }
    merged_env.extend(explicit.env.iter().map(|(key, value)| (key.clone(), value.clone())));

    Ok(InstanceSpec {
        image,
        cpu,
        memory_mb,
        disk_gb,
        timeout_s,
        env: merged_env,
    })
}

fn pick<T>(explicit: Option<T>, from_env: Option<T>, builtin: T) -> T {
    explicit.or(from_env).unwrap_or(builtin)
}

/// Parse `KEY=VALUE` pairs separated by commas. Values may contain `=`.
pub fn parse_env_list(source_name: &'static str, raw: &str) -> Result<IndexMap<String, String>, ConfigError> {
    let mut parsed = IndexMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (key, value) = parse_env_pair(source_name, entry)?;
        parsed.insert(key, value);
    }
    Ok(parsed)
}

/// Parse a single `KEY=VALUE` entry.
pub fn parse_env_pair(source_name: &'static str, entry: &str) -> Result<(String, String), ConfigError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidEnvEntry {
            source_name,
            entry: entry.to_string(),
        }),
    }
}

/// Tunables for one dispatch: polling cadence and retry ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Sleep between sentinel checks.
    pub poll_interval: Duration,
    /// Consecutive storage failures the poller tolerates before giving up.
    pub max_poll_errors: u32,
    /// Retry policy for `create` and `start` after infrastructure failures.
    pub provision_retry: RetryPolicy,
    /// Retry policy for package uploads and existence checks.
    pub storage_retry: RetryPolicy,
    /// Hard ceiling for destroy attempts.
    pub destroy_retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_errors: 5,
            provision_retry: RetryPolicy::with_attempts(3),
            storage_retry: RetryPolicy::with_attempts(3),
            destroy_retry: RetryPolicy::with_attempts(5),
        }
    }
}

impl DispatchSettings {
    /// Defaults with `CVMSTEP_POLL_INTERVAL` applied.
    pub fn from_env(env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(seconds) = env.number::<u64>(POLL_INTERVAL_ENV)? {
            if seconds == 0 {
                return Err(ConfigError::ZeroValue { field: "poll interval" });
            }
            settings.poll_interval = Duration::from_secs(seconds);
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> EnvSnapshot {
        EnvSnapshot::from_pairs(pairs.iter().map(|(key, value)| (*key, *value)))
    }

    #[test]
    fn builtin_defaults_apply_when_nothing_is_set() {
        let spec = resolve_spec(&StepOptions::default(), &EnvSnapshot::default(), &BuiltinDefaults::default()).unwrap();
        assert_eq!(spec.image, "python:3.11-slim");
        assert_eq!((spec.cpu, spec.memory_mb, spec.disk_gb, spec.timeout_s), (2, 2048, 20, 3600));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn explicit_beats_env_beats_builtin() {
        let explicit = StepOptions {
            cpu: Some(4),
            ..StepOptions::default()
        };
        let env = env_of(&[(CPU_ENV, "8"), (MEMORY_ENV, "4096"), (IMAGE_ENV, "ubuntu:24.04")]);
        let spec = resolve_spec(&explicit, &env, &BuiltinDefaults::default()).unwrap();

        assert_eq!(spec.cpu, 4);
        assert_eq!(spec.memory_mb, 4096);
        assert_eq!(spec.image, "ubuntu:24.04");
        assert_eq!(spec.disk_gb, 20);
    }

    #[test]
    fn env_maps_are_unioned() {
        let mut builtin = BuiltinDefaults::default();
        builtin.env.insert("B".into(), "2".into());
        let mut explicit = StepOptions::default();
        explicit.env.insert("A".into(), "1".into());

        let spec = resolve_spec(&explicit, &EnvSnapshot::default(), &builtin).unwrap();
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(spec.env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn later_env_sources_win_on_collision() {
        let mut builtin = BuiltinDefaults::default();
        builtin.env.insert("MODE".into(), "builtin".into());
        let env = env_of(&[(ENV_LIST_ENV, "MODE=env, EXTRA=x=y")]);
        let spec = resolve_spec(&StepOptions::default(), &env, &builtin).unwrap();
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("env"));
        assert_eq!(spec.env.get("EXTRA").map(String::as_str), Some("x=y"));

        let mut explicit = StepOptions::default();
        explicit.env.insert("MODE".into(), "explicit".into());
        let spec = resolve_spec(&explicit, &env, &builtin).unwrap();
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("explicit"));
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let env = env_of(&[(MEMORY_ENV, "lots")]);
        let error = resolve_spec(&StepOptions::default(), &env, &BuiltinDefaults::default()).unwrap_err();
        assert_eq!(
            error,
            ConfigError::InvalidNumber {
                variable: MEMORY_ENV,
                value: "lots".into()
            }
        );
    }

    #[test]
    fn blank_env_values_fall_through() {
        let env = env_of(&[(IMAGE_ENV, "   "), (CPU_ENV, "")]);
        let spec = resolve_spec(&StepOptions::default(), &env, &BuiltinDefaults::default()).unwrap();
        assert_eq!(spec.image, "python:3.11-slim");
        assert_eq!(spec.cpu, 2);
    }

    #[test]
    fn zero_resources_are_rejected() {
        let explicit = StepOptions {
            timeout_s: Some(0),
            ..StepOptions::default()
        };
        let error = resolve_spec(&explicit, &EnvSnapshot::default(), &BuiltinDefaults::default()).unwrap_err();
        assert_eq!(error, ConfigError::ZeroValue { field: "timeout" });
    }

    #[test]
    fn malformed_env_list_is_an_error() {
        let env = env_of(&[(ENV_LIST_ENV, "A=1,oops")]);
        assert!(matches!(
            resolve_spec(&StepOptions::default(), &env, &BuiltinDefaults::default()),
            Err(ConfigError::InvalidEnvEntry { .. })
        ));
    }

    #[test]
    fn poll_interval_override() {
        let settings = DispatchSettings::from_env(&env_of(&[(POLL_INTERVAL_ENV, "3")])).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(3));
        assert!(DispatchSettings::from_env(&env_of(&[(POLL_INTERVAL_ENV, "0")])).is_err());
    }
}
