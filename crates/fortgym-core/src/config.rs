//! Runtime settings.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `FORT_GYM_*` environment variables. The CLI applies its own flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "FORT_GYM_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for per-run traces and summaries.
    pub artifacts_dir: PathBuf,
    pub ticks_per_step: u32,
    pub agent_timeout_ms: u64,
    pub backend_timeout_ms: u64,
    pub max_consecutive_backend_failures: u32,
    /// Refresh the run summary every this many committed steps.
    pub summary_every: u64,
    pub default_min_step_period_ms: u64,
    /// Floor applied to caller-supplied step periods.
    pub min_allowed_step_period_ms: u64,
    pub default_max_ticks: u32,
    pub max_ticks_cap: u32,
    pub mock_seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("fort_gym_artifacts"),
            ticks_per_step: 200,
            agent_timeout_ms: 10_000,
            backend_timeout_ms: 5_000,
            max_consecutive_backend_failures: 3,
            summary_every: 5,
            default_min_step_period_ms: 1_000,
            min_allowed_step_period_ms: 100,
            default_max_ticks: 500,
            max_ticks_cap: 1_000,
            mock_seed: 123,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        settings.apply_overrides(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `FORT_GYM_<FIELD>` overrides; unrelated variables are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match field.to_ascii_lowercase().as_str() {
                "artifacts_dir" => self.artifacts_dir = PathBuf::from(value),
                "ticks_per_step" => self.ticks_per_step = parse_num(field, value)?,
                "agent_timeout_ms" => self.agent_timeout_ms = parse_num(field, value)?,
                "backend_timeout_ms" => self.backend_timeout_ms = parse_num(field, value)?,
                "max_consecutive_backend_failures" => {
                    self.max_consecutive_backend_failures = parse_num(field, value)?
                }
                "summary_every" => self.summary_every = parse_num(field, value)?,
                "default_min_step_period_ms" => {
                    self.default_min_step_period_ms = parse_num(field, value)?
                }
                "min_allowed_step_period_ms" => {
                    self.min_allowed_step_period_ms = parse_num(field, value)?
                }
                "default_max_ticks" => self.default_max_ticks = parse_num(field, value)?,
                "max_ticks_cap" => self.max_ticks_cap = parse_num(field, value)?,
                "mock_seed" => self.mock_seed = parse_num(field, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ticks_per_step", u64::from(self.ticks_per_step)),
            ("agent_timeout_ms", self.agent_timeout_ms),
            ("backend_timeout_ms", self.backend_timeout_ms),
            (
                "max_consecutive_backend_failures",
                u64::from(self.max_consecutive_backend_failures),
            ),
            ("summary_every", self.summary_every),
            ("max_ticks_cap", u64::from(self.max_ticks_cap)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.default_max_ticks > self.max_ticks_cap {
            return Err(ConfigError::Invalid {
                key: "default_max_ticks".to_string(),
                reason: format!("exceeds max_ticks_cap ({})", self.max_ticks_cap),
            });
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
            backend_timeout: Duration::from_millis(self.backend_timeout_ms),
            max_consecutive_backend_failures: self.max_consecutive_backend_failures,
        }
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: field.to_ascii_lowercase(),
        reason: format!("`{value}` is not a valid number"),
    })
}

/// Per-engine limits derived from [`Settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub agent_timeout: Duration,
    pub backend_timeout: Duration,
    pub max_consecutive_backend_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Settings::default().engine_config()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.ticks_per_step, 200);
        assert_eq!(s.max_consecutive_backend_failures, 3);
        assert_eq!(s.default_min_step_period_ms, 1_000);
        assert_eq!(s.min_allowed_step_period_ms, 100);
        assert_eq!(s.default_max_ticks, 500);
        assert_eq!(s.max_ticks_cap, 1_000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let s = Settings::parse(
            r#"
artifacts_dir = "/tmp/fg"
ticks_per_step = 50
"#,
        )
        .unwrap();
        assert_eq!(s.artifacts_dir, PathBuf::from("/tmp/fg"));
        assert_eq!(s.ticks_per_step, 50);
        assert_eq!(s.summary_every, 5);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = Settings::parse("ticks_per_step = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_values_rejected() {
        let err = Settings::parse("summary_every = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "summary_every"));
        assert!(Settings::parse("default_max_ticks = 2000").is_err());
    }

    #[test]
    fn env_style_overrides() {
        let mut s = Settings::default();
        s.apply_overrides([
            ("FORT_GYM_TICKS_PER_STEP", "75"),
            ("FORT_GYM_ARTIFACTS_DIR", "/var/fg"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert_eq!(s.ticks_per_step, 75);
        assert_eq!(s.artifacts_dir, PathBuf::from("/var/fg"));

        let err = s
            .apply_overrides([("FORT_GYM_MOCK_SEED", "abc")])
            .unwrap_err();
        assert!(err.to_string().contains("mock_seed"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortgym.toml");
        std::fs::write(&path, "mock_seed = 9\n").unwrap();
        assert_eq!(Settings::from_file(&path).unwrap().mock_seed, 9);
        assert!(matches!(
            Settings::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn engine_config_from_settings() {
        let cfg = Settings::default().engine_config();
        assert_eq!(cfg.agent_timeout, Duration::from_millis(10_000));
        assert_eq!(cfg.backend_timeout, Duration::from_millis(5_000));
    }
}
