//! Runtime configuration for the subindex binary.
//!
//! Values come from, in order of precedence: explicit overrides (CLI
//! flags), process environment variables, and a local `.env` file. The
//! resolved [`RuntimeConfig`] is produced once at startup and handed down;
//! pipeline components never look up configuration themselves.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_FILE: &str = "subindex.db";
pub const DEFAULT_LANGUAGE: &str = "en";
/// Conservative worker count; the platform rate-limits aggressive clients.
pub const DEFAULT_JOBS: usize = 4;

/// Fully-resolved settings the binary runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub language: String,
    pub jobs: usize,
}

/// Values that take precedence over both the environment and the `.env`
/// file. Populated from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub language: Option<String>,
    pub jobs: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config() -> Result<RuntimeConfig> {
    resolve_config(ConfigOverrides::default())
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_config(&file_vars, env_var_string, overrides))
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> RuntimeConfig {
    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("SUBINDEX_DB", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());

    let language = overrides
        .language
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup_value("SUBINDEX_LANGUAGE", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

    let jobs = overrides
        .jobs
        .or_else(|| {
            lookup_value("SUBINDEX_JOBS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|jobs| *jobs > 0)
        .unwrap_or(DEFAULT_JOBS);

    RuntimeConfig {
        db_path: PathBuf::from(db_path),
        language,
        jobs,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a `KEY=value` env file, tolerating `export` prefixes, quoting,
/// comments, and malformed lines. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
