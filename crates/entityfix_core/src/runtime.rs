use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{DEFAULT_DB_PATH, FixConfig};

pub const DEFAULT_CONFIG_FILENAME: &str = "entityfix.toml";

/// Where a resolved path came from, for diagnostics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub db: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub db_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "db_path={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

/// Resolve the config file path: flag > ENTITYFIX_CONFIG > default filename
/// under the working directory.
pub fn resolve_config_path(cwd: &Path, overrides: &PathOverrides) -> (PathBuf, ValueSource) {
    resolve_config_path_with_lookup(cwd, overrides, |key| env::var(key).ok())
}

fn resolve_config_path_with_lookup<F>(
    cwd: &Path,
    overrides: &PathOverrides,
    lookup_env: F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.config.as_deref() {
        return (absolutize(path, cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("ENTITYFIX_CONFIG")
        && !value.trim().is_empty()
    {
        return (absolutize(Path::new(value.trim()), cwd), ValueSource::Env);
    }
    (cwd.join(DEFAULT_CONFIG_FILENAME), ValueSource::Default)
}

/// Resolve the database path: flag > ENTITYFIX_DB > `[database] path` from
/// the loaded config > built-in default.
pub fn resolve_db_path(
    cwd: &Path,
    overrides: &PathOverrides,
    config: &FixConfig,
) -> (PathBuf, ValueSource) {
    resolve_db_path_with_lookup(cwd, overrides, config, |key| env::var(key).ok())
}

fn resolve_db_path_with_lookup<F>(
    cwd: &Path,
    overrides: &PathOverrides,
    config: &FixConfig,
    lookup_env: F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.db.as_deref() {
        return (absolutize(path, cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("ENTITYFIX_DB")
        && !value.trim().is_empty()
    {
        return (absolutize(Path::new(value.trim()), cwd), ValueSource::Env);
    }
    if let Some(path) = config.database.path.as_deref() {
        return (absolutize(Path::new(path), cwd), ValueSource::Config);
    }
    (cwd.join(DEFAULT_DB_PATH), ValueSource::Default)
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };
    let config_exists = paths.config_path.exists();

    let mut warnings = Vec::new();
    if !config_exists {
        warnings.push(format!(
            "{} is missing; scanning the built-in default locations (run `entityfix init`)",
            normalize_for_display(&paths.config_path)
        ));
    }

    Ok(RuntimeStatus {
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

/// Commands that touch the database refuse to run against a missing file,
/// since SQLite would silently create an empty one.
pub fn ensure_db_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.db_exists {
        bail!(
            "database not found: {}\nPass --db, set ENTITYFIX_DB, or configure [database] path in {}",
            normalize_for_display(&paths.db_path),
            normalize_for_display(&paths.config_path),
        );
    }
    Ok(())
}

/// Write the starter config file. Returns `true` when a write occurred.
pub fn materialize_starter_config(config_path: &Path, force: bool) -> Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(config_path, crate::config::render_starter_config())
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
