use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const CONFIG_FILENAME: &str = ".confdoc";
pub const CONFIG_ENV: &str = "CONFDOC_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub home_dir: Option<PathBuf>,
    pub hostname: String,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self {
            cwd,
            home_dir: home_dir_from(&lookup_env),
            hostname: hostname_from(&lookup_env),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRuntime {
    pub cwd: PathBuf,
    pub hostname: String,
    pub config_path: PathBuf,
    pub config_source: ValueSource,
}

impl ResolvedRuntime {
    pub fn diagnostics(&self) -> String {
        format!(
            "cwd={}\nhostname={}\nconfig_path={} ({})\nconfig_exists={}",
            normalize_for_display(&self.cwd),
            self.hostname,
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            self.config_path.is_file(),
        )
    }
}

pub fn resolve_runtime(
    context: &ResolutionContext,
    overrides: &ConfigOverrides,
) -> Result<ResolvedRuntime> {
    resolve_runtime_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_runtime_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &ConfigOverrides,
    lookup_env: F,
) -> Result<ResolvedRuntime>
where
    F: Fn(&str) -> Option<String>,
{
    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env(CONFIG_ENV).filter(|value| !value.trim().is_empty()) {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else if let Some(home) = context.home_dir.as_deref() {
        (home.join(CONFIG_FILENAME), ValueSource::Default)
    } else {
        bail!(
            "cannot locate a home directory for {CONFIG_FILENAME}; pass --config or set {CONFIG_ENV}"
        );
    };

    Ok(ResolvedRuntime {
        cwd: context.cwd.clone(),
        hostname: context.hostname.clone(),
        config_path,
        config_source,
    })
}

fn home_dir_from<F>(lookup_env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(|key| lookup_env(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn hostname_from<F>(lookup_env: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|key| lookup_env(key))
        .chain(fs::read_to_string("/etc/hostname").ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
