use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SERVER_ENV: &str = "CONFLUENCE_SERVER";
pub const USERNAME_ENV: &str = "CONFLUENCE_USERNAME";
pub const PASSWORD_ENV: &str = "CONFLUENCE_PASSWORD";

/// Contents of the user's `~/.confdoc` JSON file.
///
/// Keys this tool does not know about are kept in `extra` and written back on
/// save.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_key: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(rename = "macro", default, skip_serializing_if = "Option::is_none")]
    pub macro_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "label_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub labels: Vec<String>,
    #[serde(default)]
    pub watch: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Connection values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UserConfig {
    /// Resolve connection settings: flag > env > config file.
    pub fn connection(&self, overrides: &ConnectionOverrides) -> ConnectionSettings {
        self.connection_with_lookup(overrides, |key| env::var(key).ok())
    }

    fn connection_with_lookup<F>(
        &self,
        overrides: &ConnectionOverrides,
        lookup_env: F,
    ) -> ConnectionSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |flag: &Option<String>, key: &str, file: &Option<String>| {
            non_empty(flag.clone())
                .or_else(|| non_empty(lookup_env(key)))
                .or_else(|| non_empty(file.clone()))
        };
        ConnectionSettings {
            server: pick(&overrides.server, SERVER_ENV, &self.server),
            username: pick(&overrides.username, USERNAME_ENV, &self.username),
            password: pick(&overrides.password, PASSWORD_ENV, &self.password),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load the user config. Returns the default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<UserConfig> {
    if !config_path.exists() {
        return Ok(UserConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    if content.trim().is_empty() {
        return Ok(UserConfig::default());
    }
    let parsed: UserConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn save_config(config_path: &Path, config: &UserConfig) -> Result<()> {
    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut rendered =
        serde_json::to_string_pretty(config).context("failed to serialize config JSON")?;
    rendered.push('\n');
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a page id as number or string, found {other}"
        ))),
    }
}

fn label_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(text)) => vec![text],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Ok(text),
                other => Err(de::Error::custom(format!(
                    "expected label strings, found {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(de::Error::custom(format!(
                "expected labels as array or comma-separated string, found {other}"
            )));
        }
    };
    Ok(split_labels(values.iter().map(String::as_str)))
}

/// Split comma-separated label values, trimming and dropping empties.
pub fn split_labels<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}
