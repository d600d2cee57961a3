//! Registry credentials: environment first, then a local properties file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where to look for credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialSettings {
    pub username_env: String,
    pub password_env: String,
    /// Properties file, relative to the configuration directory.
    pub properties_file: PathBuf,
    pub username_property: String,
    pub password_property: String,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            username_env: "TANDEM_REGISTRY_USER".to_string(),
            password_env: "TANDEM_REGISTRY_TOKEN".to_string(),
            properties_file: PathBuf::from("local.properties"),
            username_property: "registry.user".to_string(),
            password_property: "registry.token".to_string(),
        }
    }
}

/// Username and secret for the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Resolve credentials without touching the network.
///
/// The environment pair wins when both variables are set and non-empty.
/// Otherwise both properties must be present in the properties file. The
/// error lists every source that was checked.
pub fn resolve_credentials<F>(
    settings: &CredentialSettings,
    base_dir: &Path,
    env: F,
) -> Result<Credentials, String>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    if let (Some(user), Some(password)) = (
        non_empty(env(&settings.username_env)),
        non_empty(env(&settings.password_env)),
    ) {
        tracing::debug!(source = "environment", "registry credentials resolved");
        return Ok(Credentials::new(user, password));
    }

    let properties_path = if settings.properties_file.is_absolute() {
        settings.properties_file.clone()
    } else {
        base_dir.join(&settings.properties_file)
    };
    if let Ok(content) = fs::read_to_string(&properties_path) {
        let properties = parse_properties(&content);
        if let (Some(user), Some(password)) = (
            non_empty(properties.get(&settings.username_property).cloned()),
            non_empty(properties.get(&settings.password_property).cloned()),
        ) {
            tracing::debug!(
                source = %properties_path.display(),
                "registry credentials resolved"
            );
            return Ok(Credentials::new(user, password));
        }
    }

    Err(format!(
        "set {} and {}, or {} and {} in {}",
        settings.username_env,
        settings.password_env,
        settings.username_property,
        settings.password_property,
        properties_path.display()
    ))
}

/// Parse `key=value` / `key: value` lines; `#` and `!` start comments.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some(split) = line.find(['=', ':']) else {
            continue;
        };
        let key = line[..split].trim();
        let value = line[split + 1..].trim();
        if !key.is_empty() {
            properties.insert(key.to_string(), value.to_string());
        }
    }
    properties
}
