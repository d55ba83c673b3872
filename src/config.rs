//! Build configuration.
//!
//! The pipeline only ever reads a [`BuildConfig`]; authoring, listing and
//! storing configurations belong to the caller. A build record stores the
//! configuration *name* only, so resuming re-resolves the configuration
//! through a [`ConfigSource`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::distro::Distribution;

pub const SUPPORTED_ARCHITECTURES: &[&str] = &["amd64", "arm64", "i386"];

/// Immutable description of the image to build.
///
/// Unknown fields are tolerated so configuration files carrying runtime-only
/// settings (ports, volumes, timestamps) still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub name: String,
    pub distribution: String,
    pub version: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub custom_commands: Vec<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

fn default_architecture() -> String {
    "amd64".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_working_dir() -> String {
    "/".to_string()
}

impl BuildConfig {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(
        name: impl Into<String>,
        distribution: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            distribution: distribution.into(),
            version: version.into(),
            architecture: default_architecture(),
            packages: Vec::new(),
            custom_commands: Vec::new(),
            environment_vars: BTreeMap::new(),
            user: default_user(),
            working_dir: default_working_dir(),
        }
    }

    pub fn distro(&self) -> Distribution {
        Distribution::parse(&self.distribution)
    }

    /// Reject values that would produce a broken command line, escape the
    /// images directory, or corrupt files inside the rootfs.
    pub fn validate(&self) -> Result<()> {
        if !is_file_component(&self.name) {
            bail!(
                "invalid configuration name '{}': use letters, digits, '.', '-' or '_'",
                self.name
            );
        }
        if !is_file_component(&self.version) {
            bail!(
                "invalid version '{}' for configuration '{}'",
                self.version,
                self.name
            );
        }
        if !is_file_component(&self.distribution) {
            bail!(
                "invalid distribution '{}' for configuration '{}'",
                self.distribution,
                self.name
            );
        }
        if !SUPPORTED_ARCHITECTURES.contains(&self.architecture.as_str()) {
            bail!(
                "unsupported architecture '{}'; supported: {}",
                self.architecture,
                SUPPORTED_ARCHITECTURES.join(", ")
            );
        }
        if !is_user_name(&self.user) {
            bail!("invalid user name '{}'", self.user);
        }
        if !self.working_dir.starts_with('/') {
            bail!(
                "working_dir must be an absolute path, got '{}'",
                self.working_dir
            );
        }
        if self.working_dir.split('/').any(|part| part == "..") {
            bail!("working_dir must not contain '..': '{}'", self.working_dir);
        }
        for key in self.environment_vars.keys() {
            if !is_env_key(key) {
                bail!("invalid environment variable name '{}'", key);
            }
        }
        for (key, value) in &self.environment_vars {
            if value.contains('\n') {
                bail!("environment variable '{}' must not contain a newline", key);
            }
        }
        Ok(())
    }
}

fn is_file_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn is_user_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    value.len() <= 32
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
}

fn is_env_key(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lookup of configurations by name.
pub trait ConfigSource {
    fn load(&self, name: &str) -> Result<BuildConfig>;
}

/// Configurations stored as `<dir>/<name>.toml` or `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct DirConfigSource {
    dir: PathBuf,
}

impl DirConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ConfigSource for DirConfigSource {
    fn load(&self, name: &str) -> Result<BuildConfig> {
        if !is_file_component(name) {
            bail!("invalid configuration name '{}'", name);
        }

        let toml_path = self.dir.join(format!("{name}.toml"));
        let json_path = self.dir.join(format!("{name}.json"));

        let config: BuildConfig = if toml_path.is_file() {
            let text = fs::read_to_string(&toml_path)
                .with_context(|| format!("reading configuration '{}'", toml_path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing configuration '{}'", toml_path.display()))?
        } else if json_path.is_file() {
            let bytes = fs::read(&json_path)
                .with_context(|| format!("reading configuration '{}'", json_path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing configuration '{}'", json_path.display()))?
        } else {
            bail!(
                "configuration '{}' not found in '{}' (the original configuration may have been deleted)",
                name,
                self.dir.display()
            );
        };

        if config.name != name {
            bail!(
                "configuration file for '{}' declares name '{}'",
                name,
                config.name
            );
        }
        Ok(config)
    }
}
