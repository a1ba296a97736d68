//! Environment and profile configuration.
//!
//! Configuration is TOML. A file holds any number of `[[environment]]` and
//! `[[profile]]` tables; see [`Config`]. Files are validated as a whole, so a
//! broken file is never half-applied.

mod layer;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use warren_common::{WarrenError, WarrenPaths, WarrenResult};

pub use layer::{LayerConfig, LayerKind, MountDetails, PathAction, PathInfo};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "WARREN_CONFIG";

/// A named, ordered stack of layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Environment name.
    pub name: String,
    /// Capabilities this environment provides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    /// Capabilities this environment needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Commands this environment should be registered for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Layers, bottom first.
    #[serde(default, rename = "layer", skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerConfig>,
    /// File this environment was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

/// A command bound to an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProfileConfig {
    /// Profile name.
    pub name: String,
    /// Path of the wrapper that invokes this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<PathBuf>,
    /// Command to run inside the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,
    /// Environment name; none means the host root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// File this profile was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

/// A parsed configuration, possibly merged from several files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Client binary bound by `wormhole` directives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_path: Option<PathBuf>,
    /// Environments.
    #[serde(default, rename = "environment", skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentConfig>,
    /// Profiles.
    #[serde(default, rename = "profile", skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<ProfileConfig>,
}

impl Config {
    /// Parse and validate configuration text; `path` is used in errors.
    pub fn parse(text: &str, path: &Path) -> WarrenResult<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| WarrenError::config(path, e.to_string()))?;

        for env in &mut config.environments {
            env.source = path.to_path_buf();
        }
        for profile in &mut config.profiles {
            profile.source = path.to_path_buf();
        }

        config.validate(path)?;
        Ok(config)
    }

    /// Load one configuration file.
    pub fn load(path: &Path) -> WarrenResult<Self> {
        tracing::debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(path).map_err(|e| WarrenError::fs(path, e))?;
        Self::parse(&text, path)
    }

    /// Load the configuration the way the CLI does.
    ///
    /// An explicit path (or `$WARREN_CONFIG`) must exist and is used alone.
    /// Otherwise the user file and the system file are merged, each only if
    /// present.
    pub fn discover(explicit: Option<&Path>, paths: &WarrenPaths) -> WarrenResult<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            return Self::load(&path);
        }

        let mut config = Self::default();
        for path in paths.user_config.iter().chain(Some(&paths.system_config)) {
            if path.exists() {
                config.merge(Self::load(path)?, path)?;
            }
        }
        Ok(config)
    }

    /// Add the contents of `other`, loaded from `path`.
    pub fn merge(&mut self, other: Self, path: &Path) -> WarrenResult<()> {
        if self.client_path.is_none() {
            self.client_path = other.client_path;
        }
        self.environments.extend(other.environments);
        self.profiles.extend(other.profiles);
        self.check_unique(path)
    }

    /// Serialize to `path`.
    pub fn write(&self, path: &Path) -> WarrenResult<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|e| WarrenError::fs(path, e))?;
        tracing::info!(path = %path.display(), "Wrote configuration");
        Ok(())
    }

    /// Find an environment by name.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|env| env.name == name)
    }

    fn validate(&mut self, path: &Path) -> WarrenResult<()> {
        self.check_unique(path)?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        for env in &mut self.environments {
            if env.name.is_empty() {
                return Err(WarrenError::config(path, "environment without a name"));
            }
            for (index, layer) in env.layers.iter_mut().enumerate() {
                layer.normalize(base_dir).map_err(|message| {
                    WarrenError::config(
                        path,
                        format!("environment {}, layer {}: {message}", env.name, index + 1),
                    )
                })?;
            }
        }

        for profile in &self.profiles {
            if profile.name.is_empty() {
                return Err(WarrenError::config(path, "profile without a name"));
            }
            for file in profile.wrapper.iter().chain(profile.command.iter()) {
                if !file.is_absolute() {
                    return Err(WarrenError::config(
                        path,
                        format!(
                            "profile {}: {} must be an absolute path",
                            profile.name,
                            file.display()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_unique(&self, path: &Path) -> WarrenResult<()> {
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.as_str()) {
                return Err(WarrenError::config(
                    path,
                    format!("duplicate environment \"{}\"", env.name),
                ));
            }
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.name.as_str()) {
                return Err(WarrenError::config(
                    path,
                    format!("duplicate profile \"{}\"", profile.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
client-path = "/usr/bin/warren"

[[environment]]
name = "base"

[[environment.layer]]
kind = "image"
image = "registry.opensuse.org/opensuse/leap:15.5"

[[environment]]
name = "python-3.11"
provides = ["python-3.11"]
commands = ["python3"]

[[environment.layer]]
reference = "base"

[[environment.layer]]
directory = "/var/lib/warren/layers/python"
use-ldconfig = true
paths = [
    { action = "overlay", path = "/usr" },
    { action = "mount", path = "/tmp", fstype = "tmpfs" },
]

[[profile]]
name = "python3"
command = "/usr/bin/python3"
wrapper = "/usr/local/bin/python3"
environment = "python-3.11"
"#;

    #[test]
    fn parses_sample() {
        let config = Config::parse(SAMPLE, Path::new("sample.toml")).unwrap();
        assert_eq!(config.client_path, Some(PathBuf::from("/usr/bin/warren")));
        assert_eq!(config.environments.len(), 2);

        let python = config.environment("python-3.11").unwrap();
        assert_eq!(python.layers[0].kind, LayerKind::Reference);
        assert_eq!(python.layers[1].kind, LayerKind::Layer);
        assert!(python.layers[1].use_ldconfig);
        assert_eq!(python.layers[1].paths.len(), 2);
        assert_eq!(python.source, PathBuf::from("sample.toml"));

        let base = config.environment("base").unwrap();
        assert_eq!(base.layers[0].kind, LayerKind::Image);

        assert_eq!(config.profiles[0].environment.as_deref(), Some("python-3.11"));
    }

    #[test]
    fn write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.toml");

        let config = Config::parse(SAMPLE, &path).unwrap();
        config.write(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn duplicate_names_fail_with_file_context() {
        let text = r#"
[[environment]]
name = "a"
[[environment]]
name = "a"
"#;
        let err = Config::parse(text, Path::new("/etc/warren/dup.toml")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "/etc/warren/dup.toml: duplicate environment \"a\""
        );
    }

    #[test]
    fn syntax_errors_carry_location() {
        let err = Config::parse("[[environment]]\nname = ", Path::new("bad.toml")).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("bad.toml: "));
        assert!(message.contains("line 2"), "{message}");
    }

    #[test]
    fn invalid_layer_names_environment() {
        let text = r#"
[[environment]]
name = "broken"
[[environment.layer]]
use-ldconfig = true
"#;
        let err = Config::parse(text, Path::new("x.toml")).unwrap_err();
        assert!(err.to_string().contains("environment broken, layer 1"));
    }

    #[test]
    fn merge_rejects_duplicates_across_files() {
        let mut first = Config::parse("[[profile]]\nname = \"sh\"\n", Path::new("a.toml")).unwrap();
        let second = Config::parse("[[profile]]\nname = \"sh\"\n", Path::new("b.toml")).unwrap();
        let err = first.merge(second, Path::new("b.toml")).unwrap_err();
        assert!(err.to_string().starts_with("b.toml: duplicate profile"));
    }

    #[test]
    fn discover_merges_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = WarrenPaths::with_root(dir.path());
        let user = dir.path().join("user.toml");
        std::fs::write(&user, "[[environment]]\nname = \"mine\"\n").unwrap();
        std::fs::write(&paths.system_config, "[[environment]]\nname = \"system\"\n").unwrap();
        paths.user_config = Some(user);

        let config = Config::discover(None, &paths).unwrap();
        let names: Vec<_> = config.environments.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["mine", "system"]);
    }

    #[test]
    fn explicit_config_must_exist() {
        let paths = WarrenPaths::with_root("/nonexistent");
        let err = Config::discover(Some(Path::new("/nonexistent/config.toml")), &paths)
            .unwrap_err();
        assert!(matches!(err, WarrenError::Filesystem { .. }));
    }
}
