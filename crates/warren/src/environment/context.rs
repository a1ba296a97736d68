//! The application context: every environment and profile by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use warren_common::{WarrenError, WarrenResult};

use super::{AsyncSetups, Environment, Profile, SetupEvent, SetupTools};
use crate::capability::{Capability, Registry};
use crate::config::{Config, EnvironmentConfig, LayerConfig, LayerKind};
use crate::namespace::{self, NamespaceFd};

/// Environments, profiles and the setups in flight.
#[derive(Debug, Default)]
pub struct Context {
    configs: Vec<EnvironmentConfig>,
    environments: Vec<Environment>,
    profiles: Vec<Profile>,
    client_path: Option<PathBuf>,
    setups: AsyncSetups,
}

impl Context {
    /// Build a context from validated configuration.
    pub fn from_config(config: &Config) -> WarrenResult<Self> {
        let mut context = Self::default();
        context.add_config(config)?;
        Ok(context)
    }

    /// Add the environments and profiles of `config`.
    ///
    /// Reference layers are resolved against everything known so far. On
    /// error nothing is added.
    pub fn add_config(&mut self, config: &Config) -> WarrenResult<()> {
        for env in &config.environments {
            if self.configs.iter().any(|known| known.name == env.name) {
                return Err(WarrenError::config(
                    &env.source,
                    format!("duplicate environment \"{}\"", env.name),
                ));
            }
        }

        let mut all = self.configs.clone();
        all.extend(config.environments.iter().cloned());
        let by_name = all
            .iter()
            .map(|env| (env.name.as_str(), env))
            .collect::<HashMap<_, _>>();

        let mut environments = Vec::with_capacity(config.environments.len());
        for env in &config.environments {
            let mut chain = vec![env.name.clone()];
            let layers = resolve_layers(&by_name, env, &mut chain)?;
            environments.push(Environment::from_config(env, layers));
        }

        let mut profiles = Vec::with_capacity(config.profiles.len());
        for profile in &config.profiles {
            if let Some(name) = &profile.environment {
                if !by_name.contains_key(name.as_str()) {
                    return Err(WarrenError::config(
                        &profile.source,
                        format!(
                            "profile {} references unknown environment {name}",
                            profile.name
                        ),
                    ));
                }
            }
            if self.profiles.iter().any(|p| p.name() == profile.name) {
                return Err(WarrenError::config(
                    &profile.source,
                    format!("duplicate profile \"{}\"", profile.name),
                ));
            }
            profiles.push(Profile::from_config(profile));
        }

        self.configs.extend(config.environments.iter().cloned());
        self.environments.extend(environments);
        self.profiles.extend(profiles);
        if self.client_path.is_none() {
            self.client_path.clone_from(&config.client_path);
        }
        Ok(())
    }

    /// Binary bound by `wormhole` directives.
    #[must_use]
    pub fn client_path(&self) -> PathBuf {
        self.client_path
            .clone()
            .unwrap_or_else(warren_common::paths::client_path)
    }

    /// All environments, in configuration order.
    #[must_use]
    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    /// All profiles, in configuration order.
    #[must_use]
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Environment by name.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|env| env.name() == name)
    }

    /// Mutable environment by name.
    pub fn environment_mut(&mut self, name: &str) -> Option<&mut Environment> {
        self.environments.iter_mut().find(|env| env.name() == name)
    }

    /// Add an environment built outside of configuration.
    pub fn insert_environment(&mut self, env: Environment) -> WarrenResult<()> {
        if self.environment(env.name()).is_some() {
            return Err(WarrenError::Internal {
                message: format!("environment {} already exists", env.name()),
            });
        }
        self.environments.push(env);
        Ok(())
    }

    /// Profile by name.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name() == name)
    }

    /// Find the profile for an invocation name.
    ///
    /// An absolute `argv0` is matched against wrapper paths first, then
    /// against command paths. Failing that, the basename must equal a
    /// profile name.
    #[must_use]
    pub fn find_profile(&self, argv0: &str) -> Option<&Profile> {
        if argv0.starts_with('/') {
            let path = Path::new(argv0);
            if let Some(profile) = self.profiles.iter().find(|p| p.wrapper() == Some(path)) {
                return Some(profile);
            }
            if let Some(profile) = self.profiles.iter().find(|p| p.command() == Some(path)) {
                return Some(profile);
            }
        }

        let name = Path::new(argv0).file_name()?.to_str()?;
        self.profile(name)
    }

    /// Resolve an environment by name, or else by capability through the
    /// registry. Configuration files found through the registry are added to
    /// the context. Returns the environment's name.
    pub fn resolve_environment(&mut self, wanted: &str, registry: &Registry) -> WarrenResult<String> {
        if self.environment(wanted).is_some() {
            return Ok(wanted.to_string());
        }

        let not_found = || WarrenError::EnvironmentNotFound {
            name: wanted.to_string(),
        };
        let requirement = Capability::parse(wanted).map_err(|_| not_found())?;
        let path = registry.best_match(wanted)?.ok_or_else(not_found)?;

        let mut config = Config::load(&path)?;
        let candidates = config.environments.clone();
        config
            .environments
            .retain(|env| self.configs.iter().all(|known| known.name != env.name));
        config.profiles.clear();
        self.add_config(&config)?;

        let provides = |env: &EnvironmentConfig| {
            env.provides.iter().any(|id| {
                Capability::parse(id).is_ok_and(|cap| cap.satisfies(&requirement))
            })
        };
        let chosen = candidates
            .iter()
            .find(|env| provides(env))
            .or_else(|| match candidates.as_slice() {
                [only] => Some(only),
                _ => None,
            })
            .ok_or_else(not_found)?;

        tracing::debug!(
            capability = wanted,
            environment = %chosen.name,
            config = %path.display(),
            "Resolved environment by capability"
        );
        Ok(chosen.name.clone())
    }

    /// Set up the environment of profile `name` in a new namespace.
    ///
    /// Profiles without an environment, or whose environment has no layers,
    /// run in the host namespace and `None` is returned.
    pub fn setup_profile(
        &mut self,
        name: &str,
        privileged: bool,
        tools: SetupTools<'_>,
    ) -> WarrenResult<Option<&Environment>> {
        let profile = self.profile(name).ok_or_else(|| WarrenError::ProfileNotFound {
            name: name.to_string(),
        })?;
        let Some(env_name) = profile.environment().map(str::to_string) else {
            return Ok(None);
        };
        if self.setups.in_progress(&env_name) {
            return Err(WarrenError::SetupInProgress { name: env_name });
        }

        let env = self
            .environment_mut(&env_name)
            .ok_or_else(|| WarrenError::EnvironmentNotFound {
                name: env_name.clone(),
            })?;
        if env.layers().is_empty() {
            return Ok(None);
        }
        if env.is_failed() {
            return Err(WarrenError::EnvironmentFailed { name: env_name });
        }

        namespace::enter_private_namespace(privileged)?;
        env.setup(tools)?;
        Ok(Some(&*env))
    }

    /// Record a setup helper started for `environment`.
    pub fn begin_async_setup(
        &mut self,
        environment: &str,
        child_pid: u32,
        socket_id: u64,
    ) -> WarrenResult<()> {
        let env = self
            .environment(environment)
            .ok_or_else(|| WarrenError::EnvironmentNotFound {
                name: environment.to_string(),
            })?;
        if env.is_failed() {
            return Err(WarrenError::EnvironmentFailed {
                name: environment.to_string(),
            });
        }
        self.setups.begin(environment, child_pid, socket_id)
    }

    /// Whether `environment` has a setup in flight.
    #[must_use]
    pub fn setup_in_progress(&self, environment: &str) -> bool {
        self.setups.in_progress(environment)
    }

    /// Whether `environment` is set up and usable.
    #[must_use]
    pub fn is_ready(&self, environment: &str) -> bool {
        !self.setups.in_progress(environment)
            && self
                .environment(environment)
                .is_some_and(|env| !env.is_failed() && env.has_namespace())
    }

    /// A setup helper exited.
    pub fn async_child_exited(&mut self, pid: u32, status: ExitStatus) -> Option<&Environment> {
        let event = self.setups.child_exited(pid, status)?;
        self.apply_event(event, None)
    }

    /// A setup helper sent its namespace descriptor.
    pub fn async_fd_received(&mut self, socket_id: u64, fd: NamespaceFd) -> Option<&Environment> {
        let event = self.setups.fd_received(socket_id)?;
        self.apply_event(event, Some(fd))
    }

    /// A setup helper's socket closed.
    pub fn async_socket_closed(&mut self, socket_id: u64) -> Option<&Environment> {
        let event = self.setups.socket_closed(socket_id)?;
        self.apply_event(event, None)
    }

    fn apply_event(&mut self, event: SetupEvent, fd: Option<NamespaceFd>) -> Option<&Environment> {
        match event {
            SetupEvent::ChildSucceeded { environment } => self.environment(&environment),
            SetupEvent::Failed { environment, .. } => {
                let env = self.environment_mut(&environment)?;
                env.mark_failed();
                Some(&*env)
            }
            SetupEvent::NamespaceReceived { environment } => {
                let env = self.environment_mut(&environment)?;
                if let Some(fd) = fd {
                    env.set_namespace_fd(fd);
                }
                Some(&*env)
            }
        }
    }
}

/// Layers of `env` with references replaced by the referenced layers.
fn resolve_layers(
    by_name: &HashMap<&str, &EnvironmentConfig>,
    env: &EnvironmentConfig,
    chain: &mut Vec<String>,
) -> WarrenResult<Vec<LayerConfig>> {
    let mut layers = Vec::new();
    for layer in &env.layers {
        if layer.kind != LayerKind::Reference {
            layers.push(layer.clone());
            continue;
        }

        let target = layer.reference.as_deref().unwrap_or_default();
        if chain.iter().any(|name| name == target) {
            return Err(WarrenError::config(
                &env.source,
                format!("reference cycle {} -> {target}", chain.join(" -> ")),
            ));
        }
        let lower = by_name.get(target).ok_or_else(|| {
            WarrenError::config(
                &env.source,
                format!(
                    "environment {} references lower layer \"{target}\", which does not exist",
                    env.name
                ),
            )
        })?;

        chain.push(target.to_string());
        layers.extend(resolve_layers(by_name, lower, chain)?);
        chain.pop();
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    const CONFIG: &str = r#"
        [[environment]]
        name = "base"
        provides = ["base-1.0"]

        [[environment.layer]]
        directory = "/layers/base"
        paths = [{ action = "overlay", path = "/usr" }]

        [[environment]]
        name = "python"
        provides = ["python-3.11"]

        [[environment.layer]]
        reference = "base"

        [[environment.layer]]
        directory = "/layers/python"
        paths = [{ action = "bind", path = "/usr/lib/python3.11" }]

        [[profile]]
        name = "python3"
        command = "/usr/bin/python3"
        wrapper = "/usr/local/bin/python3"
        environment = "python"

        [[profile]]
        name = "host-ls"
        command = "/bin/ls"
    "#;

    fn context() -> Context {
        let config = Config::parse(CONFIG, Path::new("/etc/warren/test.toml")).unwrap();
        Context::from_config(&config).unwrap()
    }

    #[test]
    fn references_are_spliced() {
        let ctx = context();
        let python = ctx.environment("python").unwrap();
        let dirs = python
            .layers()
            .iter()
            .map(|l| l.directory.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/layers/base"), PathBuf::from("/layers/python")]
        );
        assert!(python.layers().iter().all(|l| l.kind != LayerKind::Reference));
    }

    #[test]
    fn reference_cycles_are_rejected() {
        let config = Config::parse(
            r#"
            [[environment]]
            name = "a"
            [[environment.layer]]
            reference = "b"

            [[environment]]
            name = "b"
            [[environment.layer]]
            reference = "a"
            "#,
            Path::new("/tmp/cycle.toml"),
        )
        .unwrap();
        let err = Context::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("reference cycle a -> b -> a"), "{err}");
    }

    #[test]
    fn unknown_references_are_rejected() {
        let config = Config::parse(
            r#"
            [[environment]]
            name = "a"
            [[environment.layer]]
            reference = "missing"
            "#,
            Path::new("/tmp/missing.toml"),
        )
        .unwrap();
        let err = Context::from_config(&config).unwrap_err();
        assert!(err.to_string().starts_with("/tmp/missing.toml: "), "{err}");
    }

    #[test]
    fn profiles_need_known_environments() {
        let config = Config::parse(
            r#"
            [[profile]]
            name = "x"
            environment = "nowhere"
            "#,
            Path::new("/tmp/p.toml"),
        )
        .unwrap();
        assert!(matches!(
            Context::from_config(&config),
            Err(WarrenError::Config { .. })
        ));
    }

    #[test]
    fn find_profile_by_wrapper_command_and_basename() {
        let ctx = context();
        assert_eq!(
            ctx.find_profile("/usr/local/bin/python3").unwrap().name(),
            "python3"
        );
        assert_eq!(ctx.find_profile("/usr/bin/python3").unwrap().name(), "python3");
        assert_eq!(ctx.find_profile("/opt/bin/python3").unwrap().name(), "python3");
        assert_eq!(ctx.find_profile("host-ls").unwrap().name(), "host-ls");
        assert!(ctx.find_profile("/usr/bin/perl").is_none());
    }

    #[test]
    fn resolve_by_capability() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ruby.toml");
        fs::write(
            &config_path,
            r#"
            [[environment]]
            name = "ruby"
            provides = ["ruby-3.2"]
            [[environment.layer]]
            directory = "/layers/ruby"
            "#,
        )
        .unwrap();
        let registry = Registry::new(dir.path().join("capability"));
        registry.register(&["ruby-3.2"], &config_path).unwrap();

        let mut ctx = context();
        assert_eq!(ctx.resolve_environment("python", &registry).unwrap(), "python");
        assert_eq!(ctx.resolve_environment("ruby-3.0", &registry).unwrap(), "ruby");
        assert!(ctx.environment("ruby").is_some());
        // A second lookup finds the now known environment by capability again.
        assert_eq!(ctx.resolve_environment("ruby-3.1", &registry).unwrap(), "ruby");
        assert!(matches!(
            ctx.resolve_environment("ruby-4", &registry),
            Err(WarrenError::EnvironmentNotFound { .. })
        ));
    }

    #[test]
    fn async_setup_round_trip() {
        let mut ctx = context();
        ctx.begin_async_setup("python", 42, 7).unwrap();
        assert!(ctx.setup_in_progress("python"));
        assert!(!ctx.is_ready("python"));

        let env = ctx.async_fd_received(7, NamespaceFd::current().unwrap());
        assert!(env.is_some_and(Environment::has_namespace));
        ctx.async_child_exited(42, ExitStatus::from_raw(0));
        assert!(ctx.is_ready("python"));
    }

    #[test]
    fn async_setup_failure_marks_environment() {
        let mut ctx = context();
        ctx.begin_async_setup("python", 42, 7).unwrap();
        ctx.async_child_exited(42, ExitStatus::from_raw(1 << 8));
        assert!(ctx.environment("python").unwrap().is_failed());
        assert!(!ctx.is_ready("python"));
        assert!(matches!(
            ctx.begin_async_setup("python", 43, 8),
            Err(WarrenError::EnvironmentFailed { .. })
        ));
    }

    #[test]
    fn host_profiles_need_no_setup() {
        let mut ctx = context();
        let runtime = crate::runtime::testing::FakeRuntime::default();
        let mounter = crate::filesystem::testing::RecordingMounter::new();
        let tools = SetupTools {
            client_path: Path::new("/usr/bin/warren"),
            runtime: &runtime,
            mounter: &mounter,
        };
        assert!(ctx.setup_profile("host-ls", false, tools).unwrap().is_none());
        assert!(matches!(
            ctx.setup_profile("nope", false, tools),
            Err(WarrenError::ProfileNotFound { .. })
        ));
    }
}
