//! Deriving a layer configuration from a prepared directory tree.
//!
//! A [`Scanner`] applies [rules](rules) to a tree, usually the output of the
//! digger, and emits the directives of one layer. Whatever no rule accounts
//! for is reported as a stray, and strays fail the scan.

mod rules;
mod strays;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use crate::assemble::{DIGGER_CONFIG, TREE_DIR};
use crate::config::{Config, EnvironmentConfig, LayerConfig, MountDetails, PathAction};
use crate::filesystem::util;
use crate::pathstate::PathTree;

pub use rules::{DEFAULT_RULES, Rule, RuleAction, default_rules, load_rules, parse_rules};
pub use strays::{Disposition, find_strays};

/// Output file name used for digger trees when asked to pick one.
pub const AUTO_OUTPUT: &str = "environ.toml";

/// What a scan produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// The derived layer, with the scanned directory as its source.
    pub layer: LayerConfig,
    /// Unaccounted paths, sorted.
    pub strays: Vec<PathBuf>,
    /// Number of strays.
    pub stray_count: usize,
    /// Executables found by `check-binaries` rules.
    pub binaries: Vec<String>,
}

/// The directory to scan, and what the digger left next to it.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    /// Directory given by the user.
    pub root: PathBuf,
    /// Directory the layer is made of.
    pub tree: PathBuf,
    /// The digger's environment definition, if this is digger output.
    pub digger: Option<EnvironmentConfig>,
}

impl ScanTarget {
    /// Recognise digger output: a `tree/` directory next to a
    /// `.digger.toml`. Anything else is scanned as is.
    pub fn locate(root: &Path) -> WarrenResult<Self> {
        let root = std::fs::canonicalize(root).map_err(|e| WarrenError::fs(root, e))?;
        let tree = root.join(TREE_DIR);
        let digger_config = root.join(DIGGER_CONFIG);

        if tree.is_dir() && digger_config.is_file() {
            tracing::info!(
                root = %root.display(),
                "Digger output, scanning {}",
                tree.display()
            );
            let config = Config::load(&digger_config)?;
            return Ok(Self {
                digger: config.environments.into_iter().next(),
                tree,
                root,
            });
        }

        Ok(Self {
            tree: root.clone(),
            root,
            digger: None,
        })
    }

    /// Name for the environment: explicit, from the digger, or the root's
    /// basename.
    #[must_use]
    pub fn environment_name(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| self.digger.as_ref().map(|env| env.name.clone()))
            .or_else(|| {
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "auto".to_string())
    }

    /// Where `--output auto` writes to. Only digger output has a default.
    #[must_use]
    pub fn auto_output(&self) -> Option<PathBuf> {
        self.digger.as_ref().map(|_| self.root.join(AUTO_OUTPUT))
    }

    /// An environment definition made of the scanned layer, keeping what
    /// the digger recorded.
    #[must_use]
    pub fn environment(&self, name: String, report: &ScanReport) -> EnvironmentConfig {
        let (provides, requires) = self
            .digger
            .as_ref()
            .map(|env| (env.provides.clone(), env.requires.clone()))
            .unwrap_or_default();
        EnvironmentConfig {
            name,
            provides,
            requires,
            commands: report.binaries.clone(),
            layers: vec![report.layer.clone()],
            source: PathBuf::new(),
        }
    }
}

/// Applies rules to a directory tree.
#[derive(Debug, Clone)]
pub struct Scanner {
    rules: Vec<Rule>,
    check_strays: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Scanner {
    /// A scanner with these rules; strays fail the scan.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            check_strays: true,
        }
    }

    /// Whether strays fail the scan.
    #[must_use]
    pub fn check_strays(mut self, check: bool) -> Self {
        self.check_strays = check;
        self
    }

    /// Scan `root` and derive its layer.
    ///
    /// `check-ldconfig` removes the layer's `ld.so.cache` from `root`.
    pub fn scan(&self, root: &Path) -> WarrenResult<ScanReport> {
        let mut scan = Scan {
            root,
            tree: PathTree::with_root_dir(root),
            layer: LayerConfig::directory(root),
            binaries: Vec::new(),
        };

        for rule in &self.rules {
            tracing::debug!(action = %rule.action, path = %rule.path.display(), "Applying rule");
            scan.apply(rule)?;
        }

        if scan.layer.paths.is_empty() {
            return Err(WarrenError::scan(root, "did not find anything interesting"));
        }

        let strays = find_strays(root, &mut scan.tree)?;
        let stray_count = strays.len();
        if stray_count > 0 {
            tracing::warn!(count = stray_count, "Found stray files");
            if self.check_strays {
                return Err(WarrenError::stray_files(strays));
            }
        }

        scan.binaries.sort();
        scan.binaries.dedup();
        Ok(ScanReport {
            layer: scan.layer,
            strays,
            stray_count,
            binaries: scan.binaries,
        })
    }
}

/// State of one scan.
struct Scan<'a> {
    root: &'a Path,
    tree: PathTree<Disposition>,
    layer: LayerConfig,
    binaries: Vec<String>,
}

impl Scan<'_> {
    fn real_path(&self, path: &Path) -> PathBuf {
        util::reroot(self.root, path)
    }

    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(self.real_path(path)).is_ok()
    }

    fn apply(&mut self, rule: &Rule) -> WarrenResult<()> {
        let path = rule.path.as_path();
        match rule.action {
            RuleAction::Overlay => self.add(path, PathAction::Overlay),
            RuleAction::Bind => self.add(path, PathAction::Bind),
            RuleAction::OverlayUnlessEmpty => self.add_unless_empty(path, PathAction::Overlay)?,
            RuleAction::BindUnlessEmpty => self.add_unless_empty(path, PathAction::Bind)?,
            RuleAction::MustBeEmpty => {
                if self.exists(path) {
                    if !self.is_empty(path)? {
                        return Err(WarrenError::scan(
                            self.real_path(path),
                            "directory should be empty but is not",
                        ));
                    }
                    self.tree.set_ignored(path);
                }
            }
            RuleAction::Ignore => {
                self.tree.set_ignored(path);
            }
            RuleAction::IgnoreIfEmpty => {
                self.tree.set_user_data(path, Disposition::IgnoreIfEmpty);
            }
            RuleAction::IgnoreEmptySubdirs => {
                self.tree
                    .set_user_data(path, Disposition::IgnoreEmptySubdirs);
            }
            RuleAction::CheckLdconfig => {
                let cache = self.real_path(path);
                if std::fs::symlink_metadata(&cache).is_ok_and(|m| m.is_file()) {
                    tracing::info!(path = %cache.display(), "Removing linker cache, it is regenerated per layer");
                    std::fs::remove_file(&cache).map_err(|e| WarrenError::fs(&cache, e))?;
                    self.layer.use_ldconfig = true;
                }
            }
            RuleAction::MountTmpfs => {
                self.layer.add_path(
                    PathAction::Mount(MountDetails {
                        fstype: "tmpfs".to_string(),
                        device: None,
                        options: None,
                    }),
                    path,
                );
                self.tree.set_system_mount(path, "tmpfs", None);
            }
            RuleAction::CheckBinaries => self.check_binaries(path)?,
        }
        Ok(())
    }

    fn add(&mut self, path: &Path, action: PathAction) {
        if !self.exists(path) {
            tracing::debug!(path = %path.display(), "Not present, skipping");
            return;
        }

        match action {
            PathAction::Bind => {
                self.tree.set_bind_mounted(path);
            }
            _ => {
                let upper = self.real_path(path);
                self.tree.set_fake_overlay_mounted(path, Some(upper));
            }
        }
        self.layer.add_path(action, path);
    }

    fn add_unless_empty(&mut self, path: &Path, action: PathAction) -> WarrenResult<()> {
        if !self.exists(path) {
            tracing::debug!(path = %path.display(), "Not present, skipping");
            return Ok(());
        }
        if self.is_empty(path)? {
            tracing::debug!(path = %path.display(), "Empty, ignoring");
            self.tree.set_ignored(path);
            return Ok(());
        }
        self.add(path, action);
        Ok(())
    }

    /// Whether `path` holds nothing but empty directories, not counting
    /// anything already ignored.
    fn is_empty(&self, path: &Path) -> WarrenResult<bool> {
        let real = self.real_path(path);
        if !real.is_dir() {
            return Ok(false);
        }

        let mut entries = walkdir::WalkDir::new(&real).min_depth(1).into_iter();
        while let Some(entry) = entries.next() {
            let entry = entry.map_err(|e| {
                let failed = e.path().unwrap_or(&real).to_path_buf();
                WarrenError::fs(failed, std::io::Error::other(e))
            })?;
            let logical = util::strip_path_prefix(entry.path(), self.root).unwrap_or_default();
            if self.tree.get(&logical).is_some_and(|s| !s.is_unchanged()) {
                if entry.file_type().is_dir() {
                    entries.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_dir() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_binaries(&mut self, path: &Path) -> WarrenResult<()> {
        let dir = self.real_path(path);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(WarrenError::fs(&dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| WarrenError::fs(&dir, e))?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                let name = entry.file_name().to_string_lossy().into_owned();
                tracing::debug!(binary = %name, "Found executable");
                self.binaries.push(name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::pathstate::PathState;

    fn touch(root: &Path, path: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, "").unwrap();
    }

    fn rules(text: &str) -> Vec<Rule> {
        parse_rules(text, Path::new("test.rules")).unwrap()
    }

    #[test]
    fn stray_file_fails_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "usr/bin/tool");
        touch(dir.path(), "etc/unexpected.conf");

        let scanner = Scanner::new(rules("overlay /usr\n"));
        match scanner.scan(dir.path()).unwrap_err() {
            WarrenError::StrayFiles { count, paths } => {
                assert_eq!(count, 1);
                assert_eq!(paths, vec![PathBuf::from("/etc/unexpected.conf")]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let report = scanner.check_strays(false).scan(dir.path()).unwrap();
        assert_eq!(report.stray_count, 1);
    }

    #[test]
    fn ignore_empty_subdirs_hides_empty_etc() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "usr/bin/tool");
        fs::create_dir_all(dir.path().join("etc/sysconfig")).unwrap();

        let report = Scanner::new(rules("overlay /usr\nignore-empty-subdirs /etc\n"))
            .scan(dir.path())
            .unwrap();
        assert_eq!(report.stray_count, 0);
        assert_eq!(report.layer.paths.len(), 1);
        assert_eq!(report.layer.directory_path(), Some(dir.path()));
    }

    #[test]
    fn unless_empty_rules_skip_empty_trees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("opt/empty/deeper")).unwrap();
        touch(dir.path(), "usr/lib/libfoo.so");
        touch(dir.path(), "var/cache/zypp/raw");

        let report = Scanner::new(rules(
            "overlay-unless-empty /opt\n\
             bind-unless-empty /usr/lib\n\
             ignore /var/cache\n\
             overlay-unless-empty /var\n\
             overlay-unless-empty /missing\n",
        ))
        .scan(dir.path())
        .unwrap();

        let directives = report
            .layer
            .paths
            .iter()
            .map(|info| (info.action.clone(), info.path.clone()))
            .collect::<Vec<_>>();
        assert_eq!(directives, vec![(PathAction::Bind, PathBuf::from("/usr/lib"))]);
        assert_eq!(report.stray_count, 0);
    }

    #[test]
    fn must_be_empty_rejects_content() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "boot/vmlinuz");
        let err = Scanner::new(rules("overlay /usr\nmust-be-empty /boot\n"))
            .scan(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("should be empty"), "{err}");
    }

    #[test]
    fn ldconfig_tmpfs_and_binaries() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "etc/ld.so.cache");
        touch(dir.path(), "usr/bin/python3");
        touch(dir.path(), "usr/bin/README");
        fs::set_permissions(
            dir.path().join("usr/bin/python3"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("var/tmp")).unwrap();

        let report = Scanner::new(rules(
            "check-ldconfig\n\
             ignore-if-empty /etc\n\
             check-binaries /usr/bin\n\
             overlay /usr\n\
             mount-tmpfs /var/tmp\n\
             ignore-if-empty /var\n",
        ))
        .scan(dir.path())
        .unwrap();

        assert!(report.layer.use_ldconfig);
        assert!(!dir.path().join("etc/ld.so.cache").exists());
        assert_eq!(report.binaries, vec!["python3"]);
        assert_eq!(report.layer.paths.len(), 2);
        assert!(matches!(report.layer.paths[1].action, PathAction::Mount(_)));
        assert_eq!(report.stray_count, 0);
    }

    #[test]
    fn nothing_interesting_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scanner::default().scan(dir.path()).unwrap_err();
        assert!(err.to_string().ends_with("did not find anything interesting"));
    }

    #[test]
    fn default_rules_accept_typical_digger_tree() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "usr/lib64/python3.11/site-packages/numpy/__init__.py");
        touch(dir.path(), "etc/ld.so.cache");
        touch(dir.path(), "var/log/zypp/history");
        fs::create_dir_all(dir.path().join("etc/alternatives")).unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();

        let report = Scanner::default().scan(dir.path()).unwrap();
        assert!(report.layer.use_ldconfig);
        assert_eq!(report.layer.paths.len(), 1);
        assert_eq!(report.layer.paths[0].path, PathBuf::from("/usr"));
    }

    #[test]
    fn locate_recognises_digger_output() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("numpy");
        fs::create_dir_all(root.join("tree/usr")).unwrap();
        fs::write(
            root.join(DIGGER_CONFIG),
            "[[environment]]\nname = \"numpy\"\nprovides = [\"numpy-1.26\"]\n\n\
             [[environment.layer]]\ndirectory = \"tree\"\n",
        )
        .unwrap();

        let target = ScanTarget::locate(&root).unwrap();
        let root = fs::canonicalize(&root).unwrap();
        assert_eq!(target.tree, root.join("tree"));
        assert_eq!(target.environment_name(None), "numpy");
        assert_eq!(target.auto_output(), Some(root.join(AUTO_OUTPUT)));

        let report = ScanReport {
            layer: LayerConfig::directory(&target.tree),
            strays: Vec::new(),
            stray_count: 0,
            binaries: vec!["f2py".to_string()],
        };
        let env = target.environment("numpy".to_string(), &report);
        assert_eq!(env.provides, vec!["numpy-1.26"]);
        assert_eq!(env.commands, vec!["f2py"]);
    }

    #[test]
    fn plain_directories_are_scanned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let target = ScanTarget::locate(dir.path()).unwrap();
        assert_eq!(target.tree, target.root);
        assert!(target.auto_output().is_none());
        assert_eq!(target.environment_name(Some("mine")), "mine");
    }

    #[test]
    fn overlay_marks_tree_with_real_upper() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "opt/app/bin");
        let mut scan = Scan {
            root: dir.path(),
            tree: PathTree::with_root_dir(dir.path()),
            layer: LayerConfig::directory(dir.path()),
            binaries: Vec::new(),
        };
        scan.apply(&Rule::new(RuleAction::Overlay, "/opt")).unwrap();
        assert_eq!(
            scan.tree.get("/opt"),
            Some(&PathState::FakeOverlayMounted {
                upperdir: Some(dir.path().join("opt"))
            })
        );
    }
}
