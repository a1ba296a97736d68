//! The rule language of the directory scanner.
//!
//! One rule per line: an action keyword and a path. `#` starts a comment.
//!
//! ```text
//! # shared libraries get their own cache
//! check-ldconfig
//! overlay-unless-empty /usr
//! ignore-empty-subdirs /etc
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use warren_common::{WarrenError, WarrenResult};

/// What a rule does with its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Overlay the path.
    Overlay,
    /// Overlay the path unless it holds nothing but empty directories.
    OverlayUnlessEmpty,
    /// Bind the path.
    Bind,
    /// Bind the path unless it holds nothing but empty directories.
    BindUnlessEmpty,
    /// Fail unless the directory holds nothing but empty directories.
    MustBeEmpty,
    /// Ignore the path and everything below it.
    Ignore,
    /// Ignore the directory if it turns out to be empty.
    IgnoreIfEmpty,
    /// Ignore the directory and any directory below it that turns out to be
    /// empty.
    IgnoreEmptySubdirs,
    /// Drop the layer's linker cache and regenerate it at setup time.
    CheckLdconfig,
    /// Mount a tmpfs at the path.
    MountTmpfs,
    /// Record the executables directly below the path.
    CheckBinaries,
}

impl RuleAction {
    const ALL: [Self; 11] = [
        Self::Overlay,
        Self::OverlayUnlessEmpty,
        Self::Bind,
        Self::BindUnlessEmpty,
        Self::MustBeEmpty,
        Self::Ignore,
        Self::IgnoreIfEmpty,
        Self::IgnoreEmptySubdirs,
        Self::CheckLdconfig,
        Self::MountTmpfs,
        Self::CheckBinaries,
    ];

    /// Keyword used in rule files.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::OverlayUnlessEmpty => "overlay-unless-empty",
            Self::Bind => "bind",
            Self::BindUnlessEmpty => "bind-unless-empty",
            Self::MustBeEmpty => "must-be-empty",
            Self::Ignore => "ignore",
            Self::IgnoreIfEmpty => "ignore-if-empty",
            Self::IgnoreEmptySubdirs => "ignore-empty-subdirs",
            Self::CheckLdconfig => "check-ldconfig",
            Self::MountTmpfs => "mount-tmpfs",
            Self::CheckBinaries => "check-binaries",
        }
    }

    /// Path used when the rule names none.
    const fn default_path(self) -> Option<&'static str> {
        match self {
            Self::CheckLdconfig => Some("/etc/ld.so.cache"),
            _ => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.keyword() == s)
            .ok_or_else(|| format!("unknown action \"{s}\""))
    }
}

/// One scanner rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// The action.
    pub action: RuleAction,
    /// Absolute path inside the scanned tree.
    pub path: PathBuf,
}

impl Rule {
    /// A rule applying `action` to `path`.
    pub fn new(action: RuleAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
        }
    }
}

/// Rules applied when no rule file is given.
pub const DEFAULT_RULES: &str = "\
# Per-layer linker cache
check-ldconfig /etc/ld.so.cache

overlay-unless-empty /etc/alternatives
ignore /etc/rc.d
ignore /etc/init.d
ignore-empty-subdirs /etc

ignore /dev/null
ignore-if-empty /dev
must-be-empty /boot

overlay-unless-empty /bin
overlay-unless-empty /sbin
overlay-unless-empty /lib
overlay-unless-empty /lib64
overlay-unless-empty /opt

ignore /usr/lib/sysimage/rpm
check-binaries /usr/bin
overlay-unless-empty /usr

# Package manager and runtime leftovers
ignore /var/cache
ignore /var/lib/zypp
ignore /var/lib/YaST2
ignore /var/log
ignore /var/run
overlay-unless-empty /var

ignore-if-empty /tmp
ignore-if-empty /run
ignore-if-empty /root
ignore-if-empty /home
";

/// Parse rule text; `source` names the file in errors.
pub fn parse_rules(text: &str, source: &Path) -> WarrenResult<Vec<Rule>> {
    let mut rules = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.split_once('#').map_or(line, |(before, _)| before);
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };

        let error = |message: String| {
            WarrenError::config(source, format!("line {}: {message}", index + 1))
        };

        let action = keyword.parse::<RuleAction>().map_err(error)?;
        let path = match words.next() {
            Some(path) => path,
            None => action
                .default_path()
                .ok_or_else(|| error(format!("{action} needs a path")))?,
        };
        if words.next().is_some() {
            return Err(error(format!("{action} takes a single path")));
        }
        if !path.starts_with('/') {
            return Err(error(format!("{path} must be an absolute path")));
        }

        rules.push(Rule::new(action, path));
    }
    Ok(rules)
}

/// Load a rule file.
pub fn load_rules(path: &Path) -> WarrenResult<Vec<Rule>> {
    let text = std::fs::read_to_string(path).map_err(|e| WarrenError::fs(path, e))?;
    parse_rules(&text, path)
}

/// The built-in rule set.
pub fn default_rules() -> Vec<Rule> {
    // The built-in text is covered by tests, so it always parses.
    parse_rules(DEFAULT_RULES, Path::new("<builtin>")).unwrap_or_default()
}
