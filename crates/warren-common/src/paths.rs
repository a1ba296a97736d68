//! Standard filesystem locations for warren.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default state directory holding the capability and command registries.
pub static WARREN_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("WARREN_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/warren"))
});

/// Default system-wide configuration file.
pub static WARREN_SYSTEM_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("WARREN_SYSTEM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/warren/warren.toml"))
});

/// Locations used by warren.
#[derive(Debug, Clone)]
pub struct WarrenPaths {
    /// State directory (default: /var/lib/warren).
    pub state: PathBuf,
    /// System configuration file (default: /etc/warren/warren.toml).
    pub system_config: PathBuf,
    /// Per-user configuration file (default: ~/.warren/config.toml).
    pub user_config: Option<PathBuf>,
}

impl WarrenPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted at a custom state directory.
    ///
    /// Configuration files are placed below the same directory, which keeps
    /// tests and scratch setups away from `/etc`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let state = root.into();
        Self {
            system_config: state.join("warren.toml"),
            user_config: None,
            state,
        }
    }

    /// Registry of capability symlinks.
    #[must_use]
    pub fn capability_dir(&self) -> PathBuf {
        self.state.join("capability")
    }

    /// Registry of command symlinks.
    #[must_use]
    pub fn command_dir(&self) -> PathBuf {
        self.state.join("command")
    }

    /// Default location of per-layer data.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.state.join("layers")
    }

    /// Create the registry directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.capability_dir())?;
        std::fs::create_dir_all(self.command_dir())?;
        Ok(())
    }
}

impl Default for WarrenPaths {
    fn default() -> Self {
        Self {
            state: WARREN_STATE_DIR.clone(),
            system_config: WARREN_SYSTEM_CONFIG.clone(),
            user_config: dirs::home_dir().map(|home| home.join(".warren").join("config.toml")),
        }
    }
}

/// Path of the running client binary, used for wormhole binds.
#[must_use]
pub fn client_path() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/usr/bin/warren"))
}
