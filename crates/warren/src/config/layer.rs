//! Layer and path directive configuration.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How a layer contributes to an environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    /// A directory or image whose content is grafted onto the root.
    #[default]
    Layer,
    /// A container image that becomes the root itself (bottom layer only).
    Image,
    /// The layers of another environment, spliced in at load time.
    Reference,
}

impl LayerKind {
    const fn is_layer(&self) -> bool {
        matches!(self, Self::Layer)
    }
}

/// Details of a `mount` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDetails {
    /// Filesystem type.
    pub fstype: String,
    /// Mount source; defaults to the filesystem type.
    pub device: Option<String>,
    /// Mount data string.
    pub options: Option<String>,
}

/// What to do with a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAction {
    /// Hide the path (not implemented).
    Hide,
    /// Bind mount the path from the layer.
    Bind,
    /// Bind each child of the directory into a private overlay.
    BindChildren,
    /// Overlay the layer's directory over the existing one.
    Overlay,
    /// Overlay child directories and bind other children.
    OverlayChildren,
    /// Mount a virtual filesystem.
    Mount(MountDetails),
    /// Bind the client binary.
    Wormhole,
}

impl PathAction {
    /// Directive keyword as written in configuration files.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Hide => "hide",
            Self::Bind => "bind",
            Self::BindChildren => "bind-children",
            Self::Overlay => "overlay",
            Self::OverlayChildren => "overlay-children",
            Self::Mount(_) => "mount",
            Self::Wormhole => "wormhole",
        }
    }
}

/// One path directive of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPathInfo", into = "RawPathInfo")]
pub struct PathInfo {
    /// Absolute path, possibly a glob pattern.
    pub path: PathBuf,
    /// What to do with it.
    pub action: PathAction,
}

impl PathInfo {
    /// Create a directive.
    pub fn new(action: PathAction, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RawAction {
    Hide,
    Bind,
    BindChildren,
    Overlay,
    OverlayChildren,
    Mount,
    Wormhole,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPathInfo {
    action: RawAction,
    path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<String>,
}

impl TryFrom<RawPathInfo> for PathInfo {
    type Error = String;

    fn try_from(raw: RawPathInfo) -> Result<Self, Self::Error> {
        if !raw.path.is_absolute() {
            return Err(format!(
                "path {} must be absolute",
                raw.path.display()
            ));
        }
        if raw
            .path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(format!(
                "path {} must be normalized",
                raw.path.display()
            ));
        }

        let action = match raw.action {
            RawAction::Hide => PathAction::Hide,
            RawAction::Bind => PathAction::Bind,
            RawAction::BindChildren => PathAction::BindChildren,
            RawAction::Overlay => PathAction::Overlay,
            RawAction::OverlayChildren => PathAction::OverlayChildren,
            RawAction::Wormhole => PathAction::Wormhole,
            RawAction::Mount => {
                let fstype = raw.fstype.clone().ok_or_else(|| {
                    format!("mount of {} needs an fstype", raw.path.display())
                })?;
                PathAction::Mount(MountDetails {
                    fstype,
                    device: raw.device.clone(),
                    options: raw.options.clone(),
                })
            }
        };

        if !matches!(action, PathAction::Mount(_))
            && (raw.fstype.is_some() || raw.device.is_some() || raw.options.is_some())
        {
            return Err(format!(
                "{} directive for {} takes no mount details",
                action.keyword(),
                raw.path.display()
            ));
        }

        Ok(Self {
            path: raw.path,
            action,
        })
    }
}

impl From<PathInfo> for RawPathInfo {
    fn from(info: PathInfo) -> Self {
        let (action, details) = match info.action {
            PathAction::Hide => (RawAction::Hide, None),
            PathAction::Bind => (RawAction::Bind, None),
            PathAction::BindChildren => (RawAction::BindChildren, None),
            PathAction::Overlay => (RawAction::Overlay, None),
            PathAction::OverlayChildren => (RawAction::OverlayChildren, None),
            PathAction::Mount(details) => (RawAction::Mount, Some(details)),
            PathAction::Wormhole => (RawAction::Wormhole, None),
        };
        let (fstype, device, options) = match details {
            Some(d) => (Some(d.fstype), d.device, d.options),
            None => (None, None, None),
        };
        Self {
            action,
            path: info.path,
            fstype,
            device,
            options,
        }
    }
}

/// One layer of an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LayerConfig {
    /// Layer kind; a `reference` key implies [`LayerKind::Reference`].
    #[serde(default, skip_serializing_if = "LayerKind::is_layer")]
    pub kind: LayerKind,
    /// Directory holding the layer's files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Container image providing the layer's files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Environment whose layers to splice in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Regenerate and bind the layer's own `ld.so.cache`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_ldconfig: bool,
    /// Path directives, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathInfo>,
}

impl LayerConfig {
    /// A directory layer with no directives.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(dir.into()),
            ..Self::default()
        }
    }

    /// A reference to another environment.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            kind: LayerKind::Reference,
            reference: Some(name.into()),
            ..Self::default()
        }
    }

    /// Append a directive.
    pub fn add_path(&mut self, action: PathAction, path: impl Into<PathBuf>) -> &mut PathInfo {
        self.paths.push(PathInfo::new(action, path));
        let last = self.paths.len() - 1;
        &mut self.paths[last]
    }

    /// Check the source fields and settle `kind`.
    ///
    /// A relative directory is taken relative to `base_dir`, the directory of
    /// the file the layer was read from.
    pub(super) fn normalize(&mut self, base_dir: &Path) -> Result<(), String> {
        let sources = [
            self.directory.is_some(),
            self.image.is_some(),
            self.reference.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if sources != 1 {
            return Err("a layer needs exactly one of directory, image or reference".to_string());
        }

        if self.reference.is_some() {
            if self.kind == LayerKind::Image {
                return Err("an image layer cannot be a reference".to_string());
            }
            self.kind = LayerKind::Reference;
            if self.use_ldconfig || !self.paths.is_empty() {
                return Err("a reference layer takes no paths or use-ldconfig".to_string());
            }
        } else if self.kind == LayerKind::Reference {
            return Err("a reference layer needs a reference".to_string());
        } else if self.kind == LayerKind::Image && self.image.is_none() {
            return Err("an image layer needs an image".to_string());
        }

        if let Some(dir) = &mut self.directory {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
            if !dir.is_absolute() {
                return Err(format!("layer directory {} must be absolute", dir.display()));
            }
        }
        Ok(())
    }

    /// Source directory, if this is a directory layer.
    #[must_use]
    pub fn directory_path(&self) -> Option<&Path> {
        self.directory.as_deref()
    }
}
