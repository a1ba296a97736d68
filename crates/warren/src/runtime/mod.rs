//! Container runtime facade.
//!
//! Layers may name a container image instead of a directory. The runtime is
//! only asked to turn such an image into a mounted directory; everything else
//! about containers is out of scope.

mod podman;

use std::path::PathBuf;

use warren_common::{WarrenError, WarrenResult};

pub use podman::Podman;

/// The three operations warren needs from a container engine.
pub trait ContainerRuntime {
    /// Whether a local container with this name exists.
    fn container_exists(&self, local_name: &str) -> WarrenResult<bool>;

    /// Create a local container `local_name` from `image`.
    fn container_start(&self, image: &str, local_name: &str) -> WarrenResult<()>;

    /// Mount the container's filesystem and return the mount point.
    fn container_mount(&self, local_name: &str) -> WarrenResult<PathBuf>;
}

/// Local container name used for `image`.
///
/// The tag is dropped at the first `:` and slashes become underscores, so
/// `registry.io/leap:15` maps to `warren_registry.io_leap`.
#[must_use]
pub fn local_container_name(image: &str) -> String {
    let untagged = image.split(':').next().unwrap_or(image);
    format!("warren_{}", untagged.replace('/', "_"))
}

/// Make sure a container for `image` exists and return its mounted root.
pub fn mount_image(runtime: &dyn ContainerRuntime, image: &str) -> WarrenResult<PathBuf> {
    let local_name = local_container_name(image);
    if !runtime.container_exists(&local_name)? {
        tracing::info!(image, container = %local_name, "Creating container");
        runtime.container_start(image, &local_name)?;
    }

    let root = runtime.container_mount(&local_name)?;
    tracing::debug!(image, root = %root.display(), "Mounted container image");
    Ok(root)
}

/// Pick a runtime by name (`default` or `podman`).
pub fn select_runtime(name: &str) -> WarrenResult<Box<dyn ContainerRuntime>> {
    match name {
        "default" | "podman" => Ok(Box::new(Podman::default())),
        other => Err(WarrenError::Container {
            message: format!("unknown container runtime \"{other}\""),
        }),
    }
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::testing::FakeRuntime;
    use super::*;

    #[test]
    fn local_names() {
        assert_eq!(
            local_container_name("registry.opensuse.org/opensuse/leap:15.5"),
            "warren_registry.opensuse.org_opensuse_leap"
        );
        assert_eq!(local_container_name("busybox"), "warren_busybox");
    }

    #[test]
    fn mount_image_creates_missing_container_once() {
        let runtime = FakeRuntime::new(Path::new("/containers"));

        let root = mount_image(&runtime, "busybox:latest").unwrap();
        assert_eq!(root, PathBuf::from("/containers/warren_busybox"));
        mount_image(&runtime, "busybox:latest").unwrap();

        assert_eq!(
            *runtime.calls.borrow(),
            vec![
                "exists warren_busybox",
                "start busybox:latest warren_busybox",
                "mount warren_busybox",
                "exists warren_busybox",
                "mount warren_busybox",
            ]
        );
    }

    #[test]
    fn unknown_runtime() {
        assert!(select_runtime("podman").is_ok());
        assert!(matches!(
            select_runtime("docker"),
            Err(WarrenError::Container { .. })
        ));
    }
}
