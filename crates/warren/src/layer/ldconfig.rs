//! Per-layer `ld.so.cache`.
//!
//! Layers that ship shared libraries get their own linker cache, bound over
//! `/etc/ld.so.cache` in the environment.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use warren_common::{WarrenError, WarrenResult};

use super::Interpreter;
use crate::exec;
use crate::filesystem::util;

const HOST_CACHE: &str = "/etc/ld.so.cache";
const LDCONFIG: &str = "/sbin/ldconfig";

/// Where the cache is generated and whether it needs regenerating.
#[derive(Debug)]
struct CacheFile {
    path: PathBuf,
    regenerate: bool,
    _temp: Option<NamedTempFile>,
}

impl CacheFile {
    /// Root keeps the cache inside the layer and only regenerates it when the
    /// host cache is newer. Everyone else gets a fresh temporary file.
    fn choose(layer_root: &Path, privileged: bool) -> WarrenResult<Self> {
        if privileged {
            let path = layer_root.join("etc/ld.so.cache");
            let regenerate =
                util::compare_mtime(Path::new(HOST_CACHE), &path) != Some(Ordering::Less);
            return Ok(Self {
                path,
                regenerate,
                _temp: None,
            });
        }

        let temp = tempfile::Builder::new()
            .prefix("ld.so.")
            .suffix(".cache")
            .tempfile()
            .map_err(|e| WarrenError::fs(std::env::temp_dir(), e))?;
        Ok(Self {
            path: temp.path().to_path_buf(),
            regenerate: true,
            _temp: Some(temp),
        })
    }
}

fn run_ldconfig(environment: &str, cache: &Path) {
    tracing::debug!(environment, cache = %cache.display(), "Updating ld.so.cache");

    // -X: leave symlinks alone, lower layers may be read-only.
    let mut command = Command::new(LDCONFIG);
    command.arg("-X").arg("-C").arg(cache);
    match exec::run(&mut command) {
        Ok(status) if exec::status_ok(status) => {}
        Ok(status) => tracing::warn!(
            environment,
            status = %exec::describe_status(status),
            "ldconfig failed"
        ),
        Err(err) => tracing::warn!(environment, %err, "ldconfig failed"),
    }
}

/// Regenerate the layer's cache if needed and bind it into place.
pub(super) fn update_cache(
    interpreter: &mut Interpreter<'_, '_>,
    layer_root: &Path,
) -> WarrenResult<()> {
    util::makedirs(&layer_root.join("etc"))?;

    let privileged = rustix::process::geteuid().is_root();
    let cache = CacheFile::choose(layer_root, privileged)?;
    if cache.regenerate {
        run_ldconfig(interpreter.ctx.environment, &cache.path);
    } else {
        tracing::debug!(
            environment = interpreter.ctx.environment,
            "Layer ld.so.cache is recent, not updating it"
        );
    }

    let logical = Path::new(HOST_CACHE);
    let dest = interpreter.scaffold.dest_path(logical);
    interpreter.bind_one(&cache.path, &dest, logical)
}
