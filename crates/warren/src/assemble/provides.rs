//! The `/provides` file a build script uses to export capabilities.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use warren_common::{WarrenError, WarrenResult};

use super::Assembler;
use crate::environment::Environment;

/// Where the build sees the file.
pub const PROVIDES_PATH: &str = "/provides";

/// A hidden temporary file bound at `/provides` inside the new root.
///
/// The host path is unlinked as soon as the bind is in place, so only the
/// open handle and the mount keep it alive.
#[derive(Debug)]
pub struct ProvidesFile {
    file: File,
}

impl ProvidesFile {
    /// Create the file and bind it into `env`'s root.
    pub fn mount(assembler: &Assembler<'_>, env: &mut Environment) -> WarrenResult<Self> {
        let temp = tempfile::Builder::new()
            .prefix("provides.")
            .tempfile()
            .map_err(|e| WarrenError::fs(std::env::temp_dir(), e))?;

        assembler.bind_file(env, temp.path(), Path::new(PROVIDES_PATH))?;

        // Dropping the path keeps the descriptor open.
        let file = temp.into_file();
        Ok(Self { file })
    }

    /// Capabilities written by the build, one per line. Blank lines are
    /// dropped.
    pub fn read(mut self) -> WarrenResult<Vec<String>> {
        self.file.seek(SeekFrom::Start(0))?;

        let mut provides = Vec::new();
        for line in BufReader::new(self.file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!(capability = line, "Build provides");
            provides.push(line.to_string());
        }
        Ok(provides)
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File) -> Self {
        Self { file }
    }
}
