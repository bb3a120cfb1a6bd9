//! File plumbing around the compiler core. Output is only written once
//! the whole pipeline has succeeded, so a failing run leaves no partial
//! module behind.

use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use log::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("cannot write {path}: {source}")]
    Write { path: String, source: io::Error },
}

/// Reads the input specification.
///
/// # Errors
///
/// Returns [`IoError::Read`] when the file cannot be read.
pub fn read_input(path: &Path) -> Result<String, IoError> {
    fs::read_to_string(path).map_err(|source| IoError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Writes the emitted module to `target`, or to stdout when no target
/// is given.
///
/// # Errors
///
/// Returns [`IoError::Write`] when the target cannot be written.
pub fn write_output(target: Option<&Path>, source: &str) -> Result<(), IoError> {
    match target {
        Some(path) => {
            fs::write(path, source).map_err(|source| IoError::Write {
                path: path.display().to_string(),
                source,
            })?;
            info!("module written to {}", path.display());
            Ok(())
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(source.as_bytes())
                .map_err(|source| IoError::Write {
                    path: "<stdout>".to_owned(),
                    source,
                })
        }
    }
}
