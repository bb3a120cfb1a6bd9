use thiserror::Error;

use crate::io::IoError;
use crate::oracle::OracleError;
use crate::system::parse::ParseError;
use crate::system::SystemError;
use crate::tuner::TunerError;

/// Top-level error taxonomy. Every variant is terminal for the run and
/// maps to exit code 1 in the binary.
#[derive(Error, Debug)]
pub enum BoltzError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error("unsupported system: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Tuner(#[from] TunerError),
    #[error(transparent)]
    Io(#[from] IoError),
}
