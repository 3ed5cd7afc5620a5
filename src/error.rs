//! Application-master error kinds and exit-code mapping

use thiserror::Error;

use crate::resource::TransportError;

/// Process exit code for a clean run.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for an invariant violation or unexpected failure.
pub const EXIT_INTERNAL_ERROR: i32 = 1;
/// Process exit code for unusable command-line arguments.
pub const EXIT_BAD_ARGUMENTS: i32 = 2;
/// Process exit code for missing or malformed site configuration.
pub const EXIT_BAD_CONFIG: i32 = 3;
/// Process exit code for a failure to launch the master process.
pub const EXIT_LAUNCH_FAILURE: i32 = 4;

/// Top-level application-master errors.
///
/// `BadArguments` and `BadConfig` abort startup before any traffic is
/// sent to the resource manager; the remaining kinds surface during or
/// after registration and are mapped to exit codes in `main`.
#[derive(Debug, Error)]
pub enum AmError {
    #[error("bad command arguments: {0}")]
    BadArguments(String),

    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("launch failure: {0}")]
    Launch(String),

    #[error("internal state error: {0}")]
    Internal(String),
}

impl AmError {
    /// Map this error to the process exit code reported to the launcher.
    pub fn exit_code(&self) -> i32 {
        match self {
            AmError::BadArguments(_) => EXIT_BAD_ARGUMENTS,
            AmError::BadConfig(_) => EXIT_BAD_CONFIG,
            AmError::Launch(_) => EXIT_LAUNCH_FAILURE,
            AmError::Transport(_) | AmError::Internal(_) => EXIT_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(AmError::BadArguments("x".into()).exit_code(), EXIT_BAD_ARGUMENTS);
        assert_eq!(AmError::BadConfig("x".into()).exit_code(), EXIT_BAD_CONFIG);
        assert_eq!(AmError::Launch("x".into()).exit_code(), EXIT_LAUNCH_FAILURE);
        assert_eq!(AmError::Internal("x".into()).exit_code(), EXIT_INTERNAL_ERROR);
    }
}
