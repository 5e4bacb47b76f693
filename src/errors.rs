use std::path::PathBuf;

use thiserror::Error;

/// Failures that carry a stable, scriptable process exit code.
///
/// Callers (CI jobs, wrapper scripts) branch on these numbers, so the
/// mapping in [`ToolError::exit_code`] must never be reshuffled.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Usage error")]
    Usage,

    #[error(r#"Unknown instance "{0}""#)]
    UnknownInstance(String),

    #[error("Logical configuration {0:?} not found")]
    NoConfigFile(PathBuf),

    #[error(r#"No configurator found for provider "{0}""#)]
    NoConfigurator(String),

    #[error(r#"Failed to build instance "{0}""#)]
    BuildFailure(String),

    #[error("Build artifact {0:?} does not exist")]
    InvalidArtifact(PathBuf),

    #[error("No input found, install an input hook with `terranix input` first")]
    NoInput,

    /// The input hook ran but its output did not decode as an input
    /// document. Shares the exit code of [`ToolError::NoInput`].
    #[error("Input hook produced unusable output: {0}")]
    InputTransform(String),

    #[error("Deploy file {0:?} not found, run `terranix init` first")]
    NoDeployFile(PathBuf),

    #[error(r#"Remote procedure on instance "{0}" failed: {1}"#)]
    RemoteProcedure(String, String),

    #[error(r#"Instance(s) unreachable: {0}"#)]
    Unreachable(String),

    #[error(r#"Failed to copy closure to instance "{0}""#)]
    CopyFailure(String),
}

impl ToolError {
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage => 1,
            Self::UnknownInstance(_) => 2,
            Self::NoConfigFile(_) => 3,
            Self::NoConfigurator(_) => 4,
            Self::BuildFailure(_) => 5,
            Self::InvalidArtifact(_) => 6,
            Self::NoInput | Self::InputTransform(_) => 7,
            Self::NoDeployFile(_) => 8,
            Self::RemoteProcedure(..) => 9,
            Self::Unreachable(_) => 10,
            Self::CopyFailure(_) => 11,
        }
    }
}
