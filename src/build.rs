use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use tracing::info;

use crate::errors::ToolError;
use crate::generate;
use crate::input::Node;
use crate::ops::Compiler;

/// Compiles previously generated configurations into system closures.
///
/// Generation itself is `init`'s job; a missing or empty artifact here
/// means `init` has not been run for the node.
#[derive(Debug)]
pub struct Builder<'a> {
    project: &'a Path,
}

impl<'a> Builder<'a> {
    #[must_use]
    pub const fn new(project: &'a Path) -> Self {
        Self { project }
    }

    /// Build one node's closure, returning its immutable path.
    pub fn build_instance(
        &self,
        name: &str,
        node: &Node,
        compiler: &dyn Compiler,
    ) -> Result<PathBuf> {
        let artifact =
            generate::artifact_path(self.project, &node.provider, name);

        let usable = artifact.is_file()
            && fs::metadata(&artifact)
                .context("Failed to stat deploy file")?
                .len()
                > 0;
        if !usable {
            bail!(ToolError::NoDeployFile(artifact));
        }

        info!("Building {name}");
        let closure = compiler.build(&artifact).wrap_err(
            ToolError::BuildFailure(name.to_string()),
        )?;
        info!("Built {}", closure.display());
        Ok(closure)
    }
}
