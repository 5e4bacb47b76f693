use color_eyre::Result;
use color_eyre::eyre::bail;
use tracing::debug;

use crate::errors::ToolError;
use crate::input::InputDocument;
use crate::ops::Compiler;

/// Validates requested node names against the input document.
#[derive(Debug)]
pub struct NodeRegistry<'a> {
    input: &'a InputDocument,
}

impl<'a> NodeRegistry<'a> {
    #[must_use]
    pub const fn new(input: &'a InputDocument) -> Self {
        Self { input }
    }

    /// Resolve a requested batch of names.
    ///
    /// An empty request defaults to every node the logical
    /// configuration declares. The first name missing from the input
    /// document aborts the whole batch.
    pub fn check_instances(
        &self,
        names: &[String],
        compiler: &dyn Compiler,
    ) -> Result<Vec<String>> {
        let names = if names.is_empty() {
            let declared = compiler.node_names()?;
            debug!(?declared, "defaulting to all declared nodes");
            declared
        } else {
            names.to_vec()
        };

        for name in &names {
            if !self.input.nodes.contains_key(name) {
                bail!(ToolError::UnknownInstance(name.clone()));
            }
        }
        Ok(names)
    }
}
