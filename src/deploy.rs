//! Pushing built closures to nodes.
//!
//! The switch procedure reports its result through a small exit-code
//! contract: 0 is plain success, 100 is success that requires a
//! reboot, 4 is success with some services failing to restart, and
//! anything else is a hard failure.

use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use tracing::{info, warn};

use crate::errors::ToolError;
use crate::input::Node;
use crate::ops::Transport;

/// Switch exit code meaning "activated, reboot to finish".
pub const SWITCH_REBOOT_REQUIRED: u32 = 100;

/// Switch exit code meaning "activated, some services failed".
pub const SWITCH_DEGRADED: u32 = 4;

/// Interpreted result of the remote switch procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Done,
    RebootRequired,
    DegradedServices,
}

/// Pushes closures to nodes, bootstrapping Nix where it is absent.
pub struct Deployer<'a> {
    transport: &'a dyn Transport,
}

impl<'a> Deployer<'a> {
    #[must_use]
    pub const fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    /// Push one closure to one node and activate it.
    ///
    /// Failures up to and including the closure copy leave the node
    /// untouched and are safe to retry. The switch step is not: on a
    /// first-time infection it destroys the previous boot state, so a
    /// partial switch failure has no automatic recovery and is never
    /// retried here.
    pub fn push_instance(
        &self,
        name: &str,
        node: &Node,
        closure: &Path,
    ) -> Result<()> {
        if !closure.exists() {
            bail!(ToolError::InvalidArtifact(closure.to_path_buf()));
        }

        let has_nix = self
            .transport
            .has_nix(&node.ip)
            .wrap_err("Failed to probe for an existing Nix install")?;

        if !has_nix {
            info!("{name} has no Nix installation, bootstrapping");
            self.transport.bootstrap(&node.ip).wrap_err(
                ToolError::RemoteProcedure(
                    name.to_string(),
                    "bootstrap failed".to_string(),
                ),
            )?;
        }

        self.transport
            .copy_closure(&node.ip, closure)
            .wrap_err(ToolError::CopyFailure(name.to_string()))?;

        let code =
            self.transport.switch(&node.ip, closure).wrap_err(
                ToolError::RemoteProcedure(
                    name.to_string(),
                    "switch did not run".to_string(),
                ),
            )?;

        match interpret_switch(code) {
            Some(SwitchOutcome::Done) => {
                info!("{name} switched to the new configuration");
            }
            Some(SwitchOutcome::RebootRequired) => {
                info!("{name} requires a reboot to finish activation");
                if let Err(err) = self.transport.reboot(&node.ip) {
                    warn!("Failed to trigger reboot of {name}: {err:#}");
                }
            }
            Some(SwitchOutcome::DegradedServices) => {
                warn!(
                    "{name} switched, but some services failed to start"
                );
            }
            None => {
                bail!(ToolError::RemoteProcedure(
                    name.to_string(),
                    format!("switch exited with code {code}"),
                ));
            }
        }
        Ok(())
    }
}

const fn interpret_switch(code: u32) -> Option<SwitchOutcome> {
    match code {
        0 => Some(SwitchOutcome::Done),
        SWITCH_REBOOT_REQUIRED => Some(SwitchOutcome::RebootRequired),
        SWITCH_DEGRADED => Some(SwitchOutcome::DegradedServices),
        _ => None,
    }
}
