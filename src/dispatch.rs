//! The top-level state machine behind the public verbs.
//!
//! Per-verb failure policy: `check` probes every requested node before
//! reporting, `init` isolates per-node errors to that node's log
//! stream, while `build` and `push` abort the whole batch on the first
//! failure because their side effects are order sensitive; push in
//! particular must never deploy against a half-built batch.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::bail;
use tracing::{error, info, info_span};

use crate::build::Builder;
use crate::deploy::Deployer;
use crate::errors::ToolError;
use crate::generate::ConfigGenerator;
use crate::input::InputDocument;
use crate::ops::{Compiler, Transport};
use crate::probe::Prober;
use crate::registry::NodeRegistry;

/// Everything one command invocation operates on: the project
/// directory, the per-run input snapshot, and the capabilities for
/// reaching the compiler and the nodes.
pub struct Fleet<'a> {
    pub project: &'a Path,
    pub input: &'a InputDocument,
    pub compiler: &'a dyn Compiler,
    pub transport: &'a dyn Transport,
    pub prober: Prober,
}

impl Fleet<'_> {
    fn resolve(&self, names: &[String]) -> Result<Vec<String>> {
        NodeRegistry::new(self.input)
            .check_instances(names, self.compiler)
    }

    /// Probe every requested node; fail only after attempting all.
    pub fn check(&self, names: &[String]) -> Result<()> {
        let names = self.resolve(names)?;
        let mut down = Vec::new();

        for name in &names {
            let _span = info_span!("node", name = %name).entered();
            let node = self.input.node(name)?;
            if let Err(err) =
                self.prober.check_up(name, node, self.transport)
            {
                error!("{err:#}");
                down.push(name.clone());
            }
        }

        if !down.is_empty() {
            bail!(ToolError::Unreachable(down.join(", ")));
        }
        Ok(())
    }

    /// Generate configurations for the requested nodes.
    ///
    /// Per-node failures are logged and the batch continues; the first
    /// recorded failure is reported once every node has been tried.
    pub fn init(&self, names: &[String]) -> Result<()> {
        let names = self.resolve(names)?;
        self.check(&names)?;

        let generator = ConfigGenerator::new(self.project);
        let mut first_failure = None;

        for name in &names {
            let _span = info_span!("node", name = %name).entered();
            let node = self.input.node(name)?;
            if let Err(err) =
                generator.init_instance(name, node, self.transport)
            {
                error!("{err:#}");
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Build closures for the requested nodes, aborting on the first
    /// failure.
    pub fn build(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, PathBuf)>> {
        let names = self.resolve(names)?;
        let builder = Builder::new(self.project);
        let mut closures = Vec::with_capacity(names.len());

        for name in names {
            let closure = {
                let _span = info_span!("node", name = %name).entered();
                let node = self.input.node(&name)?;
                builder.build_instance(&name, node, self.compiler)?
            };
            closures.push((name, closure));
        }
        Ok(closures)
    }

    /// Build, verify reachability, deploy, then verify again.
    ///
    /// All closures are built before any deployment starts, and the
    /// final reachability check runs only once every deployment has
    /// succeeded.
    pub fn push(&self, names: &[String]) -> Result<()> {
        let closures = self.build(names)?;
        let names: Vec<String> =
            closures.iter().map(|(name, _)| name.clone()).collect();

        self.check(&names)?;

        let deployer = Deployer::new(self.transport);
        for (name, closure) in &closures {
            let _span = info_span!("node", name = %name).entered();
            let node = self.input.node(name)?;
            deployer.push_instance(name, node, closure)?;
        }

        info!("Confirming post-deploy reachability");
        self.check(&names)
    }
}
