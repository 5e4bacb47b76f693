//! Per-node configuration generation.
//!
//! A generated configuration is a deterministic function of the
//! hardware profile returned by the provider's configurator, the
//! node's entry in the logical configuration, its hostname and its
//! authorized key. Re-running `init` always overwrites; identical
//! inputs produce byte-identical artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use tracing::{debug, info};

use crate::errors::ToolError;
use crate::input::{INPUT_CACHE, Node};
use crate::ops::{NixCompiler, Transport};

/// Search path for configurator executables, colon separated.
pub const CONFIGURATOR_PATH_VAR: &str = "TN_CONFIGURATOR_PATH";

/// Directory holding generated configurations, under the project root.
pub const DEPLOY_DIR: &str = "deploy";

/// Deterministic location of a node's generated configuration.
#[must_use]
pub fn artifact_path(project: &Path, provider: &str, name: &str) -> PathBuf {
    project.join(DEPLOY_DIR).join(format!("{provider}-{name}.nix"))
}

fn hardware_path(project: &Path, provider: &str, name: &str) -> PathBuf {
    project
        .join(DEPLOY_DIR)
        .join(format!("{provider}-{name}-hardware.nix"))
}

/// Generates per-node configurations by merging configurator output
/// with the logical configuration.
#[derive(Debug)]
pub struct ConfigGenerator<'a> {
    project: &'a Path,
}

impl<'a> ConfigGenerator<'a> {
    #[must_use]
    pub const fn new(project: &'a Path) -> Self {
        Self { project }
    }

    /// Generate the configuration for one node.
    pub fn init_instance(
        &self,
        name: &str,
        node: &Node,
        transport: &dyn Transport,
    ) -> Result<PathBuf> {
        node.ensure_actionable(name)?;

        let configurator = find_configurator(&node.provider)?;
        debug!(?configurator, "running configurator");

        let fragment = transport
            .configure(&configurator, &node.ip)
            .wrap_err_with(|| {
                format!(r#"Configurator failed for instance "{name}""#)
            })?;

        let deploy = self.project.join(DEPLOY_DIR);
        fs::create_dir_all(&deploy)
            .context("Failed to create deploy directory")?;

        let hardware = hardware_path(self.project, &node.provider, name);
        fs::write(&hardware, &fragment)
            .context("Failed to write hardware profile")?;

        let artifact = artifact_path(self.project, &node.provider, name);
        fs::write(&artifact, render(name, node))
            .context("Failed to write generated configuration")?;

        info!("Generated {}", artifact.display());
        Ok(artifact)
    }
}

/// Render the configuration artifact. Everything the artifact depends
/// on is referenced relative to the deploy directory so the rendering
/// is a pure function of `(name, node)`.
fn render(name: &str, node: &Node) -> String {
    format!(
        r#"# Generated by terranix. Do not edit, re-run `terranix init` instead.
{{ ... }}:
{{
  imports = [
    ./{provider}-{name}-hardware.nix
    ((import ../{config} {{
      terranix = builtins.fromJSON (builtins.readFile ../{cache});
    }}).{name})
  ];

  networking.hostName = "{name}";

  services.openssh.enable = true;
  users.users.root.openssh.authorizedKeys.keys = [
    "{key}"
  ];
}}
"#,
        provider = node.provider,
        config = NixCompiler::CONFIG_FILE,
        cache = INPUT_CACHE,
        key = node.ssh_key,
    )
}

/// Locate the configurator executable for a provider tag.
///
/// Searches `TN_CONFIGURATOR_PATH` when set, otherwise the project's
/// `./configurators` directory followed by the directory bundled next
/// to the running executable.
pub fn find_configurator(provider: &str) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = match std::env::var(CONFIGURATOR_PATH_VAR) {
        Ok(paths) => paths.split(':').map(PathBuf::from).collect(),
        Err(_) => {
            let mut dirs = vec![PathBuf::from("./configurators")];
            if let Some(bundled) = bundled_configurator_dir() {
                dirs.push(bundled);
            }
            dirs
        }
    };

    for dir in &dirs {
        let candidate = dir.join(provider);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(ToolError::NoConfigurator(provider.to_string()))
}

fn bundled_configurator_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("../share/terranix/configurators"))
}
