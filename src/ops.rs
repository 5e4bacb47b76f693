//! Capability seams around the external collaborators.
//!
//! The config compiler, the configurators and the remote bootstrap
//! script are all synchronous opaque procedures with an exit-code plus
//! stdout contract. They hide behind these traits so the orchestration
//! core can be driven by fakes in tests, without a Nix store or any
//! reachable machine.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, bail, ensure};
use tracing::debug;

use crate::commands::Command;
use crate::errors::ToolError;
use crate::input::INPUT_CACHE;

/// Nix version installed on nodes that are bootstrapped from scratch.
const PINNED_NIX_VERSION: &str = "2.24.14";

/// The remote side of bootstrap and activation, streamed over ssh.
/// Verbs: `hasNix`, `install <version>`, `switch <closure>`.
const INFECT_SCRIPT: &str = include_str!("../scripts/infect");

/// The config compiler: evaluates the logical configuration and turns
/// generated configurations into immutable system closures.
pub trait Compiler {
    /// Names of all nodes declared by the logical configuration.
    fn node_names(&self) -> Result<Vec<String>>;

    /// Compile a generated configuration, returning the closure path.
    fn build(&self, artifact: &Path) -> Result<PathBuf>;
}

/// Remote interactions with a node, keyed by its ip address.
pub trait Transport {
    /// Lightweight liveness no-op. A single attempt; retry policy is
    /// the prober's business.
    fn probe(&self, ip: &str) -> Result<()>;

    /// Run a configurator on the node, returning the hardware profile
    /// fragment it prints.
    fn configure(&self, configurator: &Path, ip: &str) -> Result<String>;

    /// Whether the node already has a Nix installation.
    fn has_nix(&self, ip: &str) -> Result<bool>;

    /// Create build users and install the pinned Nix version.
    fn bootstrap(&self, ip: &str) -> Result<()>;

    /// Copy a closure and its dependency set to the node.
    fn copy_closure(&self, ip: &str, closure: &Path) -> Result<()>;

    /// Register and activate a closure, returning the raw exit code of
    /// the remote switch procedure. Interpreting the code is the
    /// deployer's business.
    fn switch(&self, ip: &str, closure: &Path) -> Result<u32>;

    /// Best-effort reboot.
    fn reboot(&self, ip: &str) -> Result<()>;
}

/// [`Compiler`] backed by `nix-instantiate` / `nix-build`.
#[derive(Debug)]
pub struct NixCompiler {
    config: PathBuf,
    input_cache: PathBuf,
    extra_opts: Vec<String>,
}

impl NixCompiler {
    /// Extra flags forwarded to every compiler invocation.
    pub const BUILD_OPTS_VAR: &'static str = "TN_NIX_BUILD_OPTS";

    /// Name of the logical configuration, relative to the project root.
    pub const CONFIG_FILE: &'static str = "config.nix";

    #[must_use]
    pub fn from_env(project: &Path) -> Self {
        let extra_opts = std::env::var(Self::BUILD_OPTS_VAR)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self {
            config: project.join(Self::CONFIG_FILE),
            input_cache: project.join(INPUT_CACHE),
            extra_opts,
        }
    }

    fn ensure_config(&self) -> Result<()> {
        if !self.config.is_file() {
            bail!(ToolError::NoConfigFile(self.config.clone()));
        }
        Ok(())
    }
}

impl Compiler for NixCompiler {
    fn node_names(&self) -> Result<Vec<String>> {
        self.ensure_config()?;
        let expr = format!(
            "builtins.attrNames (import {} {{ \
             terranix = builtins.fromJSON (builtins.readFile {}); }})",
            self.config.display(),
            self.input_cache.display(),
        );
        let stdout = Command::new("nix-instantiate")
            .args(["--eval", "--strict", "--json", "--expr"])
            .arg(&expr)
            .args(&self.extra_opts)
            .run_capture()
            .context("Failed to evaluate logical configuration")?;
        serde_json::from_str(stdout.trim())
            .context("Compiler returned unparsable node names")
    }

    fn build(&self, artifact: &Path) -> Result<PathBuf> {
        self.ensure_config()?;
        let stdout = Command::new("nix-build")
            .arg("<nixpkgs/nixos>")
            .arg("-I")
            .arg(format!("nixos-config={}", artifact.display()))
            .args(["-A", "system.build.toplevel", "--no-out-link"])
            .args(&self.extra_opts)
            .run_capture()
            .context("nix-build failed")?;
        // nix-build prints one store path per built attribute.
        let path = stdout
            .lines()
            .last()
            .map(str::trim)
            .unwrap_or_default();
        ensure!(!path.is_empty(), "nix-build produced no output path");
        Ok(PathBuf::from(path))
    }
}

/// [`Transport`] over the system ssh client, always as root.
#[derive(Debug, Default)]
pub struct SshTransport;

fn target(ip: &str) -> String {
    format!("root@{ip}")
}

/// ssh reserves this code for its own failures; the remote command
/// never produced it.
const SSH_TRANSPORT_FAILURE: u32 = 255;

/// Interpret the exit code of the remote `hasNix` probe. A transport
/// failure is neither a yes nor a no.
fn interpret_nix_probe(code: u32) -> Result<bool> {
    if code == SSH_TRANSPORT_FAILURE {
        bail!("ssh failed before the remote probe could run (exit {code})");
    }
    Ok(code == 0)
}

impl Transport for SshTransport {
    fn probe(&self, ip: &str) -> Result<()> {
        Command::new("true").ssh(target(ip)).run()
    }

    fn configure(&self, configurator: &Path, ip: &str) -> Result<String> {
        let script = std::fs::read_to_string(configurator)
            .wrap_err_with(|| {
                format!(
                    "Failed to read configurator {}",
                    configurator.display()
                )
            })?;
        Command::new("bash")
            .arg("-s")
            .ssh(target(ip))
            .script(script)
            .message("Gathering hardware profile")
            .run_capture()
    }

    fn has_nix(&self, ip: &str) -> Result<bool> {
        let code = Command::new("bash")
            .args(["-s", "--", "hasNix"])
            .ssh(target(ip))
            .script(INFECT_SCRIPT)
            .run_code()?;
        debug!(ip, code, "hasNix probe");
        interpret_nix_probe(code)
    }

    fn bootstrap(&self, ip: &str) -> Result<()> {
        Command::new("bash")
            .args(["-s", "--", "install", PINNED_NIX_VERSION])
            .ssh(target(ip))
            .script(INFECT_SCRIPT)
            .message(format!("Installing Nix {PINNED_NIX_VERSION}"))
            .show_output(true)
            .run()
    }

    fn copy_closure(&self, ip: &str, closure: &Path) -> Result<()> {
        Command::new("nix-copy-closure")
            .arg("--to")
            .arg(target(ip))
            .arg(closure)
            .message("Copying closure to node")
            .run()
    }

    fn switch(&self, ip: &str, closure: &Path) -> Result<u32> {
        Command::new("bash")
            .arg("-s")
            .arg("--")
            .arg("switch")
            .arg(closure)
            .ssh(target(ip))
            .script(INFECT_SCRIPT)
            .message("Activating configuration")
            .run_code()
    }

    fn reboot(&self, ip: &str) -> Result<()> {
        Command::new("reboot").ssh(target(ip)).run()
    }
}
