//! The per-run snapshot of fleet state.
//!
//! The input hook is an executable installed at the project root whose
//! stdout is the JSON document produced by the infrastructure state
//! provider (in practice a `terraform output | jq` pipeline). Its
//! output is memoized to a cache file for the duration of one process
//! invocation, and the cache never outlives the process: a [`CacheGuard`]
//! unlinks it on drop, and a signal handler unlinks it when the process
//! is terminated from outside.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail, ensure};
use serde::Deserialize;
use tracing::{debug, info};

use crate::commands::Command;
use crate::errors::ToolError;

/// Name of the input hook executable, relative to the project root.
pub const INPUT_HOOK: &str = "input";

/// Name of the per-run input cache, relative to the project root.
pub const INPUT_CACHE: &str = ".terranix-input.json";

/// A remote target machine as declared by the state provider.
///
/// Entries missing required keys upstream are filtered out by the
/// state transform before they reach us, so every field defaults to
/// empty here and is checked at use time instead.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub ssh_key: String,
}

impl Node {
    /// A node can only be acted on once all remote-operation fields
    /// are present. Absence is an error, never a silent skip.
    pub fn ensure_actionable(&self, name: &str) -> Result<()> {
        ensure!(!self.ip.is_empty(), r#"Instance "{name}" has no ip"#);
        ensure!(
            !self.provider.is_empty(),
            r#"Instance "{name}" has no provider"#
        );
        ensure!(
            !self.ssh_key.is_empty(),
            r#"Instance "{name}" has no ssh key"#
        );
        Ok(())
    }
}

/// Immutable snapshot of the fleet, loaded once per invocation and
/// threaded by reference through every component.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDocument {
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl InputDocument {
    pub fn node(&self, name: &str) -> Result<&Node> {
        match self.nodes.get(name) {
            Some(node) => Ok(node),
            None => bail!(ToolError::UnknownInstance(name.to_string())),
        }
    }
}

/// Resolves the input document, memoized to the per-run cache file.
#[derive(Debug)]
pub struct StateProvider {
    project: PathBuf,
}

impl StateProvider {
    #[must_use]
    pub fn new(project: &Path) -> Self {
        Self { project: project.to_path_buf() }
    }

    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.project.join(INPUT_CACHE)
    }

    #[must_use]
    pub fn hook_path(&self) -> PathBuf {
        self.project.join(INPUT_HOOK)
    }

    /// Resolve the input document.
    ///
    /// Reads the cache if a previous step of this run already produced
    /// it, otherwise invokes the input hook and persists its stdout.
    /// The returned guard owns the cache file and must stay alive for
    /// as long as anything references the cached document on disk.
    pub fn resolve(&self) -> Result<(InputDocument, CacheGuard)> {
        let cache = self.cache_path();
        // Installs the signal handler before the cache exists, so a
        // signal can never leave the file behind.
        let guard = CacheGuard::new(cache.clone())?;

        let raw = if cache.exists() {
            debug!(?cache, "reusing input cache");
            fs::read_to_string(&cache)
                .context("Failed to read input cache")?
        } else {
            let raw = self.run_hook()?;
            fs::write(&cache, &raw)
                .context("Failed to write input cache")?;
            raw
        };

        Ok((parse_document(&raw)?, guard))
    }

    /// Seed the cache with an externally supplied document, bypassing
    /// the hook. Used by `init-from-json`.
    pub fn seed(&self, raw: &str) -> Result<(InputDocument, CacheGuard)> {
        let document = parse_document(raw)?;
        let cache = self.cache_path();
        let guard = CacheGuard::new(cache.clone())?;
        fs::write(&cache, raw).context("Failed to write input cache")?;
        Ok((document, guard))
    }

    fn run_hook(&self) -> Result<String> {
        let hook = self.hook_path();
        if !hook.is_file() || !is_executable(&hook)? {
            bail!(ToolError::NoInput);
        }
        debug!(?hook, "invoking input hook");
        Command::new(&hook)
            .run_capture()
            .context("Input hook failed")
    }
}

fn parse_document(raw: &str) -> Result<InputDocument> {
    match serde_json::from_str(raw) {
        Ok(document) => Ok(document),
        Err(err) => bail!(ToolError::InputTransform(err.to_string())),
    }
}

/// Single-quote a path for embedding in a shell script. Single quotes
/// inhibit every other metacharacter, and embedded quotes become the
/// usual `'\''` dance.
fn shell_quote(path: &Path) -> String {
    let raw = path.display().to_string();
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn is_executable(path: &Path) -> Result<bool> {
    let mode = fs::metadata(path)
        .context("Failed to stat input hook")?
        .permissions()
        .mode();
    Ok(mode & 0o111 != 0)
}

/// Install the input hook from a static JSON document.
///
/// The document must parse as an input document; the hook is written
/// as a tiny shell script so it stays user-replaceable by any other
/// executable producing the same schema.
pub fn install_hook(project: &Path, json_path: &Path) -> Result<()> {
    let raw = fs::read_to_string(json_path).wrap_err_with(|| {
        format!("Failed to read {}", json_path.display())
    })?;
    parse_document(&raw)?;

    let source = json_path
        .canonicalize()
        .context("Failed to resolve input path")?;
    let hook = project.join(INPUT_HOOK);
    let script =
        format!("#!/bin/sh\nexec cat {}\n", shell_quote(&source));

    fs::write(&hook, script).context("Failed to write input hook")?;
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))
        .context("Failed to mark input hook executable")?;

    info!("Installed input hook at {}", hook.display());
    Ok(())
}

/// Owns the per-run input cache file and guarantees its removal.
///
/// Normal and error exits are covered by `Drop`; termination signals
/// are covered by a handler that unlinks the same path and exits.
#[derive(Debug)]
pub struct CacheGuard {
    path: PathBuf,
}

static SIGNAL_CACHE_PATH: OnceLock<CString> = OnceLock::new();

extern "C" fn unlink_cache_on_signal(sig: i32) {
    if let Some(path) = SIGNAL_CACHE_PATH.get() {
        // SAFETY: unlink and _exit are async-signal-safe.
        unsafe {
            nix::libc::unlink(path.as_ptr());
            nix::libc::_exit(128 + sig);
        }
    }
    // SAFETY: _exit is async-signal-safe.
    unsafe { nix::libc::_exit(128 + sig) }
}

fn install_signal_cleanup(path: &Path) -> Result<()> {
    use nix::sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction,
    };

    let cpath = CString::new(path.as_os_str().as_bytes())
        .context("Cache path contains an interior nul byte")?;
    // First guard wins. There is only ever one cache per process.
    let _ = SIGNAL_CACHE_PATH.set(cpath);

    let action = SigAction::new(
        SigHandler::Handler(unlink_cache_on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only calls async-signal-safe functions.
        unsafe { sigaction(sig, &action) }
            .context("Failed to install cache cleanup handler")?;
    }
    Ok(())
}

impl CacheGuard {
    fn new(path: PathBuf) -> Result<Self> {
        install_signal_cleanup(&path)?;
        Ok(Self { path })
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        debug!(path = ?self.path, "removing input cache");
        let _ = fs::remove_file(&self.path);
    }
}
