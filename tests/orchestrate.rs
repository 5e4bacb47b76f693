//! Drives the command state machine with fake capabilities: no Nix
//! store, no reachable machines.

#![allow(clippy::unwrap_used)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use assert_fs::TempDir;
use assert_fs::prelude::*;
use color_eyre::Result;
use color_eyre::eyre::eyre;

use serial_test::serial;
use terranix::dispatch::Fleet;
use terranix::errors::ToolError;
use terranix::generate::CONFIGURATOR_PATH_VAR;
use terranix::input::InputDocument;
use terranix::ops::{Compiler, Transport};
use terranix::probe::Prober;

type EventLog = Rc<RefCell<Vec<String>>>;

struct FakeCompiler {
    store: PathBuf,
    fail_on: Option<String>,
    calls: RefCell<Vec<String>>,
    events: EventLog,
}

impl FakeCompiler {
    fn new(store: &Path, events: EventLog) -> Self {
        Self {
            store: store.to_path_buf(),
            fail_on: None,
            calls: RefCell::new(vec![]),
            events,
        }
    }
}

impl Compiler for FakeCompiler {
    fn node_names(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    fn build(&self, artifact: &Path) -> Result<PathBuf> {
        let stem = artifact
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        self.calls.borrow_mut().push(stem.clone());
        self.events.borrow_mut().push(format!("build {stem}"));
        if self.fail_on.as_deref().is_some_and(|f| stem.contains(f)) {
            return Err(eyre!("compiler diagnostics"));
        }
        let closure = self.store.join(format!("{stem}.closure"));
        std::fs::write(&closure, "closure")?;
        Ok(closure)
    }
}

struct FakeTransport {
    down: HashSet<String>,
    has_nix: bool,
    fail_copy: bool,
    fail_configure: HashSet<String>,
    switch_code: u32,
    probed: RefCell<Vec<String>>,
    configured: RefCell<Vec<String>>,
    bootstrapped: RefCell<Vec<String>>,
    switched: RefCell<Vec<String>>,
    rebooted: RefCell<Vec<String>>,
    events: EventLog,
}

impl FakeTransport {
    fn new(events: EventLog) -> Self {
        Self {
            down: HashSet::new(),
            has_nix: true,
            fail_copy: false,
            fail_configure: HashSet::new(),
            switch_code: 0,
            probed: RefCell::new(vec![]),
            configured: RefCell::new(vec![]),
            bootstrapped: RefCell::new(vec![]),
            switched: RefCell::new(vec![]),
            rebooted: RefCell::new(vec![]),
            events,
        }
    }
}

impl Transport for FakeTransport {
    fn probe(&self, ip: &str) -> Result<()> {
        self.probed.borrow_mut().push(ip.to_string());
        if self.down.contains(ip) {
            return Err(eyre!("connection refused"));
        }
        Ok(())
    }

    fn configure(&self, _configurator: &Path, ip: &str) -> Result<String> {
        self.configured.borrow_mut().push(ip.to_string());
        if self.fail_configure.contains(ip) {
            return Err(eyre!("configurator exited nonzero"));
        }
        Ok("{ ... }: { }".to_string())
    }

    fn has_nix(&self, _ip: &str) -> Result<bool> {
        Ok(self.has_nix)
    }

    fn bootstrap(&self, ip: &str) -> Result<()> {
        self.bootstrapped.borrow_mut().push(ip.to_string());
        Ok(())
    }

    fn copy_closure(&self, ip: &str, _closure: &Path) -> Result<()> {
        if self.fail_copy {
            return Err(eyre!("closure copy interrupted"));
        }
        self.events.borrow_mut().push(format!("copy {ip}"));
        Ok(())
    }

    fn switch(&self, ip: &str, _closure: &Path) -> Result<u32> {
        self.switched.borrow_mut().push(ip.to_string());
        self.events.borrow_mut().push(format!("switch {ip}"));
        Ok(self.switch_code)
    }

    fn reboot(&self, ip: &str) -> Result<()> {
        self.rebooted.borrow_mut().push(ip.to_string());
        Ok(())
    }
}

fn document(entries: &[(&str, &str)]) -> InputDocument {
    let nodes = entries
        .iter()
        .map(|(name, ip)| {
            format!(
                r#""{name}": {{ "ip": "{ip}", "provider": "libvirt", "ssh_key": "K" }}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    serde_json::from_str(&format!(r#"{{ "nodes": {{ {nodes} }} }}"#))
        .unwrap()
}

fn write_deploy_files(top: &TempDir, names: &[&str]) {
    for name in names {
        top.child(format!("deploy/libvirt-{name}.nix"))
            .write_str("{ ... }: { }")
            .unwrap();
    }
}

fn tool_error(err: &color_eyre::Report) -> Option<&ToolError> {
    err.downcast_ref::<ToolError>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref()))
}

struct Harness {
    top: TempDir,
    input: InputDocument,
    compiler: FakeCompiler,
    transport: FakeTransport,
}

impl Harness {
    fn new(entries: &[(&str, &str)]) -> Self {
        let top = TempDir::new().unwrap();
        let events: EventLog = Rc::default();
        let compiler = FakeCompiler::new(top.path(), events.clone());
        let transport = FakeTransport::new(events);
        Self { input: document(entries), top, compiler, transport }
    }

    fn fleet(&self) -> Fleet<'_> {
        Fleet {
            project: self.top.path(),
            input: &self.input,
            compiler: &self.compiler,
            transport: &self.transport,
            prober: Prober::immediate(),
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }
}

#[test]
#[serial]
fn init_continues_past_a_failed_node_and_reports_the_failure() {
    let mut harness =
        Harness::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
    let configurators = harness.top.child("configurators");
    configurators.create_dir_all().unwrap();
    configurators.child("libvirt").write_str("#!/bin/sh\n").unwrap();
    // SAFETY: marked serial, no concurrent env access.
    unsafe {
        std::env::set_var(
            CONFIGURATOR_PATH_VAR,
            configurators.path().as_os_str(),
        );
    }
    harness.transport.fail_configure.insert("10.0.0.1".to_string());

    let result = harness.fleet().init(&Harness::names(&["a", "b"]));
    assert!(result.is_err());
    // One node failing does not stop the rest of the batch.
    assert_eq!(
        *harness.transport.configured.borrow(),
        vec!["10.0.0.1", "10.0.0.2"]
    );
    assert!(harness
        .top
        .child("deploy/libvirt-b.nix")
        .path()
        .exists());
    assert!(!harness
        .top
        .child("deploy/libvirt-a.nix")
        .path()
        .exists());
}

#[test]
fn check_fails_iff_any_node_is_down() {
    let mut harness =
        Harness::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
    harness.transport.down.insert("10.0.0.2".to_string());

    assert!(harness.fleet().check(&Harness::names(&["a"])).is_ok());

    let err = harness
        .fleet()
        .check(&Harness::names(&["a", "b"]))
        .unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::Unreachable(who)) if who.contains('b')
    ));
    // The down node was still probed the full three times.
    let probes = harness.transport.probed.borrow();
    assert_eq!(
        probes.iter().filter(|ip| *ip == "10.0.0.2").count(),
        3
    );
}

#[test]
fn check_treats_missing_ip_as_unreachable() {
    let harness = Harness::new(&[("a", "10.0.0.1"), ("b", "")]);

    assert!(harness.fleet().check(&Harness::names(&["a"])).is_ok());
    let err = harness
        .fleet()
        .check(&Harness::names(&["a", "b"]))
        .unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::Unreachable(_))
    ));
}

#[test]
fn unknown_instance_aborts_before_any_build() {
    let harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);

    let err = harness
        .fleet()
        .build(&Harness::names(&["a", "ghost"]))
        .unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::UnknownInstance(name)) if name == "ghost"
    ));
    assert!(harness.compiler.calls.borrow().is_empty());
}

#[test]
fn build_aborts_batch_on_first_failure() {
    let mut harness =
        Harness::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
    write_deploy_files(&harness.top, &["a", "b"]);
    harness.compiler.fail_on = Some("a".to_string());

    let err = harness
        .fleet()
        .build(&Harness::names(&["a", "b"]))
        .unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::BuildFailure(name)) if name == "a"
    ));
    assert_eq!(*harness.compiler.calls.borrow(), vec!["libvirt-a"]);
}

#[test]
fn build_without_deploy_file_never_reaches_the_compiler() {
    let harness = Harness::new(&[("a", "10.0.0.1")]);

    let err =
        harness.fleet().build(&Harness::names(&["a"])).unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::NoDeployFile(_))
    ));
    assert!(harness.compiler.calls.borrow().is_empty());
}

#[test]
fn push_builds_everything_before_deploying_anything() {
    let harness =
        Harness::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]);
    write_deploy_files(&harness.top, &["a", "b"]);

    harness.fleet().push(&Harness::names(&["a", "b"])).unwrap();

    let events = harness.compiler.events.borrow();
    let last_build = events
        .iter()
        .rposition(|e| e.starts_with("build"))
        .unwrap();
    let first_copy = events
        .iter()
        .position(|e| e.starts_with("copy"))
        .unwrap();
    assert!(last_build < first_copy, "events: {events:?}");
}

#[test]
fn push_never_switches_after_a_copy_failure() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.fail_copy = true;

    let err =
        harness.fleet().push(&Harness::names(&["a"])).unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::CopyFailure(name)) if name == "a"
    ));
    assert!(harness.transport.switched.borrow().is_empty());
}

#[test]
fn push_bootstraps_nodes_without_nix() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.has_nix = false;

    harness.fleet().push(&Harness::names(&["a"])).unwrap();
    assert_eq!(
        *harness.transport.bootstrapped.borrow(),
        vec!["10.0.0.1"]
    );
    assert_eq!(*harness.transport.switched.borrow(), vec!["10.0.0.1"]);
}

#[test]
fn switch_code_100_triggers_exactly_one_reboot_and_succeeds() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.switch_code = 100;

    harness.fleet().push(&Harness::names(&["a"])).unwrap();
    assert_eq!(*harness.transport.rebooted.borrow(), vec!["10.0.0.1"]);
}

#[test]
fn switch_code_4_is_success_without_reboot() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.switch_code = 4;

    harness.fleet().push(&Harness::names(&["a"])).unwrap();
    assert!(harness.transport.rebooted.borrow().is_empty());
}

#[test]
fn unexpected_switch_code_is_a_remote_procedure_failure() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.switch_code = 1;

    let err =
        harness.fleet().push(&Harness::names(&["a"])).unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::RemoteProcedure(name, _)) if name == "a"
    ));
}

#[test]
fn push_aborts_when_a_node_is_unreachable_before_deploy() {
    let mut harness = Harness::new(&[("a", "10.0.0.1")]);
    write_deploy_files(&harness.top, &["a"]);
    harness.transport.down.insert("10.0.0.1".to_string());

    let err =
        harness.fleet().push(&Harness::names(&["a"])).unwrap_err();
    assert!(matches!(
        tool_error(&err),
        Some(ToolError::Unreachable(_))
    ));
    // Built, but never copied or switched.
    assert_eq!(harness.compiler.calls.borrow().len(), 1);
    assert!(harness.transport.switched.borrow().is_empty());
}
