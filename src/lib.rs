//! Orchestration core of terranix: discovers nodes from an
//! infrastructure-state document, generates per-node NixOS
//! configurations, builds system closures and pushes them to the
//! nodes over ssh, bootstrapping Nix on machines that lack it.

pub mod build;
pub mod cli;
pub mod commands;
pub mod deploy;
pub mod dispatch;
pub mod errors;
pub mod generate;
pub mod input;
pub mod logging;
pub mod ops;
pub mod probe;
pub mod registry;
