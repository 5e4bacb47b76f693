use std::io::Read;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use color_eyre::Result;
use color_eyre::eyre::Context;
use tracing::info;

use crate::dispatch::Fleet;
use crate::input::StateProvider;
use crate::ops::{NixCompiler, SshTransport};
use crate::probe::Prober;

#[derive(Parser, Debug)]
/// Deploy Terraform/Terranix described NixOS machines over ssh.
pub struct CliOpts {
    #[command(flatten)]
    /// Increase logging verbosity, can be passed multiple times for
    /// more detailed logs.
    pub verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCmd,
}

#[derive(Subcommand, Debug)]
pub enum CliCmd {
    /// Generate per-node machine configurations.
    Init(NamesArgs),

    /// Like init, but read the input document from stdin instead of
    /// the input hook.
    InitFromJson(NamesArgs),

    /// Install the input hook from a static JSON document.
    Input(InputArgs),

    /// Probe nodes for reachability.
    Check(NamesArgs),

    /// Build system closures for nodes.
    Build(NamesArgs),

    /// Build closures and activate them on the nodes.
    Push(NamesArgs),

    /// Print the version.
    Version,
}

#[derive(Args, Debug)]
pub struct NamesArgs {
    /// Node names; defaults to every declared node when empty.
    pub names: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InputArgs {
    /// Path to the infrastructure state JSON document.
    pub json_path: PathBuf,
}

impl CliCmd {
    pub fn run(self) -> Result<()> {
        let project = std::env::current_dir()
            .context("Failed to resolve the project directory")?;

        match &self {
            Self::Version => {
                println!("terranix {}", clap::crate_version!());
                return Ok(());
            }
            Self::Input(args) => {
                crate::input::install_hook(&project, &args.json_path)?;
                info!("Done!");
                return Ok(());
            }
            _ => {}
        }

        let provider = StateProvider::new(&project);
        let (input, _cache_guard) = match &self {
            Self::InitFromJson(_) => {
                let mut raw = String::new();
                std::io::stdin()
                    .read_to_string(&mut raw)
                    .context("Failed to read input document from stdin")?;
                provider.seed(&raw)?
            }
            _ => provider.resolve()?,
        };

        let compiler = NixCompiler::from_env(&project);
        let transport = SshTransport;
        let fleet = Fleet {
            project: &project,
            input: &input,
            compiler: &compiler,
            transport: &transport,
            prober: Prober::default(),
        };

        match self {
            Self::Init(args) | Self::InitFromJson(args) => {
                fleet.init(&args.names)?;
            }
            Self::Check(args) => fleet.check(&args.names)?,
            Self::Build(args) => {
                fleet.build(&args.names)?;
            }
            Self::Push(args) => fleet.push(&args.names)?,
            Self::Input(_) | Self::Version => unreachable!(),
        }

        info!("Done!");
        Ok(())
    }
}
