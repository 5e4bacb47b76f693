use tracing::debug;

use terranix::cli::CliOpts;
use terranix::errors::ToolError;
use terranix::logging;

fn main() {
    let args = match <CliOpts as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // --help and --version land here too; only genuine
            // argument errors get the usage exit code.
            let code = if err.use_stderr() {
                ToolError::Usage.exit_code()
            } else {
                0
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(report) = run(args) {
        eprintln!("Error: {report:?}");
        let code = report
            .downcast_ref::<ToolError>()
            .or_else(|| {
                report.chain().find_map(|err| err.downcast_ref())
            })
            .map_or(ToolError::Usage.exit_code(), ToolError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: CliOpts) -> color_eyre::Result<()> {
    logging::setup_logging(&args.verbosity)?;
    debug!("{args:#?}");
    args.command.run()
}
