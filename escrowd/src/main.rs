//! The escrowd service binary.

use argh::FromArgs;

mod run;

/// Off-chain escrow payment orchestrator.
#[derive(Debug, FromArgs)]
struct Args {
    #[argh(subcommand)]
    cmd: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunArgs),
}

/// Run the orchestrator until SIGINT/SIGTERM.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
pub(crate) struct RunArgs {
    /// run against an in-process mock ledger instead of the configured
    /// chain indexer (development only)
    #[argh(switch)]
    pub mock_chain: bool,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    escrow_logger::init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match args.cmd {
        Command::Run(run_args) => rt.block_on(run::run(run_args)),
    }
}
