mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging (stderr; stdout carries generated text)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llama_bridge=debug")),
        )
        .init();

    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Probe(a) => cli::probe::execute(a).await,
        cli::Commands::Select(a) => cli::select::execute(a).await,
        #[cfg(feature = "llama-cpp")]
        cli::Commands::Run(a) => cli::run::execute(a).await,
        #[cfg(feature = "llama-cpp")]
        cli::Commands::Info(a) => cli::info::execute(a).await,
        cli::Commands::Config(c) => cli::config_cmd::execute(c).await,
    }
}
