//! Conductor CLI entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conductor::cli::commands::{definition, run, serve, task};
use conductor::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon installs its own configured subscriber.
    if !matches!(cli.command, Commands::Serve(_)) {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Serve(args) => serve::execute(args, config, cli.json).await,
        Commands::Submit(args) => run::submit(args, config, cli.json).await,
        Commands::Cancel(args) => run::cancel(args, config, cli.json).await,
        Commands::Validate { file } => definition::validate(file, config, cli.json).await,
        Commands::Show(args) => run::show(args, config, cli.json).await,
        Commands::Runs(args) => run::list(args, config, cli.json).await,
        Commands::Definition(args) => definition::execute(args, config, cli.json).await,
        Commands::Task(args) => task::execute(args, config, cli.json).await,
    };

    if let Err(err) = result {
        conductor::cli::handle_error(err, cli.json);
    }
}
