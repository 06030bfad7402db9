use std::path::PathBuf;

use clap::Parser;
use mysql_replay::{
    backend::MySqlDatabase, config::Config, feed::EventFeed, logging, router::Replayer,
};

const DEFAULT_LOG_PATH: &str = "./test.dat";

#[derive(Debug, Parser)]
#[command(
    name = "mysql-replay",
    about = "Replay a captured MySQL statement log with its original timing"
)]
struct Cli {
    /// Path to the captured statement log.
    #[arg(short = 'f', long = "file", default_value = DEFAULT_LOG_PATH)]
    file: PathBuf,
    /// Path to config TOML. Defaults to `./mysql-replay.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;
    let database = MySqlDatabase::from_dsn(&config.dsn)?;
    let feed = EventFeed::open(&cli.file).await?;

    tracing::info!(file = %cli.file.display(), "replaying log");
    let summary = Replayer::new(database, &config.replay).run(feed).await?;
    println!("{summary}");

    Ok(())
}
