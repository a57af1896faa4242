use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use kline_screener_engine::config::Config;
use kline_screener_engine::engine::persistence;
use kline_screener_engine::error::setup_panic_handler;
use kline_screener_engine::Engine;

#[derive(Debug, StructOpt)]
#[structopt(name = "kline-screener-engine", about = "Real-time kline screener and signal engine")]
struct Opt {
    #[structopt(short = "c", long = "config", default_value = "config.toml")]
    config_file: String,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let level = match opt.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    setup_panic_handler();

    info!("starting kline screener engine");

    let config = Config::from_file(&opt.config_file)?;
    config.validate()?;
    info!(path = %opt.config_file, "configuration loaded");
    info!(symbols = ?config.symbol_universe.symbols, intervals = ?config.scheduler.intervals, "symbol universe and scheduler configured");

    let persistence = persistence::connect(&config.database).await;

    let engine = Arc::new(Engine::build(&config, persistence).await);

    let shutdown_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_engine.shutdown();
        }
    });

    engine.run().await?;

    info!("engine stopped");
    Ok(())
}
