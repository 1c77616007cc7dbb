use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use equity_research::{
    checkpoint::{CheckpointStore, FINAL_REPORT_FILE},
    cli::{self, Cli, Command},
    config::{Config, LogFormat},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let Command::Analyze(args) = cli.command;
    args.apply(&mut config);

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ticker = %args.ticker,
        offline = args.offline,
        work_dir = %config.checkpoint.work_dir.display(),
        "equity-research starting"
    );

    tokio::select! {
        result = cli::analyze(&config, &args) => match result {
            Ok(outcome) => {
                let record = &outcome.record;
                match outcome.stop_reason {
                    Some(reason) => info!(
                        analysis_id = %record.analysis_id,
                        stop_reason = %reason,
                        iterations = record.iterations.len(),
                        cost_usd = record.usage.cost_usd,
                        "Analysis finished"
                    ),
                    None => info!(analysis_id = %record.analysis_id, "Reused completed analysis"),
                }
                println!("{}", outcome.analysis_dir.join(FINAL_REPORT_FILE).display());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Analysis failed");
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning in-flight iteration");
            let work_dir = &config.checkpoint.work_dir;
            let latest = CheckpointStore::find_latest_for_ticker(work_dir, &args.ticker).await;
            if let Ok(Some(path)) = latest {
                warn!(checkpoint = %path.display(), "Rerun to resume from the last checkpoint");
            }
            std::process::exit(1);
        }
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
