//! CLI binary for watching DomainFlow campaign progress streams.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use domainflow_analytics::{ProgressForecaster, RootCauseAnalyzer};
use domainflow_stream::{
    HttpProgressFetcher, PoolConfig, ProgressFetcher, ProgressStream, SessionConfig, SseConnector,
    StreamPoolManager, TransportCapabilities,
};
use domainflow_types::ProgressUpdate;

#[derive(Parser)]
#[command(name = "dfstream", version, about = "Watch DomainFlow campaign progress streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a campaign's progress until it completes
    Watch {
        /// Push stream endpoint (SSE)
        stream_url: String,

        /// Polling fallback endpoint
        #[arg(long)]
        poll_url: String,

        /// Skip the push transport and poll from the start
        #[arg(long)]
        poll_only: bool,

        /// Polling period in seconds
        #[arg(long, default_value = "5")]
        poll_interval: u64,

        /// Transport retries before giving up
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Print a completion forecast alongside each update
        #[arg(long)]
        forecast: bool,
    },

    /// Fetch the current progress snapshot once
    Poll {
        /// Progress endpoint
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Watch {
            stream_url,
            poll_url,
            poll_only,
            poll_interval,
            max_retries,
            forecast,
        } => {
            cmd_watch(
                &stream_url,
                &poll_url,
                poll_only,
                poll_interval,
                max_retries,
                forecast,
            )
            .await?;
        }
        Commands::Poll { url } => {
            cmd_poll(&url).await?;
        }
    }

    Ok(())
}

fn print_update(update: &ProgressUpdate, forecaster: Option<&mut ProgressForecaster>) {
    let pct = update
        .progress_percent
        .map(|p| format!("{p:5.1}%"))
        .unwrap_or_else(|| "    -".to_string());
    let counts = match (update.analyzed_domains, update.total_domains) {
        (Some(done), Some(total)) => format!(" ({done}/{total})"),
        (Some(done), None) => format!(" ({done})"),
        _ => String::new(),
    };
    let status = update.status.as_deref().unwrap_or("-");
    println!("{pct}  {:<26} {status}{counts}", update.phase);

    if let Some(forecaster) = forecaster {
        forecaster.record(update);
        if let Some(total) = update.total_domains {
            if let Some(forecast) = forecaster.forecast(total) {
                println!(
                    "       eta {}  ({:.1}/s, {} remaining)",
                    forecast.eta.format("%H:%M:%S"),
                    forecast.items_per_second,
                    forecast.remaining_items
                );
            }
        }
    }
}

async fn cmd_watch(
    stream_url: &str,
    poll_url: &str,
    poll_only: bool,
    poll_interval: u64,
    max_retries: u32,
    forecast: bool,
) -> anyhow::Result<()> {
    let config = SessionConfig {
        prefer_push: !poll_only,
        polling_interval: Duration::from_secs(poll_interval),
        max_retries,
        ..SessionConfig::default()
    };
    let capabilities = TransportCapabilities {
        push_supported: !poll_only,
        pooling_available: !poll_only,
    };
    let pool = StreamPoolManager::new(PoolConfig::default(), Arc::new(SseConnector::new()));

    let forecaster = Arc::new(std::sync::Mutex::new(
        forecast.then(ProgressForecaster::new),
    ));
    // Single watch runs see few errors; attribute on the first one.
    let errors = Arc::new(std::sync::Mutex::new(RootCauseAnalyzer::with_thresholds(
        0.5, 1,
    )));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<Result<(), String>>(1);

    let print_forecaster = forecaster.clone();
    let complete_tx = done_tx.clone();
    let error_analyzer = errors.clone();
    let session = ProgressStream::builder(stream_url, poll_url)
        .with_config(config)
        .with_capabilities(capabilities)
        .with_pool(pool)
        .on_connect(|| println!("connected"))
        .on_disconnect(|| println!("disconnected"))
        .on_update(move |update| {
            let mut forecaster = print_forecaster.lock().unwrap();
            print_update(&update, forecaster.as_mut());
        })
        .on_complete(move |update| {
            println!("campaign finished in phase '{}'", update.phase);
            let _ = complete_tx.try_send(Ok(()));
        })
        .on_error(move |err| {
            error_analyzer.lock().unwrap().record(&err);
            let _ = done_tx.try_send(Err(err.to_string()));
        })
        .build();

    session.start().await?;

    let outcome = tokio::select! {
        outcome = done_rx.recv() => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!("interrupted");
            session.stop().await;
            return Ok(());
        }
    };

    session.destroy().await;

    match outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(message)) => {
            if let Some(cause) = errors.lock().unwrap().attribute() {
                tracing::warn!(category = ?cause.category, share = cause.share,
                    "dominant failure category");
            }
            anyhow::bail!("stream failed: {message}")
        }
        None => anyhow::bail!("stream closed unexpectedly"),
    }
}

async fn cmd_poll(url: &str) -> anyhow::Result<()> {
    let fetcher = HttpProgressFetcher::new();
    let update = fetcher.fetch(url).await?;
    println!("{}", serde_json::to_string_pretty(&update)?);
    Ok(())
}
