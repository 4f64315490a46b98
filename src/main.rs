use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use clinic_notifier::config::Config;
use clinic_notifier::scheduler::{self, ManualTarget};
use clinic_notifier::{Context, logger};
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Notification service for the clinic")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the HTTP server (the default).
    Serve,
    /// Evaluates the digest schedule once, as the cron endpoint would.
    Check,
    /// Sends digests now, ignoring the schedule and the send markers.
    Digest {
        #[arg(long = "type", default_value = "both")]
        target: String,
    },
}

async fn run_server(ctx: Arc<Context>) -> anyhow::Result<()> {
    if let Some(interval) = ctx.config.scheduler_interval {
        tracing::info!("evaluating the digest schedule every {}s", interval.as_secs());
        tokio::spawn(scheduler::run_ticker(ctx.clone(), interval));
    }

    let addr = ctx.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");
    axum::serve(listener, clinic_notifier::app(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let ctx = Arc::new(Context::from_config(config)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(ctx).await,
        Command::Check => {
            let results = scheduler::run_check(&ctx, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        Command::Digest { target } => {
            let target: ManualTarget = target.parse()?;
            let outcomes = scheduler::run_manual(&ctx, target, Utc::now()).await?;
            for (kind, outcome) in outcomes {
                println!("{kind}: {}", serde_json::to_string_pretty(&outcome)?);
            }
            Ok(())
        }
    }
}
