//! `booking-stack`: runs the proxy, account, or booking service, or all of
//! them in one process.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use tracing::{error, info};

use booking_server::app::{self, AccountApp, BookingApp};
use booking_server::cli::{AllArgs, Cli, Command, TracingArgs};
use booking_server::observability::{init_logging, install_prometheus};
use booking_server::trace::{build_provider, Tracer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let process = match &cli.command {
        Command::Proxy(_) => "proxy",
        Command::Account(_) => "account",
        Command::Booking(_) => "booking",
        Command::All(_) => "booking-stack",
    };
    // Held for the whole run; the bridge layer's tracer only borrows it.
    let logs = build_provider(
        process,
        cli.tracing.trace_sampled,
        cli.tracing.jaeger_agent.as_deref(),
    )?;
    init_logging(cli.log_format, Some(logs.tracer(process)));

    if let Some(port) = cli.metrics_port {
        install_prometheus(SocketAddr::from(([0, 0, 0, 0], port)))?;
    }

    let tracing = &cli.tracing;
    match cli.command {
        Command::Proxy(args) => {
            let proxy = app::start_proxy(
                args.listen.network("proxy"),
                &args.config(),
                tracer("proxy", tracing)?,
            )
            .await?;
            info!(addr = %proxy.addr(), "proxy running");
            shutdown_signal().await;
            proxy.stop().await?;
        }
        Command::Account(args) => {
            let AccountApp { http, .. } =
                app::start_account(args.network("account"), tracer("account", tracing)?).await?;
            info!(addr = %http.addr(), "account service running");
            shutdown_signal().await;
            http.stop().await?;
        }
        Command::Booking(args) => {
            let booking = app::start_booking(
                args.listen.network("booking"),
                &args.config(),
                tracer("booking", tracing)?,
            )
            .await?;
            info!(addr = %booking.http.addr(), "booking service running");
            shutdown_signal().await;
            let stats = booking.stop().await?;
            info!(?stats, "booking service stopped");
        }
        Command::All(args) => run_all(&args, tracing).await?,
    }

    Ok(())
}

async fn run_all(args: &AllArgs, tracing: &TracingArgs) -> Result<()> {
    let account =
        app::start_account(args.internal_network("account"), tracer("account", tracing)?).await?;
    let booking: BookingApp = app::start_booking(
        args.internal_network("booking"),
        &args.booking_config(account.http.url()),
        tracer("booking", tracing)?,
    )
    .await?;
    let proxy = app::start_proxy(
        args.listen.network("proxy"),
        &args.proxy_config(account.http.url(), booking.http.url()),
        tracer("proxy", tracing)?,
    )
    .await?;
    info!(
        proxy = %proxy.addr(),
        account = %account.http.addr(),
        booking = %booking.http.addr(),
        "booking stack running"
    );

    shutdown_signal().await;

    proxy.stop().await?;
    let stats = booking.stop().await?;
    info!(?stats, "booking service stopped");
    account.http.stop().await?;
    Ok(())
}

/// One provider per service so exported spans carry the right `service.name`.
fn tracer(service: &str, args: &TracingArgs) -> Result<Tracer> {
    let provider = build_provider(service, args.trace_sampled, args.jaeger_agent.as_deref())?;
    Ok(Tracer::with_provider(service, args.config(), provider))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
