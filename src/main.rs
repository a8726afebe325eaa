use anyhow::Result;
use clap::Parser;
use gatecall::{
    app::{AppState, AppStateBuilder},
    call::StatusSender,
    config::{Cli, Command, Config},
    handler::middleware::request_log::AccessLogEventFormat,
    version,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{
    fmt::time::SystemTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(AccessLogEventFormat::new(SystemTime))
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(AccessLogEventFormat::new(SystemTime)),
            )
            .try_init()?;
    }
    let _ = guard_holder; // keep the guard alive

    info!("{}", version::get_short_version());
    let state = AppStateBuilder::new().with_config(config).build().await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await,
        Command::Dial => dial(state).await,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received CTRL+C, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                info!("received CTRL+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("received CTRL+C, shutting down");
    }
}

async fn serve(state: AppState) -> Result<()> {
    info!("starting gatecall on {}", state.config.http_addr);
    let mut app_future = Box::pin(gatecall::app::run(state.clone()));
    tokio::select! {
        result = &mut app_future => result,
        _ = shutdown_signal() => {
            state.token.cancel();
            app_future.await
        }
    }
}

/// Places one call without the HTTP surface and exits with its result.
async fn dial(state: AppState) -> Result<()> {
    if let Some(ua) = state.useragent.clone() {
        tokio::spawn(async move { ua.serve().await });
    }
    let (status, mut events) = StatusSender::channel();
    tokio::spawn(async move {
        while let Some(status) = events.recv().await {
            info!(?status, "call status");
        }
    });

    let mut call = Box::pin(state.place_call(status));
    let result = tokio::select! {
        result = &mut call => result,
        _ = shutdown_signal() => {
            state.token.cancel();
            call.await
        }
    };
    state.shutdown().await;
    let outcome = result?;
    info!(?outcome, "done");
    Ok(())
}
