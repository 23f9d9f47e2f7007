mod collector;
mod config;
mod crontab;
mod dispatcher;
mod env;
mod error;
mod executor;
mod http;
mod logging;
mod metrics;
mod schedule;
mod status;
mod task;
mod watcher;

use clap::Parser;
use collector::Collector;
use config::Config;
use dispatcher::Dispatcher;
use metrics::Metrics;
use status::StatusAggregator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// concron: a container-oriented cron supervisor.
#[derive(Parser)]
#[command(name = "concron", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Probe the configured listener's /livez and exit 0/1 instead of running.
    #[arg(long)]
    health_check: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    if cli.health_check {
        std::process::exit(health_check(&config.listen).await);
    }

    if let Err(e) = logging::init(&config.log_level) {
        eprintln!("{e}");
        std::process::exit(config::EXIT_STARTUP_FAILURE);
    }

    info!(version = env!("CARGO_PKG_VERSION"), listen = %config.listen, "start concron");

    let shutdown = CancellationToken::new();
    let exit_code = run(config, shutdown).await;
    std::process::exit(exit_code);
}

async fn run(config: Config, shutdown: CancellationToken) -> i32 {
    let metrics = Arc::new(Metrics::new(env!("CARGO_PKG_VERSION"), "unknown"));
    let status = StatusAggregator::new(metrics.clone());

    let dispatcher = Dispatcher::new();
    let dispatcher_handle = dispatcher.handle();
    let dispatcher_task = tokio::spawn(dispatcher.run());

    if let Some(body) = &config.inline_crontab {
        if let Err(parse_err) = load_inline_crontab(body, &dispatcher_handle, &status, shutdown.clone()).await {
            let fatal = error::FatalError::InlineCrontab {
                source: "CONCRON_CRONTAB".to_string(),
                error: parse_err,
            };
            error!(error = %fatal, "fatal");
            dispatcher_handle.stop().await;
            return config::EXIT_INLINE_CRONTAB_FAILURE;
        }
    }

    let collector = Collector::new(
        config.paths.clone(),
        dispatcher_handle.clone(),
        status.clone(),
        shutdown.clone(),
    )
    .await;
    collector.register().await;

    let app_state = http::AppState { status: status.clone(), metrics: metrics.clone() };
    let app = http::router(app_state);

    let listener = match TcpListener::bind(resolve_listen_addr(&config.listen)).await {
        Ok(l) => l,
        Err(source) => {
            let fatal = error::FatalError::Bind { addr: config.listen.clone(), source };
            error!(error = %fatal, "fatal");
            dispatcher_handle.stop().await;
            return config::EXIT_STARTUP_FAILURE;
        }
    };

    let http_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_shutdown.cancelled().await;
            })
            .await
    });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = wait_for_signal() => {
            shutdown.cancel();
        }
    }

    status.start_terminating();
    dispatcher_handle.stop().await;
    let _ = dispatcher_task.await;

    if tokio::time::timeout(std::time::Duration::from_secs(10), server).await.is_err() {
        error!("http server did not shut down within the grace period");
    }

    config::EXIT_OK
}

async fn load_inline_crontab(
    body: &str,
    dispatcher: &dispatcher::DispatcherHandle,
    status: &StatusAggregator,
    cancel: CancellationToken,
) -> Result<(), error::ParseError> {
    const SOURCE: &str = "CONCRON_CRONTAB";

    let ct = crontab::parse_crontab(SOURCE, body, env::Environ::for_execution())?;

    let watcher = Arc::new(InlineRegistrar {
        dispatcher: dispatcher.clone(),
        status: status.clone(),
        cancel,
    });
    watcher.register(ct.tasks).await;
    Ok(())
}

/// A minimal stand-in for a file-backed [`Watcher`] that registers a
/// one-off, never-reloaded task set — used for `CONCRON_CRONTAB`, which
/// has no file to observe.
struct InlineRegistrar {
    dispatcher: dispatcher::DispatcherHandle,
    status: StatusAggregator,
    cancel: CancellationToken,
}

impl InlineRegistrar {
    async fn register(self: Arc<Self>, tasks: Vec<task::Task>) {
        let finish = self.status.start_load("CONCRON_CRONTAB".to_string());
        for t in &tasks {
            if t.is_reboot {
                let t = t.clone();
                let status = self.status.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    executor::run(&t, &status, &cancel).await;
                });
                continue;
            }
            let Some(schedule) = t.schedule.clone() else { continue };
            let t = t.clone();
            let status = self.status.clone();
            let cancel = self.cancel.clone();
            let action: dispatcher::Action = Arc::new(move || {
                let t = t.clone();
                let status = status.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    executor::run(&t, &status, &cancel).await;
                })
            });
            self.dispatcher.add(schedule, action).await;
        }
        finish(Ok(tasks));
    }
}

/// Parses `CONCRON_LISTEN`, which follows `net.Listen`'s `[host]:port`
/// convention — an empty host means "all interfaces".
fn resolve_listen_addr(listen: &str) -> SocketAddr {
    let normalized = if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    };
    normalized
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health_check(listen: &str) -> i32 {
    let addr = resolve_listen_addr(listen);
    let url = format!("http://127.0.0.1:{}/livez", addr.port());
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => config::EXIT_OK,
        _ => config::EXIT_STARTUP_FAILURE,
    }
}
