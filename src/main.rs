use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spiderd::api::{self, AppState};
use spiderd::config::{Config, DEFAULT_CONFIG_FILE};
use spiderd::joblogs;
use spiderd::launcher::{self, Backend};
use spiderd::repository;
use spiderd::scheduler::JobScheduler;
use spiderd::watcher::ResourceWatcher;

#[derive(Parser)]
#[command(name = "spiderd", about = "Scrapyd-compatible job server for container workloads")]
struct Cli {
    /// Configuration file; can be repeated, later files override earlier ones.
    #[arg(long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // logging may not be set up yet when configuration fails
        eprintln!("spiderd: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load(&cli.config)?);
    setup_logging(config.log_level())?;

    let repository = repository::from_config(&config)?;
    let backend = launcher::from_config(&config)
        .await
        .context("cannot initialize the workload backend")?;
    let launcher = backend.launcher();

    let mut watcher = None;
    let mut scheduler = None;
    if let Backend::Kubernetes(k8s) = &backend {
        let pod_watcher = ResourceWatcher::start(
            k8s.client(),
            config.namespace(),
            Duration::from_secs(config.backoff_time_secs()?),
            config.backoff_coefficient()?,
        );

        if let Some(max_proc) = config.max_proc()? {
            let job_scheduler = JobScheduler::start(launcher.clone(), max_proc);
            let subscriber = job_scheduler.clone();
            pod_watcher.subscribe(Box::new(move |event| {
                subscriber.handle_event(event);
                Ok(())
            }));
            scheduler = Some(job_scheduler);
        }

        joblogs::init(&config, k8s.client(), &pod_watcher).await?;
        watcher = Some(pod_watcher);
    } else if config.joblogs().is_some() {
        warn!("Job log collection requires the k8s launcher; ignoring the [joblogs] section");
    }

    let state = Arc::new(AppState::new(config.clone(), launcher, repository, scheduler));
    let app = api::router(state);

    let address = format!("{}:{}", config.bind_address(), config.http_port()?);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot listen on {address}"))?;
    info!("Listening on http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    info!("Shutdown complete");
    Ok(())
}

fn setup_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(log_level.to_lowercase())
        .map_err(|err| anyhow::anyhow!("invalid logging level '{log_level}': {err}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Cannot install SIGTERM handler: {}", err);
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = async { let _ = tokio::signal::ctrl_c().await; } => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
