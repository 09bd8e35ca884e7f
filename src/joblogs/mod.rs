use std::sync::Arc;

use crate::config::Config;
use crate::object_storage;
use crate::watcher::ResourceWatcher;

pub mod compression;
pub mod log_handler;

pub use log_handler::JobLogHandler;

/// Wires log capture into the watcher when `[joblogs]` is configured with a
/// storage provider.
pub async fn init(
    config: &Config,
    client: kube::Client,
    watcher: &ResourceWatcher,
) -> anyhow::Result<Option<Arc<JobLogHandler>>> {
    let Some(joblogs) = config.joblogs() else {
        debug!("Job logs handling not enabled; 'joblogs' configuration section is missing.");
        return Ok(None);
    };
    if joblogs.storage_provider().is_none() {
        warn!("No storage provider configured; job logs will not be uploaded.");
        return Ok(None);
    }

    let storage = object_storage::from_config(config)?;
    if let Err(err) = storage.check_container().await {
        if err.is_fatal() {
            return Err(err.into());
        }
        // transient; uploads keep their local files until the store recovers
        warn!("Cannot verify storage container '{}': {}", storage.container_name(), err);
    }
    let handler = Arc::new(JobLogHandler::new(config, client, storage)?);

    let subscriber = handler.clone();
    watcher.subscribe(Box::new(move |event| subscriber.handle_event(event)));
    info!("Job logs handler started.");
    Ok(Some(handler))
}
