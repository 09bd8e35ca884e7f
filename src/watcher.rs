use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use futures::pin_mut;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{ListParams, WatchParams};
use kube::core::WatchEvent;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventKind, Workload, WorkloadEvent};

pub type SubscriberFn = Box<dyn Fn(&WorkloadEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Watches pod events in one namespace and fans them out to subscribers.
///
/// The watch resumes from the last seen resource version; a `410 Gone`
/// answer resets it and triggers a full re-list, which subscribers observe
/// as a burst of `Added` events for workloads they may already know.
pub struct ResourceWatcher {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    namespace: String,
    base_backoff: Duration,
    backoff_coefficient: u32,
    subscribers: SubscriberSet,
    stop: CancellationToken,
}

impl ResourceWatcher {
    pub fn start(
        client: kube::Client,
        namespace: &str,
        base_backoff: Duration,
        backoff_coefficient: u32,
    ) -> ResourceWatcher {
        let inner = Arc::new(Inner {
            namespace: namespace.to_string(),
            base_backoff,
            backoff_coefficient,
            subscribers: SubscriberSet::default(),
            stop: CancellationToken::new(),
        });
        let handle = tokio::spawn(watch_pods(client, inner.clone()));
        info!("Resource watcher started for namespace '{}'", namespace);

        ResourceWatcher {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn subscribe(&self, callback: SubscriberFn) -> SubscriptionId {
        self.inner.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.unsubscribe(id);
    }

    /// Cooperative shutdown: observed between events and inside backoff
    /// sleeps; waits for the watch task to finish.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Resource watcher stopped for namespace '{}'", self.inner.namespace);
    }
}

/// Subscriber callbacks, guarded so the set cannot change mid-dispatch. A
/// failing callback is logged and does not affect the others.
#[derive(Default)]
struct SubscriberSet {
    subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    fn subscribe(&self, callback: SubscriberFn) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, callback));
        debug!("Subscriber {} added", id);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, SubscriptionId(id): SubscriptionId) {
        self.subscribers.lock().unwrap().retain(|(known, _)| *known != id);
        debug!("Subscriber {} removed", id);
    }

    fn dispatch(&self, event: &WorkloadEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for (id, subscriber) in subscribers.iter() {
            if let Err(err) = subscriber(event) {
                error!("Error notifying subscriber {}: {:#}", id, err);
            }
        }
    }
}

enum StreamOutcome {
    /// Reconnect right away, keeping the resource version.
    Reconnect,
    /// The resource version is gone; re-list from scratch, no backoff.
    Relist,
    /// Transient failure; sleep before reconnecting.
    Backoff,
}

async fn watch_pods(client: kube::Client, inner: Arc<Inner>) {
    let api: Api<Pod> = Api::namespaced(client, &inner.namespace);
    let mut resource_version: Option<String> = None;
    let mut backoff = inner.base_backoff;

    info!("Started watching pods in namespace '{}'", inner.namespace);
    while !inner.stop.is_cancelled() {
        let version = match &resource_version {
            Some(version) => version.clone(),
            None => match list_existing(&api, &inner).await {
                Ok(version) => {
                    resource_version = Some(version.clone());
                    version
                }
                Err(err) => {
                    warn!("Cannot list pods in namespace '{}': {}", inner.namespace, err);
                    if sleep_backoff(&inner, backoff).await {
                        return;
                    }
                    backoff = next_backoff(backoff, inner.backoff_coefficient);
                    continue;
                }
            },
        };

        let stream = match api.watch(&WatchParams::default(), &version).await {
            Ok(stream) => stream,
            Err(err) if is_gone(&err) => {
                warn!("Resource version {} is gone, restarting watch from a full list", version);
                resource_version = None;
                continue;
            }
            Err(err) => {
                warn!("Cannot open pod watch: {}", err);
                if sleep_backoff(&inner, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, inner.backoff_coefficient);
                continue;
            }
        };
        pin_mut!(stream);

        let mut first_event = true;
        let outcome = loop {
            let event = tokio::select! {
                _ = inner.stop.cancelled() => return,
                event = stream.try_next() => event,
            };

            match event {
                Ok(Some(event)) => {
                    if first_event {
                        // the stream is healthy again
                        backoff = inner.base_backoff;
                        first_event = false;
                    }
                    match event {
                        WatchEvent::Added(pod) => dispatch_pod(&inner, EventKind::Added, &pod, &mut resource_version),
                        WatchEvent::Modified(pod) => {
                            dispatch_pod(&inner, EventKind::Modified, &pod, &mut resource_version)
                        }
                        WatchEvent::Deleted(pod) => {
                            dispatch_pod(&inner, EventKind::Deleted, &pod, &mut resource_version)
                        }
                        WatchEvent::Bookmark(bookmark) => {
                            resource_version = Some(bookmark.metadata.resource_version.clone());
                        }
                        WatchEvent::Error(response) if response.code == 410 => {
                            warn!("Received 410 Gone, resetting resource version and restarting watch");
                            resource_version = None;
                            break StreamOutcome::Relist;
                        }
                        WatchEvent::Error(response) => {
                            warn!("Watch error event: {} {}", response.code, response.message);
                            break StreamOutcome::Backoff;
                        }
                    }
                }
                Ok(None) => {
                    debug!("Watch stream ended, reconnecting");
                    break StreamOutcome::Reconnect;
                }
                Err(err) if is_gone(&err) => {
                    warn!("Resource version went stale mid-stream, restarting watch from a full list");
                    resource_version = None;
                    break StreamOutcome::Relist;
                }
                Err(err) => {
                    warn!("Watch stream failed: {}", err);
                    break StreamOutcome::Backoff;
                }
            }
        };

        match outcome {
            StreamOutcome::Reconnect | StreamOutcome::Relist => {}
            StreamOutcome::Backoff => {
                if sleep_backoff(&inner, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, inner.backoff_coefficient);
            }
        }
    }
}

/// Full list of the namespace: every existing pod is dispatched as `Added`
/// so subscribers can resynchronize, then the watch resumes from the list's
/// resource version.
async fn list_existing(api: &Api<Pod>, inner: &Inner) -> Result<String, kube::Error> {
    let pods = api.list(&ListParams::default()).await?;
    let version = pods.metadata.resource_version.clone().unwrap_or_default();
    for pod in &pods.items {
        inner.subscribers.dispatch(&WorkloadEvent {
            kind: EventKind::Added,
            workload: Workload::from_pod(pod),
        });
    }
    Ok(version)
}

fn dispatch_pod(inner: &Inner, kind: EventKind, pod: &Pod, resource_version: &mut Option<String>) {
    if let Some(version) = &pod.metadata.resource_version {
        *resource_version = Some(version.clone());
    }
    let workload = Workload::from_pod(pod);
    debug!("Received event: {:?} for pod: {}", kind, workload.name);
    inner.subscribers.dispatch(&WorkloadEvent { kind, workload });
}

/// Returns `true` when the stop signal fired during the sleep.
async fn sleep_backoff(inner: &Inner, delay: Duration) -> bool {
    info!("Retrying pod watch after {:?}", delay);
    tokio::select! {
        _ = inner.stop.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn next_backoff(current: Duration, coefficient: u32) -> Duration {
    (current * coefficient).min(MAX_BACKOFF)
}

fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 410)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkloadPhase;
    use std::sync::atomic::AtomicUsize;

    fn event() -> WorkloadEvent {
        WorkloadEvent {
            kind: EventKind::Modified,
            workload: Workload {
                name: "pod-1".to_string(),
                job_id: Some("j1".to_string()),
                project: None,
                spider: None,
                phase: WorkloadPhase::Running,
                resource_version: Some("1".to_string()),
            },
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let second = next_backoff(base, 2);
        assert_eq!(second, Duration::from_secs(10));
        assert_eq!(next_backoff(second, 2), Duration::from_secs(20));

        let huge = next_backoff(Duration::from_secs(14 * 60), 2);
        assert_eq!(huge, MAX_BACKOFF);
    }

    #[test]
    fn dispatch_reaches_every_subscriber() {
        let set = SubscriberSet::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        set.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let counter = second.clone();
        set.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        set.dispatch(&event());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_subscriber_does_not_stop_dispatch() {
        let set = SubscriberSet::default();
        set.subscribe(Box::new(|_| anyhow::bail!("subscriber exploded")));
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();
        set.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        set.dispatch(&event());
        set.dispatch(&event());
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let set = SubscriberSet::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        let id = set.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let counter = second.clone();
        set.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        set.unsubscribe(id);
        set.dispatch(&event());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
