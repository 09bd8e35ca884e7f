use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::events::{EventKind, WorkloadEvent};
use crate::launcher::{Launcher, SuspendedJob};

/// Enforces the `max_proc` cap: jobs scheduled at the cap are created
/// suspended, and terminal pod events release the oldest suspended job.
pub struct JobScheduler {
    launcher: Arc<dyn Launcher>,
    max_proc: u32,
    wakeup: Notify,
}

impl JobScheduler {
    pub fn start(launcher: Arc<dyn Launcher>, max_proc: u32) -> Arc<JobScheduler> {
        let scheduler = Arc::new(JobScheduler {
            launcher,
            max_proc,
            wakeup: Notify::new(),
        });

        // one unsuspend pass at a time; wakeups during a pass coalesce into
        // a single followup pass
        let worker = scheduler.clone();
        tokio::spawn(async move {
            loop {
                worker.wakeup.notified().await;
                worker.check_and_unsuspend().await;
            }
        });
        debug!("Job scheduler started with max_proc={}", max_proc);

        scheduler
    }

    /// Creation-time decision, from a snapshot of the running count. A count
    /// that cannot be read schedules unsuspended, like an empty cluster.
    pub async fn start_suspended(&self) -> bool {
        match self.launcher.running_count().await {
            Ok(count) => count as u32 >= self.max_proc,
            Err(err) => {
                error!("Cannot count running jobs, scheduling unsuspended: {}", err);
                false
            }
        }
    }

    /// Watcher callback. Must stay cheap: it only wakes the worker.
    pub fn handle_event(&self, event: &WorkloadEvent) {
        if frees_capacity(event) {
            info!(
                "Pod {} has completed with phase {:?}. Checking for suspended jobs.",
                event.workload.name, event.workload.phase
            );
            self.wakeup.notify_one();
        }
    }

    async fn check_and_unsuspend(&self) {
        let mut running = match self.launcher.running_count().await {
            Ok(count) => count as u32,
            Err(err) => {
                error!("Cannot count running jobs: {}", err);
                return;
            }
        };
        debug!("Current running jobs: {}, max_proc: {}", running, self.max_proc);

        while running < self.max_proc {
            let Some(job_id) = self.next_suspended_job_id().await else {
                info!("No suspended jobs to unsuspend.");
                break;
            };
            if self.launcher.unsuspend(&job_id).await {
                running += 1;
                info!("Unsuspended job {}. Total running jobs now: {}", job_id, running);
            } else {
                // the next terminal event retries
                error!("Failed to unsuspend job {}", job_id);
                break;
            }
        }
    }

    async fn next_suspended_job_id(&self) -> Option<String> {
        match self.launcher.list_suspended().await {
            Ok(jobs) => next_in_fifo_order(jobs),
            Err(err) => {
                error!("Cannot list suspended jobs: {}", err);
                None
            }
        }
    }
}

/// Terminal transition of a job workload: capacity may have been freed.
fn frees_capacity(event: &WorkloadEvent) -> bool {
    event.workload.job_id.is_some()
        && event.workload.phase.is_terminal()
        && matches!(event.kind, EventKind::Modified | EventKind::Deleted)
}

/// Oldest creation timestamp wins; jobs without one sort last; ties break on
/// job id so the pick is deterministic.
fn next_in_fifo_order(jobs: Vec<SuspendedJob>) -> Option<String> {
    jobs.into_iter()
        .min_by_key(|job| (job.created_at.unwrap_or(DateTime::<Utc>::MAX_UTC), job.job_id.clone()))
        .map(|job| job.job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::events::{Workload, WorkloadPhase};
    use crate::launcher::{JobInfo, JobState, LauncherError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct MockLauncher {
        running: Mutex<u32>,
        suspended: Mutex<Vec<SuspendedJob>>,
        unsuspended: Mutex<Vec<String>>,
        accept_unsuspend: bool,
    }

    impl MockLauncher {
        fn new(running: u32, suspended: Vec<SuspendedJob>) -> Arc<MockLauncher> {
            Arc::new(MockLauncher {
                running: Mutex::new(running),
                suspended: Mutex::new(suspended),
                unsuspended: Mutex::new(vec![]),
                accept_unsuspend: true,
            })
        }
    }

    #[async_trait]
    impl Launcher for MockLauncher {
        fn node_name(&self) -> String {
            "test-node".to_string()
        }

        async fn list_jobs(&self, _project: Option<&str>) -> Result<Vec<JobInfo>, LauncherError> {
            Ok(vec![])
        }

        async fn schedule(
            &self,
            _project: &ProjectConfig<'_>,
            _version: &str,
            _spider: &str,
            _job_id: &str,
            _settings: &[(String, String)],
            _args: &[(String, String)],
            _start_suspended: bool,
        ) -> Result<(), LauncherError> {
            Ok(())
        }

        async fn cancel(
            &self,
            _project_id: &str,
            _job_id: &str,
            _signal: &str,
        ) -> Result<Option<JobState>, LauncherError> {
            Ok(None)
        }

        async fn unsuspend(&self, job_id: &str) -> bool {
            if !self.accept_unsuspend {
                return false;
            }
            self.suspended.lock().unwrap().retain(|job| job.job_id != job_id);
            self.unsuspended.lock().unwrap().push(job_id.to_string());
            *self.running.lock().unwrap() += 1;
            true
        }

        async fn running_count(&self) -> Result<usize, LauncherError> {
            Ok(*self.running.lock().unwrap() as usize)
        }

        async fn list_suspended(&self) -> Result<Vec<SuspendedJob>, LauncherError> {
            Ok(self.suspended.lock().unwrap().clone())
        }
    }

    fn scheduler(launcher: Arc<MockLauncher>, max_proc: u32) -> JobScheduler {
        JobScheduler {
            launcher,
            max_proc,
            wakeup: Notify::new(),
        }
    }

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn suspended(job_id: &str, created_at: Option<DateTime<Utc>>) -> SuspendedJob {
        SuspendedJob {
            job_id: job_id.to_string(),
            created_at,
        }
    }

    #[test]
    fn fifo_prefers_oldest_creation_timestamp() {
        let jobs = vec![
            suspended("late", at(300)),
            suspended("early", at(100)),
            suspended("middle", at(200)),
        ];
        assert_eq!(next_in_fifo_order(jobs), Some("early".to_string()));
    }

    #[test]
    fn fifo_sorts_missing_timestamps_last() {
        let jobs = vec![suspended("unknown", None), suspended("known", at(100))];
        assert_eq!(next_in_fifo_order(jobs), Some("known".to_string()));
    }

    #[test]
    fn fifo_breaks_timestamp_ties_on_job_id() {
        let jobs = vec![suspended("b", at(100)), suspended("a", at(100))];
        assert_eq!(next_in_fifo_order(jobs), Some("a".to_string()));
        assert_eq!(next_in_fifo_order(vec![]), None);
    }

    #[test]
    fn terminal_modified_and_deleted_events_free_capacity() {
        let event = |kind, phase, job_id: Option<&str>| WorkloadEvent {
            kind,
            workload: Workload {
                name: "pod".to_string(),
                job_id: job_id.map(str::to_string),
                project: None,
                spider: None,
                phase,
                resource_version: None,
            },
        };

        assert!(frees_capacity(&event(EventKind::Modified, WorkloadPhase::Succeeded, Some("j1"))));
        assert!(frees_capacity(&event(EventKind::Deleted, WorkloadPhase::Failed, Some("j1"))));
        assert!(!frees_capacity(&event(EventKind::Added, WorkloadPhase::Succeeded, Some("j1"))));
        assert!(!frees_capacity(&event(EventKind::Modified, WorkloadPhase::Running, Some("j1"))));
        assert!(!frees_capacity(&event(EventKind::Modified, WorkloadPhase::Succeeded, None)));
    }

    #[tokio::test]
    async fn unsuspends_in_fifo_order_until_cap() {
        let launcher = MockLauncher::new(
            0,
            vec![
                suspended("third", at(300)),
                suspended("first", at(100)),
                suspended("second", at(200)),
            ],
        );
        let scheduler = scheduler(launcher.clone(), 2);

        scheduler.check_and_unsuspend().await;

        let unsuspended = launcher.unsuspended.lock().unwrap().clone();
        assert_eq!(unsuspended, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(launcher.suspended.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn does_nothing_at_capacity() {
        let launcher = MockLauncher::new(2, vec![suspended("waiting", at(100))]);
        let scheduler = scheduler(launcher.clone(), 2);

        scheduler.check_and_unsuspend().await;
        assert!(launcher.unsuspended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_proc_zero_never_unsuspends_and_always_suspends() {
        let launcher = MockLauncher::new(0, vec![suspended("waiting", at(100))]);
        let scheduler = scheduler(launcher.clone(), 0);

        assert!(scheduler.start_suspended().await);
        scheduler.check_and_unsuspend().await;
        assert!(launcher.unsuspended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stops_the_pass_when_unsuspend_is_refused() {
        let launcher = Arc::new(MockLauncher {
            running: Mutex::new(0),
            suspended: Mutex::new(vec![suspended("stuck", at(100)), suspended("next", at(200))]),
            unsuspended: Mutex::new(vec![]),
            accept_unsuspend: false,
        });
        let scheduler = scheduler(launcher.clone(), 4);

        scheduler.check_and_unsuspend().await;
        assert!(launcher.unsuspended.lock().unwrap().is_empty());
        assert_eq!(launcher.suspended.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn start_suspended_follows_the_snapshot() {
        let launcher = MockLauncher::new(1, vec![]);
        let scheduler = scheduler(launcher.clone(), 2);
        assert!(!scheduler.start_suspended().await);

        *launcher.running.lock().unwrap() = 2;
        assert!(scheduler.start_suspended().await);
    }
}
