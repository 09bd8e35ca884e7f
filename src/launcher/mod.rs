use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serializer;
use serde_derive::Serialize;

use crate::cmd::command::CommandError;
use crate::config::{Config, ConfigError, ProjectConfig};

pub mod docker;
pub mod k8s;

pub use docker::DockerLauncher;
pub use k8s::K8sLauncher;

#[derive(thiserror::Error, Debug)]
pub enum LauncherError {
    #[error("a workload for job `{job_id}` already exists")]
    AlreadyExists { job_id: String },

    #[error("unknown launcher `{0}`")]
    UnknownLauncher(String),

    #[error("unknown signal `{0}`")]
    UnknownSignal(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid workload manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("unexpected backend output: {0}")]
    UnexpectedOutput(String),
}

/// Scrapyd job lifecycle, as reported to API clients. Backends that know
/// more states than the wire protocol pass them through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Other(state) => state,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: Option<String>,
    pub state: JobState,
    pub project: Option<String>,
    pub spider: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// A workload created suspended and not yet released by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedJob {
    pub job_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Uniform contract over workload backends. One job maps to one container
/// workload, labelled with project, spider and job id.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn node_name(&self) -> String;

    async fn list_jobs(&self, project: Option<&str>) -> Result<Vec<JobInfo>, LauncherError>;

    /// Creates the workload for a job. With `start_suspended` the workload is
    /// created but not started until `unsuspend` clears the flag.
    #[allow(clippy::too_many_arguments)]
    async fn schedule(
        &self,
        project: &ProjectConfig<'_>,
        version: &str,
        spider: &str,
        job_id: &str,
        settings: &[(String, String)],
        args: &[(String, String)],
        start_suspended: bool,
    ) -> Result<(), LauncherError>;

    /// Returns the state the job was in before cancellation, or `None` when
    /// no such job exists. Running jobs receive `signal` in their whole
    /// process group; pending ones are deleted; finished ones are left alone.
    async fn cancel(&self, project_id: &str, job_id: &str, signal: &str)
    -> Result<Option<JobState>, LauncherError>;

    /// Releases a suspended workload. Returns whether the backend accepted.
    async fn unsuspend(&self, job_id: &str) -> bool;

    /// Number of workloads currently executing: not suspended, not terminal.
    async fn running_count(&self) -> Result<usize, LauncherError>;

    async fn list_suspended(&self) -> Result<Vec<SuspendedJob>, LauncherError>;
}

pub enum Backend {
    Kubernetes(Arc<K8sLauncher>),
    Docker(Arc<DockerLauncher>),
}

impl Backend {
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        match self {
            Backend::Kubernetes(launcher) => launcher.clone(),
            Backend::Docker(launcher) => launcher.clone(),
        }
    }
}

/// Backend registry, keyed by the `launcher` configuration value.
pub async fn from_config(config: &Config) -> Result<Backend, LauncherError> {
    match config.launcher_id() {
        k8s::LAUNCHER_ID => Ok(Backend::Kubernetes(Arc::new(K8sLauncher::new(config).await?))),
        docker::LAUNCHER_ID => Ok(Backend::Docker(Arc::new(DockerLauncher::new(config)))),
        other => Err(LauncherError::UnknownLauncher(other.to_string())),
    }
}

/// Container command line launching one spider run: arguments first,
/// settings after, the way `scrapy crawl` expects them.
pub(crate) fn spider_command(
    spider: &str,
    args: &[(String, String)],
    settings: &[(String, String)],
) -> Vec<String> {
    let mut command = vec!["scrapy".to_string(), "crawl".to_string(), spider.to_string()];
    for (key, value) in args {
        command.push("-a".to_string());
        command.push(format!("{key}={value}"));
    }
    for (key, value) in settings {
        command.push("-s".to_string());
        command.push(format!("{key}={value}"));
    }
    command
}

/// Signal name (without the `SIG` prefix) to number, as delivered to the
/// workload's process group.
pub fn signal_number(name: &str) -> Option<i32> {
    Some(match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ABRT" => libc::SIGABRT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_map_to_numbers() {
        assert_eq!(signal_number("TERM"), Some(libc::SIGTERM));
        assert_eq!(signal_number("KILL"), Some(libc::SIGKILL));
        assert_eq!(signal_number("INT"), Some(libc::SIGINT));
        assert_eq!(signal_number("WINCH"), None);
        assert_eq!(signal_number("SIGTERM"), None);
    }

    #[test]
    fn spider_command_places_args_before_settings() {
        let args = vec![("start_url".to_string(), "https://example.com".to_string())];
        let settings = vec![("LOG_LEVEL".to_string(), "DEBUG".to_string())];
        assert_eq!(
            spider_command("toscrape", &args, &settings),
            vec![
                "scrapy",
                "crawl",
                "toscrape",
                "-a",
                "start_url=https://example.com",
                "-s",
                "LOG_LEVEL=DEBUG",
            ]
        );
    }

    #[test]
    fn job_state_serializes_to_scrapyd_terms() {
        assert_eq!(serde_json::to_string(&JobState::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&JobState::Finished).unwrap(), "\"finished\"");
        assert_eq!(
            serde_json::to_string(&JobState::Other("paused".to_string())).unwrap(),
            "\"paused\""
        );
    }
}
