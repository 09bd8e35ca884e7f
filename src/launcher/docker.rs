use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::Deserialize;

use super::{JobInfo, JobState, Launcher, LauncherError, SuspendedJob, spider_command};
use crate::cmd::command::{CommandError, HostCommand};
use crate::config::{Config, ProjectConfig};
use crate::events::{LABEL_JOB_ID, LABEL_PROJECT, LABEL_SPIDER};

pub const LAUNCHER_ID: &str = "docker";

/// Runs every job as a container on the local Docker daemon. Suspended jobs
/// are containers in `created` state that have not been started yet.
pub struct DockerLauncher;

impl DockerLauncher {
    pub fn new(_config: &Config) -> DockerLauncher {
        DockerLauncher
    }

    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerDetails>, LauncherError> {
        let filter = format!("label={label_filter}");
        let mut ids = Vec::new();
        docker_exec(
            &["container", "ls", "--all", "--quiet", "--filter", filter.as_str()],
            &mut |line| {
                if !line.trim().is_empty() {
                    ids.push(line.trim().to_string());
                }
            },
            &mut |line| debug!("{}", line),
        )
        .await?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut args = vec!["container".to_string(), "inspect".to_string()];
        args.extend(ids);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut output = String::new();
        docker_exec(
            &args,
            &mut |line| {
                output.push_str(&line);
                output.push('\n');
            },
            &mut |line| debug!("{}", line),
        )
        .await?;

        serde_json::from_str(&output)
            .map_err(|err| LauncherError::UnexpectedOutput(format!("invalid docker inspect output: {err}")))
    }

    async fn find_container(
        &self,
        project_id: &str,
        job_id: &str,
    ) -> Result<Option<ContainerDetails>, LauncherError> {
        let containers = self.list_containers(&format!("{LABEL_JOB_ID}={job_id}")).await?;
        let Some(container) = containers.into_iter().next() else {
            return Ok(None);
        };
        if container.label(LABEL_PROJECT) != Some(project_id) {
            error!("Container of job {} does not belong to project {}", job_id, project_id);
            return Ok(None);
        }
        Ok(Some(container))
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    fn node_name(&self) -> String {
        gethostname::gethostname().to_string_lossy().to_string()
    }

    async fn list_jobs(&self, project: Option<&str>) -> Result<Vec<JobInfo>, LauncherError> {
        let filter = match project {
            Some(project) => format!("{LABEL_PROJECT}={project}"),
            None => LABEL_PROJECT.to_string(),
        };
        let containers = self.list_containers(&filter).await?;
        Ok(containers.iter().map(parse_container).collect())
    }

    async fn schedule(
        &self,
        project: &ProjectConfig<'_>,
        version: &str,
        spider: &str,
        job_id: &str,
        settings: &[(String, String)],
        args: &[(String, String)],
        start_suspended: bool,
    ) -> Result<(), LauncherError> {
        let name = container_name(project.id(), job_id);
        let image = format!("{}:{version}", project.repository()?);
        let resources = project.resources(Some(spider));

        let mut cmd: Vec<String> = vec![
            "container".to_string(),
            "create".to_string(),
            "--name".to_string(),
            name.clone(),
        ];
        for (label, value) in [
            (LABEL_JOB_ID, job_id),
            (LABEL_PROJECT, project.id()),
            (LABEL_SPIDER, spider),
        ] {
            cmd.push("--label".to_string());
            cmd.push(format!("{label}={value}"));
        }
        for (key, value) in [
            ("SCRAPY_PROJECT", project.id()),
            ("SCRAPYD_SPIDER", spider),
            ("SCRAPYD_JOB", job_id),
        ] {
            cmd.push("--env".to_string());
            cmd.push(format!("{key}={value}"));
        }
        if let Some(memory) = resources.limits.get("memory") {
            cmd.push("--memory".to_string());
            cmd.push(memory.clone());
        }
        if let Some(cpu) = resources.limits.get("cpu") {
            cmd.push("--cpu-quota".to_string());
            cmd.push(cpu_to_micro(cpu)?.to_string());
        }
        cmd.push(image);
        cmd.extend(spider_command(spider, args, settings));

        let cmd: Vec<&str> = cmd.iter().map(String::as_str).collect();
        let mut stderr = Vec::new();
        let created = docker_exec(&cmd, &mut |line| debug!("{}", line), &mut |line| stderr.push(line)).await;

        match created {
            Ok(()) => {}
            Err(CommandError::ExitStatusError(_))
                if stderr.iter().any(|line| line.contains("is already in use")) =>
            {
                return Err(LauncherError::AlreadyExists {
                    job_id: job_id.to_string(),
                });
            }
            Err(err) => {
                stderr.iter().for_each(|line| error!("{}", line));
                return Err(err.into());
            }
        }

        if !start_suspended {
            docker_exec(&["container", "start", name.as_str()], &mut |line| debug!("{}", line), &mut |line| {
                error!("{}", line)
            })
            .await?;
        }

        Ok(())
    }

    async fn cancel(
        &self,
        project_id: &str,
        job_id: &str,
        signal: &str,
    ) -> Result<Option<JobState>, LauncherError> {
        let Some(container) = self.find_container(project_id, job_id).await? else {
            return Ok(None);
        };

        let prevstate = container_state(&container.state.status);
        match container.state.status.as_str() {
            "created" | "scheduled" => {
                docker_exec(&["container", "rm", container.id.as_str()], &mut |line| debug!("{}", line), &mut |line| {
                    error!("{}", line)
                })
                .await?;
            }
            "running" => {
                let signal = format!("SIG{signal}");
                docker_exec(
                    &["container", "kill", "--signal", signal.as_str(), container.id.as_str()],
                    &mut |line| debug!("{}", line),
                    &mut |line| error!("{}", line),
                )
                .await?;
            }
            _ => {}
        }
        Ok(Some(prevstate))
    }

    async fn unsuspend(&self, job_id: &str) -> bool {
        let container = match self.list_containers(&format!("{LABEL_JOB_ID}={job_id}")).await {
            Ok(containers) => containers.into_iter().next(),
            Err(err) => {
                error!("Cannot unsuspend job {}: {}", job_id, err);
                return false;
            }
        };
        let Some(container) = container else {
            error!("Cannot unsuspend job {}: container not found", job_id);
            return false;
        };

        let started = docker_exec(
            &["container", "start", container.id.as_str()],
            &mut |line| debug!("{}", line),
            &mut |line| error!("{}", line),
        )
        .await;
        match started {
            Ok(()) => {
                info!("Job {} unsuspended", job_id);
                true
            }
            Err(err) => {
                error!("Error unsuspending job {}: {}", job_id, err);
                false
            }
        }
    }

    async fn running_count(&self) -> Result<usize, LauncherError> {
        let containers = self.list_containers(LABEL_JOB_ID).await?;
        Ok(containers
            .iter()
            .filter(|container| container.state.status == "running")
            .count())
    }

    async fn list_suspended(&self) -> Result<Vec<SuspendedJob>, LauncherError> {
        let containers = self.list_containers(LABEL_JOB_ID).await?;
        Ok(containers
            .iter()
            .filter(|container| container.state.status == "created")
            .filter_map(|container| {
                Some(SuspendedJob {
                    job_id: container.label(LABEL_JOB_ID)?.to_string(),
                    created_at: Some(container.created),
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerDetails {
    id: String,
    created: DateTime<Utc>,
    state: ContainerState,
    config: ContainerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: HashMap<String, String>,
}

impl ContainerDetails {
    fn label(&self, name: &str) -> Option<&str> {
        self.config.labels.get(name).map(String::as_str)
    }
}

fn container_name(project_id: &str, job_id: &str) -> String {
    format!("spiderd_{project_id}_{job_id}")
}

/// Translates a Docker container status to scrapyd terminology; statuses the
/// protocol does not know pass through verbatim.
fn container_state(status: &str) -> JobState {
    match status {
        "created" | "scheduled" => JobState::Pending,
        "exited" => JobState::Finished,
        "running" => JobState::Running,
        other => JobState::Other(other.to_string()),
    }
}

fn parse_container(container: &ContainerDetails) -> JobInfo {
    JobInfo {
        id: container.label(LABEL_JOB_ID).map(str::to_string),
        state: container_state(&container.state.status),
        project: container.label(LABEL_PROJECT).map(str::to_string),
        spider: container.label(LABEL_SPIDER).map(str::to_string),
        start_time: None,
        end_time: None,
    }
}

/// Converts a cpu quantity to microseconds of quota, so `1` -> 1000000 and
/// `100m` -> 100000.
fn cpu_to_micro(value: &str) -> Result<i64, LauncherError> {
    let parse = |raw: &str, scale: f64| -> Result<i64, LauncherError> {
        raw.parse::<f64>()
            .map(|number| (number * scale) as i64)
            .map_err(|_| LauncherError::UnexpectedOutput(format!("unrecognized cpu quantity: {value}")))
    };
    match value.strip_suffix('m') {
        Some(milli) => parse(milli, 1_000.0),
        None => parse(value, 1_000_000.0),
    }
}

async fn docker_exec<F, X>(args: &[&str], stdout_output: &mut F, stderr_output: &mut X) -> Result<(), CommandError>
where
    F: FnMut(String),
    X: FnMut(String),
{
    let mut cmd = HostCommand::new("docker", args, &[]);
    cmd.exec_with_output(stdout_output, stderr_output).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translates_to_scrapyd_terms() {
        assert_eq!(container_state("created"), JobState::Pending);
        assert_eq!(container_state("scheduled"), JobState::Pending);
        assert_eq!(container_state("exited"), JobState::Finished);
        assert_eq!(container_state("running"), JobState::Running);
        assert_eq!(container_state("paused"), JobState::Other("paused".to_string()));
    }

    #[test]
    fn cpu_quantities_convert_to_quota() {
        assert_eq!(cpu_to_micro("1").unwrap(), 1_000_000);
        assert_eq!(cpu_to_micro("0.1").unwrap(), 100_000);
        assert_eq!(cpu_to_micro("500m").unwrap(), 500_000);
        assert_eq!(cpu_to_micro("2.5").unwrap(), 2_500_000);
        assert!(cpu_to_micro("lots").is_err());
    }

    #[test]
    fn inspect_output_parses() {
        let raw = r#"[{
            "Id": "abc123",
            "Name": "/spiderd_shop_j1",
            "Created": "2026-05-01T10:00:00.123456789Z",
            "State": {"Status": "running", "Running": true},
            "Config": {"Labels": {"org.scrapy.job_id": "j1", "org.scrapy.project": "shop", "org.scrapy.spider": "toscrape"}}
        }]"#;
        let containers: Vec<ContainerDetails> = serde_json::from_str(raw).unwrap();
        let info = parse_container(&containers[0]);
        assert_eq!(info.id.as_deref(), Some("j1"));
        assert_eq!(info.state, JobState::Running);
        assert_eq!(info.project.as_deref(), Some("shop"));
        assert_eq!(info.spider.as_deref(), Some("toscrape"));
    }

    #[test]
    fn containers_without_labels_are_tolerated() {
        let raw = r#"[{
            "Id": "abc123",
            "Created": "2026-05-01T10:00:00Z",
            "State": {"Status": "created"},
            "Config": {}
        }]"#;
        let containers: Vec<ContainerDetails> = serde_json::from_str(raw).unwrap();
        assert_eq!(containers[0].label(LABEL_JOB_ID), None);
        assert_eq!(parse_container(&containers[0]).state, JobState::Pending);
    }
}
