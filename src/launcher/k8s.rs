use std::env;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Api;
use kube::api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

use super::{JobInfo, JobState, Launcher, LauncherError, SuspendedJob, signal_number, spider_command};
use crate::config::{Config, ProjectConfig};
use crate::events::{LABEL_JOB_ID, LABEL_PROJECT, LABEL_SPIDER};

pub const LAUNCHER_ID: &str = "k8s";

const JOB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Runs every job as a Kubernetes Batch Job with a single pod.
pub struct K8sLauncher {
    client: kube::Client,
    namespace: String,
    pull_secret: Option<String>,
}

impl K8sLauncher {
    /// Connects in-cluster when possible, falling back to the local
    /// kube-config, and verifies the API server is reachable.
    pub async fn new(config: &Config) -> Result<K8sLauncher, LauncherError> {
        let client = kube::Client::try_default().await?;
        client.apiserver_version().await?;

        Ok(K8sLauncher {
            client,
            namespace: config.namespace().to_string(),
            pull_secret: config.pull_secret().map(str::to_string),
        })
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn jobs_with_selector(&self, selector: &str) -> Result<Vec<Job>, LauncherError> {
        let params = ListParams::default().labels(selector);
        Ok(self.jobs().list(&params).await?.items)
    }

    async fn find_job(&self, project_id: &str, job_id: &str) -> Result<Option<Job>, LauncherError> {
        let jobs = self.jobs_with_selector(&format!("{LABEL_JOB_ID}={job_id}")).await?;
        let Some(job) = jobs.into_iter().next() else {
            return Ok(None);
        };
        if job_label(&job, LABEL_PROJECT).as_deref() != Some(project_id) {
            error!("Job {} does not belong to project {}", job_id, project_id);
            return Ok(None);
        }
        Ok(Some(job))
    }

    async fn find_pod(&self, project_id: &str, job_id: &str) -> Result<Option<Pod>, LauncherError> {
        let params = ListParams::default().labels(&format!("{LABEL_JOB_ID}={job_id}"));
        let pods = self.pods().list(&params).await?.items;
        let Some(pod) = pods.into_iter().next() else {
            return Ok(None);
        };
        let project = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_PROJECT).cloned());
        if project.as_deref() != Some(project_id) {
            error!("Pod of job {} does not belong to project {}", job_id, project_id);
            return Ok(None);
        }
        Ok(Some(pod))
    }

    /// The spider is a child of the container entrypoint, so the signal is
    /// broadcast to the pod's shared pid namespace rather than sent to pid 1.
    async fn kill_pod(&self, pod_name: &str, signal: i32) -> Result<(), LauncherError> {
        let command = vec!["/usr/sbin/killall5".to_string(), format!("-{signal}")];
        let process = self
            .pods()
            .exec(pod_name, command, &AttachParams::default().stderr(true))
            .await?;
        process.join().await.map_err(|err| {
            LauncherError::UnexpectedOutput(format!("cannot signal pod {pod_name}: {err}"))
        })?;
        Ok(())
    }

    async fn job_name_for_id(&self, job_id: &str) -> Result<Option<String>, LauncherError> {
        let jobs = self.jobs_with_selector(&format!("{LABEL_JOB_ID}={job_id}")).await?;
        Ok(jobs.into_iter().next().and_then(|job| job.metadata.name))
    }
}

#[async_trait]
impl Launcher for K8sLauncher {
    fn node_name(&self) -> String {
        let deployment = env::var("MY_DEPLOYMENT_NAME").unwrap_or_else(|_| "default".to_string());
        match env::var("MY_NAMESPACE") {
            Ok(namespace) => format!("{namespace}.{deployment}"),
            Err(_) => deployment,
        }
    }

    async fn list_jobs(&self, project: Option<&str>) -> Result<Vec<JobInfo>, LauncherError> {
        let selector = match project {
            Some(project) => format!("{LABEL_PROJECT}={project}"),
            None => LABEL_PROJECT.to_string(),
        };
        let jobs = self.jobs_with_selector(&selector).await?;
        Ok(jobs.iter().map(parse_job).collect())
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
        info!(
            "Scheduling job {} with start_suspended={} in namespace {}",
            job_id, start_suspended, self.namespace
        );
        let job = build_job(
            project,
            version,
            spider,
            job_id,
            settings,
            args,
            self.pull_secret.as_deref(),
            start_suspended,
        )?;
        match self.jobs().create(&PostParams::default(), &job).await {
            Ok(_) => Ok(()),
            Err(err) if is_error_code(&err, 409) => Err(LauncherError::AlreadyExists {
                job_id: job_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn cancel(
        &self,
        project_id: &str,
        job_id: &str,
        signal: &str,
    ) -> Result<Option<JobState>, LauncherError> {
        let Some(job) = self.find_job(project_id, job_id).await? else {
            return Ok(None);
        };

        let prevstate = job_state(&job);
        match prevstate {
            JobState::Finished => {}
            JobState::Running => {
                let signal = signal_number(signal)
                    .ok_or_else(|| LauncherError::UnknownSignal(signal.to_string()))?;
                // if the pod has just ended there is nothing left to kill
                if let Some(pod) = self.find_pod(project_id, job_id).await? {
                    if let Some(pod_name) = pod.metadata.name.as_deref() {
                        self.kill_pod(pod_name, signal).await?;
                    }
                }
            }
            _ => {
                // not started yet, delete the whole job
                let name = job
                    .metadata
                    .name
                    .unwrap_or_else(|| job_name(project_id, job_id));
                let params = DeleteParams {
                    grace_period_seconds: Some(0),
                    ..DeleteParams::foreground()
                };
                self.jobs().delete(&name, &params).await?;
            }
        }
        Ok(Some(prevstate))
    }

    async fn unsuspend(&self, job_id: &str) -> bool {
        let job_name = match self.job_name_for_id(job_id).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                error!("Cannot unsuspend job {}: job name not found", job_id);
                return false;
            }
            Err(err) => {
                error!("Cannot unsuspend job {}: {}", job_id, err);
                return false;
            }
        };

        let patch = json!({"spec": {"suspend": false}});
        match self
            .jobs()
            .patch(&job_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
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
        let jobs = self.jobs_with_selector(LABEL_JOB_ID).await?;
        let count = jobs.iter().filter(|job| is_active(job)).count();
        debug!("Found {} active jobs", count);
        Ok(count)
    }

    async fn list_suspended(&self) -> Result<Vec<SuspendedJob>, LauncherError> {
        let jobs = self.jobs_with_selector(LABEL_JOB_ID).await?;
        Ok(jobs
            .iter()
            .filter(|job| is_suspended(job))
            .filter_map(|job| {
                Some(SuspendedJob {
                    job_id: job_label(job, LABEL_JOB_ID)?,
                    created_at: job.metadata.creation_timestamp.as_ref().map(|time| time.0),
                })
            })
            .collect())
    }
}

fn job_name(project_id: &str, job_id: &str) -> String {
    format!("spiderd-{project_id}-{job_id}")
}

fn job_label(job: &Job, name: &str) -> Option<String> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(name).cloned())
}

fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let ready = status.and_then(|status| status.ready).unwrap_or(0);
    let succeeded = status.and_then(|status| status.succeeded).unwrap_or(0);
    let failed = status.and_then(|status| status.failed).unwrap_or(0);

    if ready > 0 {
        JobState::Running
    } else if succeeded > 0 || failed > 0 {
        JobState::Finished
    } else {
        JobState::Pending
    }
}

fn is_suspended(job: &Job) -> bool {
    job.spec
        .as_ref()
        .and_then(|spec| spec.suspend)
        .unwrap_or(false)
}

fn is_active(job: &Job) -> bool {
    let status = job.status.as_ref();
    let completed = status.and_then(|status| status.completion_time.as_ref()).is_some();
    let failed = status.and_then(|status| status.failed).unwrap_or(0) > 0;
    !is_suspended(job) && !completed && !failed
}

fn format_time(time: &Time) -> String {
    time.0.format(JOB_TIME_FORMAT).to_string()
}

fn parse_job(job: &Job) -> JobInfo {
    let state = job_state(job);
    let status = job.status.as_ref();
    let start_time = match state {
        JobState::Running | JobState::Finished => {
            status.and_then(|status| status.start_time.as_ref()).map(format_time)
        }
        _ => None,
    };
    let end_time = match state {
        JobState::Finished => status
            .and_then(|status| status.completion_time.as_ref())
            .map(format_time),
        _ => None,
    };

    JobInfo {
        id: job_label(job, LABEL_JOB_ID),
        state,
        project: job_label(job, LABEL_PROJECT),
        spider: job_label(job, LABEL_SPIDER),
        start_time,
        end_time,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_job(
    project: &ProjectConfig<'_>,
    version: &str,
    spider: &str,
    job_id: &str,
    settings: &[(String, String)],
    args: &[(String, String)],
    pull_secret: Option<&str>,
    start_suspended: bool,
) -> Result<Job, LauncherError> {
    let name = job_name(project.id(), job_id);
    let image = format!("{}:{version}", project.repository()?);
    let labels = json!({
        LABEL_JOB_ID: job_id,
        LABEL_PROJECT: project.id(),
        LABEL_SPIDER: spider,
    });

    let mut env_from = Vec::new();
    if let Some(config_map) = project.env_config() {
        env_from.push(json!({"configMapRef": {"name": config_map, "optional": false}}));
    }
    if let Some(secret) = project.env_secret() {
        env_from.push(json!({"secretRef": {"name": secret, "optional": false}}));
    }

    let resources = project.resources(Some(spider));
    let pull_secrets: Vec<_> = pull_secret.iter().map(|name| json!({"name": name})).collect();

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": name, "labels": labels},
        "spec": {
            "suspend": start_suspended,
            "completions": 1,
            // failed spider runs are not retried
            "backoffLimit": 0,
            "template": {
                "metadata": {"name": name, "labels": labels},
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": image,
                        "args": spider_command(spider, args, settings),
                        "env": [
                            {"name": "SCRAPY_PROJECT", "value": project.id()},
                            {"name": "SCRAPYD_SPIDER", "value": spider},
                            {"name": "SCRAPYD_JOB", "value": job_id},
                        ],
                        "envFrom": env_from,
                        "resources": {
                            "requests": resources.requests,
                            "limits": resources.limits,
                        },
                    }],
                    // an init process so the whole process group can be signalled
                    "shareProcessNamespace": true,
                    "restartPolicy": "Never",
                    "imagePullSecrets": pull_secrets,
                }
            }
        }
    });

    Ok(serde_json::from_value(manifest)?)
}

fn is_error_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ini::Ini;

    fn test_config() -> Config {
        let content = r#"
[scrapyd]
namespace = spiders

[project.shop]
repository = registry.example.com/shop-spiders
env_config = shop-env
env_secret = shop-secrets

[project.shop.resources]
requests_cpu = 100m
limits_memory = 256Mi
"#;
        Config::from_ini(Ini::load_from_str(content).unwrap()).unwrap()
    }

    fn job_from_json(value: serde_json::Value) -> Job {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn state_ready_is_running() {
        let job = job_from_json(json!({"status": {"ready": 1, "active": 1}}));
        assert_eq!(job_state(&job), JobState::Running);
    }

    #[test]
    fn state_succeeded_or_failed_is_finished() {
        let job = job_from_json(json!({"status": {"succeeded": 1}}));
        assert_eq!(job_state(&job), JobState::Finished);
        let job = job_from_json(json!({"status": {"failed": 1}}));
        assert_eq!(job_state(&job), JobState::Finished);
    }

    #[test]
    fn state_default_is_pending() {
        let job = job_from_json(json!({"status": {}}));
        assert_eq!(job_state(&job), JobState::Pending);
        let job = job_from_json(json!({"spec": {"suspend": true}}));
        assert_eq!(job_state(&job), JobState::Pending);
    }

    #[test]
    fn suspended_jobs_are_not_active() {
        let suspended = job_from_json(json!({"spec": {"suspend": true}, "status": {}}));
        assert!(is_suspended(&suspended));
        assert!(!is_active(&suspended));

        let running = job_from_json(json!({"spec": {"suspend": false}, "status": {"active": 1}}));
        assert!(!is_suspended(&running));
        assert!(is_active(&running));

        let failed = job_from_json(json!({"spec": {}, "status": {"failed": 1}}));
        assert!(!is_active(&failed));
    }

    #[test]
    fn build_job_produces_labelled_suspended_manifest() {
        let config = test_config();
        let project = config.project("shop").unwrap();
        let job = build_job(&project, "1.4", "toscrape", "j-1", &[], &[], Some("pull-secret"), true).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("spiderd-shop-j-1"));
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_JOB_ID).map(String::as_str), Some("j-1"));
        assert_eq!(labels.get(LABEL_PROJECT).map(String::as_str), Some("shop"));
        assert_eq!(labels.get(LABEL_SPIDER).map(String::as_str), Some("toscrape"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.suspend, Some(true));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.completions, Some(1));

        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.share_process_namespace, Some(true));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));

        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.example.com/shop-spiders:1.4"));
        assert_eq!(
            container.args.as_ref().unwrap()[..3],
            ["scrapy".to_string(), "crawl".to_string(), "toscrape".to_string()]
        );
        let resources = container.resources.as_ref().unwrap();
        assert!(resources.requests.as_ref().unwrap().contains_key("cpu"));
        assert!(resources.limits.as_ref().unwrap().contains_key("memory"));
        assert_eq!(container.env_from.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn parse_job_exposes_times_only_when_relevant() {
        let job = job_from_json(json!({
            "metadata": {"labels": {
                LABEL_JOB_ID: "j-1", LABEL_PROJECT: "shop", LABEL_SPIDER: "toscrape",
            }},
            "status": {
                "succeeded": 1,
                "startTime": "2026-05-01T10:00:00Z",
                "completionTime": "2026-05-01T10:05:00Z",
            }
        }));
        let info = parse_job(&job);
        assert_eq!(info.state, JobState::Finished);
        assert_eq!(info.start_time.as_deref(), Some("2026-05-01 10:00:00.000000"));
        assert_eq!(info.end_time.as_deref(), Some("2026-05-01 10:05:00.000000"));

        let pending = job_from_json(json!({
            "metadata": {"labels": {LABEL_JOB_ID: "j-2"}},
            "status": {"startTime": "2026-05-01T10:00:00Z"}
        }));
        let info = parse_job(&pending);
        assert_eq!(info.state, JobState::Pending);
        assert_eq!(info.start_time, None);
        assert_eq!(info.end_time, None);
    }

    #[test]
    fn api_error_code_matching() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(is_error_code(&conflict, 409));
        assert!(!is_error_code(&conflict, 404));
    }
}
