use k8s_openapi::api::core::v1::Pod;

pub const LABEL_PROJECT: &str = "org.scrapy.project";
pub const LABEL_SPIDER: &str = "org.scrapy.spider";
pub const LABEL_JOB_ID: &str = "org.scrapy.job_id";
pub const LABEL_SPIDERS: &str = "org.scrapy.spiders";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn from_pod_phase(phase: &str) -> WorkloadPhase {
        match phase {
            "Pending" => WorkloadPhase::Pending,
            "Running" => WorkloadPhase::Running,
            "Succeeded" => WorkloadPhase::Succeeded,
            "Failed" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

/// Backend-independent view of a workload; subscribers never see SDK types.
#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub job_id: Option<String>,
    pub project: Option<String>,
    pub spider: Option<String>,
    pub phase: WorkloadPhase,
    pub resource_version: Option<String>,
}

impl Workload {
    pub fn from_pod(pod: &Pod) -> Workload {
        let label = |name: &str| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(name))
                .cloned()
        };

        Workload {
            name: pod.metadata.name.clone().unwrap_or_default(),
            job_id: label(LABEL_JOB_ID),
            project: label(LABEL_PROJECT),
            spider: label(LABEL_SPIDER),
            phase: pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .map(WorkloadPhase::from_pod_phase)
                .unwrap_or(WorkloadPhase::Unknown),
            resource_version: pod.metadata.resource_version.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadEvent {
    pub kind: EventKind,
    pub workload: Workload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(labels: &[(&str, &str)], phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("spiderd-shop-j1-abcde".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                resource_version: Some("12345".to_string()),
                ..Default::default()
            },
            status: phase.map(|phase| PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_from_labelled_pod() {
        let pod = pod(
            &[(LABEL_JOB_ID, "j1"), (LABEL_PROJECT, "shop"), (LABEL_SPIDER, "toscrape")],
            Some("Running"),
        );
        let workload = Workload::from_pod(&pod);
        assert_eq!(workload.job_id.as_deref(), Some("j1"));
        assert_eq!(workload.project.as_deref(), Some("shop"));
        assert_eq!(workload.spider.as_deref(), Some("toscrape"));
        assert_eq!(workload.phase, WorkloadPhase::Running);
        assert_eq!(workload.resource_version.as_deref(), Some("12345"));
    }

    #[test]
    fn workload_without_labels_or_status() {
        let workload = Workload::from_pod(&pod(&[], None));
        assert_eq!(workload.job_id, None);
        assert_eq!(workload.phase, WorkloadPhase::Unknown);
    }

    #[test]
    fn terminal_phases() {
        assert!(WorkloadPhase::Succeeded.is_terminal());
        assert!(WorkloadPhase::Failed.is_terminal());
        assert!(!WorkloadPhase::Running.is_terminal());
        assert!(!WorkloadPhase::Pending.is_terminal());
        assert!(!WorkloadPhase::Unknown.is_terminal());
    }
}
