use async_trait::async_trait;

use super::{Repository, RepositoryError, parse_spiders_label};
use crate::cmd::command::{CommandError, HostCommand};
use crate::events::LABEL_SPIDERS;

pub const REPOSITORY_ID: &str = "local";

/// Probes images already present on the local Docker daemon; useful for
/// development setups where nothing is pushed to a registry.
pub struct Local;

impl Local {
    pub fn new() -> Local {
        Local
    }
}

impl Default for Local {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for Local {
    async fn listtags(&self, repo: &str) -> Result<Vec<String>, RepositoryError> {
        let mut tags = Vec::new();
        let mut cmd = HostCommand::new("docker", &["image", "ls", repo, "--format", "{{ .Tag }}"], &[]);
        cmd.exec_with_output(
            &mut |line| {
                let tag = line.trim().to_string();
                if !tag.is_empty() && tag != "<none>" {
                    tags.push(tag);
                }
            },
            &mut |line| debug!("{}", line),
        )
        .await?;
        Ok(tags)
    }

    async fn listspiders(
        &self,
        repo: &str,
        _project: &str,
        version: &str,
    ) -> Result<Option<Vec<String>>, RepositoryError> {
        let image = format!("{repo}:{version}");
        let format = format!("{{{{ index .Config.Labels \"{LABEL_SPIDERS}\" }}}}");
        let mut output = String::new();
        let mut cmd = HostCommand::new("docker", &["image", "inspect", image.as_str(), "--format", format.as_str()], &[]);
        let ret = cmd
            .exec_with_output(
                &mut |line| {
                    output.push_str(&line);
                    output.push('\n');
                },
                &mut |line| debug!("{}", line),
            )
            .await;

        match ret {
            Ok(()) => {}
            // the image does not exist locally
            Err(CommandError::ExitStatusError(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let label = output.trim();
        if label.is_empty() || label == "<no value>" {
            return Ok(None);
        }
        Ok(Some(parse_spiders_label(label)))
    }
}
