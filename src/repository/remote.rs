use std::collections::HashMap;

use async_trait::async_trait;
use serde_derive::Deserialize;

use super::{Repository, RepositoryError, parse_spiders_label};
use crate::cmd::command::{CommandError, HostCommand};
use crate::events::LABEL_SPIDERS;

pub const REPOSITORY_ID: &str = "remote";

/// Probes a remote image registry with skopeo, without pulling images.
pub struct Remote;

impl Remote {
    pub fn new() -> Remote {
        Remote
    }
}

impl Default for Remote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for Remote {
    async fn listtags(&self, repo: &str) -> Result<Vec<String>, RepositoryError> {
        let uri = format!("docker://{repo}");
        let output = skopeo_exec(&["list-tags", uri.as_str()]).await??;

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct JsonOutput {
            tags: Vec<String>,
        }

        let output: JsonOutput = serde_json::from_str(&output)
            .map_err(|err| RepositoryError::InvalidOutput(format!("skopeo list-tags: {err}")))?;
        Ok(output.tags)
    }

    async fn listspiders(
        &self,
        repo: &str,
        _project: &str,
        version: &str,
    ) -> Result<Option<Vec<String>>, RepositoryError> {
        let uri = format!("docker://{repo}:{version}");
        let output = match skopeo_exec(&["inspect", uri.as_str()]).await? {
            Ok(output) => output,
            // the tag does not exist in the registry
            Err(CommandError::ExitStatusError(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct JsonOutput {
            labels: Option<HashMap<String, String>>,
        }

        let output: JsonOutput = serde_json::from_str(&output)
            .map_err(|err| RepositoryError::InvalidOutput(format!("skopeo inspect: {err}")))?;
        let Some(label) = output.labels.unwrap_or_default().remove(LABEL_SPIDERS) else {
            return Ok(None);
        };
        Ok(Some(parse_spiders_label(&label)))
    }
}

/// Runs skopeo, separating spawn failures (outer error) from non-zero exits
/// (inner error) so callers can treat a missing tag as an answer.
async fn skopeo_exec(args: &[&str]) -> Result<Result<String, CommandError>, RepositoryError> {
    let mut cmd = HostCommand::new("skopeo", args, &[]);
    let mut output = String::new();
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
        Ok(()) => Ok(Ok(output)),
        Err(err @ CommandError::ExitStatusError(_)) => Ok(Err(err)),
        Err(err) => Err(err.into()),
    }
}
