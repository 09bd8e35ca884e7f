use std::sync::Arc;

use async_trait::async_trait;

use crate::cmd::command::CommandError;
use crate::config::Config;

pub mod local;
pub mod remote;

pub use local::Local;
pub use remote::Remote;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("unknown repository `{0}`")]
    UnknownRepository(String),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("invalid repository output: {0}")]
    InvalidOutput(String),
}

/// Probe for project image repositories: which tags exist, and which spiders
/// a tag declares in its image labels.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn listtags(&self, repo: &str) -> Result<Vec<String>, RepositoryError>;

    /// Spiders declared by the image label of the requested tag, or `None`
    /// when the tag (or the label) does not exist.
    async fn listspiders(
        &self,
        repo: &str,
        project: &str,
        version: &str,
    ) -> Result<Option<Vec<String>>, RepositoryError>;
}

/// Repository registry, keyed by the `repository` configuration value.
pub fn from_config(config: &Config) -> Result<Arc<dyn Repository>, RepositoryError> {
    match config.repository_id() {
        remote::REPOSITORY_ID => Ok(Arc::new(Remote::new())),
        local::REPOSITORY_ID => Ok(Arc::new(Local::new())),
        other => Err(RepositoryError::UnknownRepository(other.to_string())),
    }
}

/// Splits the comma-separated spiders label into names.
pub(crate) fn parse_spiders_label(label: &str) -> Vec<String> {
    label
        .split(',')
        .map(str::trim)
        .filter(|spider| !spider.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spiders_label_is_split_and_trimmed() {
        assert_eq!(parse_spiders_label("toscrape, quotes ,news"), vec![
            "toscrape".to_string(),
            "quotes".to_string(),
            "news".to_string()
        ]);
        assert_eq!(parse_spiders_label(""), Vec::<String>::new());
        assert_eq!(parse_spiders_label(" , "), Vec::<String>::new());
    }
}
