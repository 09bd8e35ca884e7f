use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::Config;

pub mod s3;

pub use s3::S3Store;

#[derive(thiserror::Error, Debug)]
pub enum ObjectStorageError {
    #[error("Storage provider is not defined in the `[joblogs]` configuration")]
    ProviderNotConfigured,

    #[error("Unknown storage provider `{0}`")]
    UnknownProvider(String),

    #[error("Container name is not set in the `[joblogs]` configuration")]
    ContainerNameNotSet,

    #[error("Missing `{key}` in `[joblogs.storage.{provider}]`")]
    MissingProviderArg { provider: String, key: String },

    #[error("Invalid value for `{key}` in `[joblogs.storage.{provider}]`: {message}")]
    InvalidProviderArg {
        provider: String,
        key: String,
        message: String,
    },

    #[error("Environment variable `{variable}` is not set for argument `{argument}`")]
    MissingEnvVariable { variable: String, argument: String },

    #[error("Container `{container_name}` does not exist: {raw_error_message}")]
    ContainerDoesNotExist {
        container_name: String,
        raw_error_message: String,
    },

    #[error("Invalid container name `{container_name}`: {raw_error_message}")]
    InvalidContainerName {
        container_name: String,
        raw_error_message: String,
    },

    #[error("Error on object `{object_key}`: {raw_error_message}")]
    ObjectError {
        object_key: String,
        raw_error_message: String,
    },

    #[error("Unexpected object storage error: {raw_error_message}")]
    Unexpected { raw_error_message: String },
}

impl ObjectStorageError {
    /// Configuration and container errors cannot be retried; object-level
    /// and unexpected errors can, by whoever holds the local file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObjectStorageError::ProviderNotConfigured
                | ObjectStorageError::UnknownProvider(_)
                | ObjectStorageError::ContainerNameNotSet
                | ObjectStorageError::MissingProviderArg { .. }
                | ObjectStorageError::InvalidProviderArg { .. }
                | ObjectStorageError::MissingEnvVariable { .. }
                | ObjectStorageError::ContainerDoesNotExist { .. }
                | ObjectStorageError::InvalidContainerName { .. }
        )
    }
}

/// Upload-only view of an object store, enough for archiving job logs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn container_name(&self) -> &str;

    async fn upload(&self, local_path: &Path, object_key: &str) -> Result<(), ObjectStorageError>;

    /// Prefix probe, so compressed and plain variants of the same log both
    /// count as already uploaded.
    async fn exists_with_prefix(&self, prefix: &str) -> Result<bool, ObjectStorageError>;

    async fn check_container(&self) -> Result<(), ObjectStorageError>;
}

/// Storage registry, keyed by the configured provider id. Provider arguments
/// go through `${ENV}` substitution before the store sees them.
pub fn from_config(config: &Config) -> Result<Arc<dyn ObjectStore>, ObjectStorageError> {
    let joblogs = config.joblogs().ok_or(ObjectStorageError::ProviderNotConfigured)?;
    let provider = joblogs
        .storage_provider()
        .ok_or(ObjectStorageError::ProviderNotConfigured)?;
    let container_name = joblogs.container_name().ok_or(ObjectStorageError::ContainerNameNotSet)?;

    let mut args = BTreeMap::new();
    for (key, value) in config.joblogs_storage(provider).unwrap_or_default() {
        let substituted = substitute_variables(&value, &key)?;
        args.insert(key, substituted);
    }

    match provider {
        s3::PROVIDER_ID => Ok(Arc::new(S3Store::new(container_name, &args)?)),
        other => Err(ObjectStorageError::UnknownProvider(other.to_string())),
    }
}

lazy_static! {
    static ref VARIABLE_PATTERN: Regex = Regex::new(r"\$\{([^}]+)}").unwrap();
}

/// Replaces `${VAR}` placeholders from the process environment. A missing
/// variable is a configuration error; `\${` keeps the literal text.
pub(crate) fn substitute_variables(value: &str, argument: &str) -> Result<String, ObjectStorageError> {
    substitute_variables_with(value, argument, |variable| env::var(variable).ok())
}

fn substitute_variables_with<F>(value: &str, argument: &str, lookup: F) -> Result<String, ObjectStorageError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(value.len());
    let mut last = 0;
    for captures in VARIABLE_PATTERN.captures_iter(value) {
        let whole = captures.get(0).unwrap_or_else(|| unreachable!("group 0 always matches"));

        if whole.start() > 0 && value.as_bytes()[whole.start() - 1] == b'\\' {
            result.push_str(&value[last..whole.start() - 1]);
            result.push_str(whole.as_str());
            last = whole.end();
            continue;
        }

        let variable = &captures[1];
        let substituted = lookup(variable).ok_or_else(|| ObjectStorageError::MissingEnvVariable {
            variable: variable.to_string(),
            argument: argument.to_string(),
        })?;
        result.push_str(&value[last..whole.start()]);
        result.push_str(substituted.trim().trim_matches('"').trim_matches('\''));
        last = whole.end();
    }
    result.push_str(&value[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn lookup(values: &BTreeMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
        move |variable| values.get(variable).cloned()
    }

    #[test]
    fn placeholders_are_substituted() {
        let env = btreemap! {
            "S3_KEY".to_string() => "AKIA123".to_string(),
        };
        let result = substitute_variables_with("${S3_KEY}", "key", lookup(&env)).unwrap();
        assert_eq!(result, "AKIA123");

        let result = substitute_variables_with("prefix-${S3_KEY}-suffix", "key", lookup(&env)).unwrap();
        assert_eq!(result, "prefix-AKIA123-suffix");
    }

    #[test]
    fn values_without_placeholders_pass_through() {
        let env = BTreeMap::new();
        let result = substitute_variables_with("eu-west-1", "region", lookup(&env)).unwrap();
        assert_eq!(result, "eu-west-1");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let env = BTreeMap::new();
        let err = substitute_variables_with("${NOPE}", "key", lookup(&env)).unwrap_err();
        assert!(matches!(err, ObjectStorageError::MissingEnvVariable { variable, argument }
            if variable == "NOPE" && argument == "key"));
    }

    #[test]
    fn quotes_and_whitespace_are_stripped_from_values() {
        let env = btreemap! {
            "SECRET".to_string() => "  \"hunter2\"  ".to_string(),
        };
        let result = substitute_variables_with("${SECRET}", "secret", lookup(&env)).unwrap();
        assert_eq!(result, "hunter2");
    }

    #[test]
    fn escaped_placeholders_are_kept() {
        let env = BTreeMap::new();
        let result = substitute_variables_with(r"\${NOT_A_VAR}", "key", lookup(&env)).unwrap();
        assert_eq!(result, "${NOT_A_VAR}");
    }

    #[test]
    fn fatal_and_transient_errors() {
        assert!(
            ObjectStorageError::ContainerDoesNotExist {
                container_name: "logs".to_string(),
                raw_error_message: "404".to_string(),
            }
            .is_fatal()
        );
        assert!(
            !ObjectStorageError::ObjectError {
                object_key: "logs/p/s/j.log".to_string(),
                raw_error_message: "timeout".to_string(),
            }
            .is_fatal()
        );
        assert!(
            !ObjectStorageError::Unexpected {
                raw_error_message: "?".to_string(),
            }
            .is_fatal()
        );
    }
}
