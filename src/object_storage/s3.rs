use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use rusoto_core::credential::StaticProvider;
use rusoto_core::{Client, HttpClient, Region, RusotoError};
use rusoto_s3::{
    HeadBucketRequest, ListObjectsV2Request, PutObjectRequest, S3 as RusotoS3, S3Client, StreamingBody,
};

use super::{ObjectStorageError, ObjectStore};

pub const PROVIDER_ID: &str = "s3";

/// S3 and S3-compatible stores. Arguments from `[joblogs.storage.s3]`:
/// `key`, `secret`, and `region` and/or `endpoint` (for compatible stores
/// like MinIO or Ceph RGW).
pub struct S3Store {
    client: S3Client,
    container_name: String,
}

impl S3Store {
    pub fn new(container_name: &str, args: &BTreeMap<String, String>) -> Result<S3Store, ObjectStorageError> {
        let required = |key: &str| {
            args.get(key).cloned().ok_or_else(|| ObjectStorageError::MissingProviderArg {
                provider: PROVIDER_ID.to_string(),
                key: key.to_string(),
            })
        };
        let access_key_id = required("key")?;
        let secret_access_key = required("secret")?;
        let region = region_from_args(args)?;

        let credentials = StaticProvider::new(access_key_id, secret_access_key, None, None);
        let http_client = HttpClient::new().map_err(|err| ObjectStorageError::Unexpected {
            raw_error_message: format!("unable to create http client: {err}"),
        })?;
        let client = Client::new_with(credentials, http_client);

        info!("Initialized s3 object storage for container '{}'", container_name);
        Ok(S3Store {
            client: S3Client::new_with_client(client, region),
            container_name: container_name.to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn upload(&self, local_path: &Path, object_key: &str) -> Result<(), ObjectStorageError> {
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|err| ObjectStorageError::ObjectError {
                object_key: object_key.to_string(),
                raw_error_message: format!("cannot read {}: {err}", local_path.display()),
            })?;

        let request = PutObjectRequest {
            bucket: self.container_name.clone(),
            key: object_key.to_string(),
            body: Some(StreamingBody::from(body)),
            ..Default::default()
        };

        match self.client.put_object(request).await {
            Ok(_) => {
                info!(
                    "Successfully uploaded '{}' to container '{}'",
                    object_key, self.container_name
                );
                Ok(())
            }
            Err(err) => Err(classify_error(&self.container_name, object_key, err)),
        }
    }

    async fn exists_with_prefix(&self, prefix: &str) -> Result<bool, ObjectStorageError> {
        let request = ListObjectsV2Request {
            bucket: self.container_name.clone(),
            prefix: Some(prefix.to_string()),
            max_keys: Some(1),
            ..Default::default()
        };

        match self.client.list_objects_v2(request).await {
            Ok(output) => {
                let exists = output.contents.map(|objects| !objects.is_empty()).unwrap_or(false);
                debug!(
                    "Prefix '{}' in container '{}': exists={}",
                    prefix, self.container_name, exists
                );
                Ok(exists)
            }
            Err(err) => Err(classify_error(&self.container_name, prefix, err)),
        }
    }

    async fn check_container(&self) -> Result<(), ObjectStorageError> {
        let request = HeadBucketRequest {
            bucket: self.container_name.clone(),
            expected_bucket_owner: None,
        };
        self.client
            .head_bucket(request)
            .await
            .map_err(|err| classify_error(&self.container_name, "", err))
    }
}

fn region_from_args(args: &BTreeMap<String, String>) -> Result<Region, ObjectStorageError> {
    match (args.get("endpoint"), args.get("region")) {
        (Some(endpoint), region) => Ok(Region::Custom {
            name: region.cloned().unwrap_or_else(|| "custom".to_string()),
            endpoint: endpoint.clone(),
        }),
        (None, Some(region)) => {
            Region::from_str(region).map_err(|err| ObjectStorageError::InvalidProviderArg {
                provider: PROVIDER_ID.to_string(),
                key: "region".to_string(),
                message: err.to_string(),
            })
        }
        (None, None) => Ok(Region::default()),
    }
}

/// Maps an AWS error onto the storage error kinds: missing and invalid
/// containers are fatal, everything object-level is left to the caller.
fn classify_error<E: std::error::Error + 'static>(
    container_name: &str,
    object_key: &str,
    err: RusotoError<E>,
) -> ObjectStorageError {
    match err {
        RusotoError::Unknown(response) => {
            classify_response_body(container_name, object_key, response.body_as_str())
        }
        RusotoError::Service(err) => {
            let message = err.to_string();
            if message.contains("NoSuchBucket") {
                ObjectStorageError::ContainerDoesNotExist {
                    container_name: container_name.to_string(),
                    raw_error_message: message,
                }
            } else {
                ObjectStorageError::ObjectError {
                    object_key: object_key.to_string(),
                    raw_error_message: message,
                }
            }
        }
        RusotoError::HttpDispatch(err) => ObjectStorageError::ObjectError {
            object_key: object_key.to_string(),
            raw_error_message: err.to_string(),
        },
        RusotoError::Credentials(err) => ObjectStorageError::Unexpected {
            raw_error_message: format!("credentials error: {err}"),
        },
        other => ObjectStorageError::Unexpected {
            raw_error_message: other.to_string(),
        },
    }
}

fn classify_response_body(container_name: &str, object_key: &str, body: &str) -> ObjectStorageError {
    if body.contains("NoSuchBucket") {
        ObjectStorageError::ContainerDoesNotExist {
            container_name: container_name.to_string(),
            raw_error_message: body.to_string(),
        }
    } else if body.contains("InvalidBucketName") {
        ObjectStorageError::InvalidContainerName {
            container_name: container_name.to_string(),
            raw_error_message: body.to_string(),
        }
    } else {
        ObjectStorageError::ObjectError {
            object_key: object_key.to_string(),
            raw_error_message: body.to_string(),
        }
    }
}
