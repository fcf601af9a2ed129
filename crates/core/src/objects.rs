use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::warn;

pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Derived location of the out-of-band metadata object for a content key.
pub fn metadata_key(content_key: &str) -> String {
    format!("{content_key}{METADATA_SUFFIX}")
}

/// Minimal object-store client for content and side-channel metadata
/// objects. Writes and deletes are retried on transient failures; deleting
/// an already-absent object is success.
pub struct ObjectStoreClient {
    client: Client,
    endpoint: String,
    bucket: String,
    retry: RetryPolicy,
}

impl ObjectStoreClient {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            retry,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    pub async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.retry
            .run("object put", || {
                let request = self
                    .client
                    .put(self.object_url(key))
                    .body(body.clone());
                async move {
                    let response = request.send().await?;
                    map_status("object-store", response.status())
                }
            })
            .await
    }

    pub async fn put_metadata(&self, content_key: &str, metadata: &Value) -> Result<()> {
        let payload = serde_json::to_vec(metadata)?;
        self.put_object(&metadata_key(content_key), payload).await
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.retry
            .run("object delete", || {
                let request = self.client.delete(self.object_url(key));
                async move {
                    let response = request.send().await?;
                    delete_status_ok("object-store", response.status())
                }
            })
            .await
    }

    /// Remove a content object together with its derived metadata object.
    /// Metadata cleanup failure is reported but does not mask content
    /// deletion having succeeded.
    pub async fn delete_with_metadata(&self, content_key: &str) -> Result<()> {
        self.delete_object(content_key).await?;
        if let Err(error) = self.delete_object(&metadata_key(content_key)).await {
            warn!(key = %metadata_key(content_key), %error, "metadata object cleanup failed");
            return Err(error);
        }
        Ok(())
    }
}

/// Deleting an object that is already gone is done, not an error.
fn delete_status_ok(backend: &str, status: StatusCode) -> Result<()> {
    if status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    map_status(backend, status)
}

fn map_status(backend: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(RagError::transient(backend, status.to_string()));
    }
    Err(RagError::BackendResponse {
        backend: backend.to_string(),
        details: status.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_key_appends_the_suffix() {
        assert_eq!(
            metadata_key("repo/coll/report.txt"),
            "repo/coll/report.txt.metadata.json"
        );
    }

    #[test]
    fn server_errors_map_to_transient() {
        let error = map_status("object-store", StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
        assert!(error.is_transient());

        let error = map_status("object-store", StatusCode::FORBIDDEN).unwrap_err();
        assert!(!error.is_transient());

        assert!(map_status("object-store", StatusCode::OK).is_ok());
    }

    #[test]
    fn deleting_an_absent_object_is_success() {
        assert!(delete_status_ok("object-store", StatusCode::NOT_FOUND).is_ok());
        assert!(delete_status_ok("object-store", StatusCode::NO_CONTENT).is_ok());

        // 404 is only benign for deletes, not for writes.
        assert!(map_status("object-store", StatusCode::NOT_FOUND).is_err());

        let error = delete_status_ok("object-store", StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
        assert!(error.is_transient());
    }
}
