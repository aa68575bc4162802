//! S3 object listing and download

use crate::context::AwsContext;
use crate::error::cloud_error;
use aws_sdk_s3::Client;
use converge_core::error::CloudError;
use converge_core::transfer::ObjectSource;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// S3 client used as the object source for bulk sync
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
}

impl S3Client {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.s3_client(),
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> CloudError {
    CloudError::new("LocalIoError", format!("{}: {e}", path.display()))
}

impl ObjectSource for S3Client {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CloudError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(cloud_error)?;
            keys.extend(response.contents().iter().filter_map(|o| o.key()).map(str::to_string));

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        debug!(bucket = %bucket, prefix = %prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    async fn download(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), CloudError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(cloud_error)?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| io_error(destination, e))?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| CloudError::transport(format!("reading s3://{bucket}/{key}: {e}")))?
        {
            file.write_all(&chunk).await.map_err(|e| io_error(destination, e))?;
        }
        file.flush().await.map_err(|e| io_error(destination, e))?;

        debug!(key = %key, path = %destination.display(), "Downloaded object");
        Ok(())
    }
}
