//! DynamoDB table status and deletion

use crate::context::AwsContext;
use crate::error::{cloud_error, invalid_request};
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::TableStatus as SdkTableStatus;
use converge_common::ResourceKind;
use converge_core::cloud::{Observed, ResourceApi, ResourceRef, ResourceSpec, TableStatus, TableStatusApi};
use converge_core::error::CloudError;
use tracing::{debug, info};

/// DynamoDB client for table waits
#[derive(Debug, Clone)]
pub struct DynamoDbClient {
    client: Client,
}

impl DynamoDbClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.dynamodb_client(),
        }
    }

    async fn table_status(&self, name: &str) -> Result<TableStatus, CloudError> {
        match self.client.describe_table().table_name(name).send().await {
            Ok(response) => {
                let status = response.table().and_then(|t| t.table_status());
                Ok(table_status(status))
            }
            Err(e) => {
                let err = cloud_error(e);
                if err.is_not_found_for(ResourceKind::Table) {
                    Ok(TableStatus::NotFound)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Map the SDK status; a description without one is still being created.
fn table_status(status: Option<&SdkTableStatus>) -> TableStatus {
    match status {
        Some(SdkTableStatus::Active) => TableStatus::Active,
        Some(SdkTableStatus::Updating) => TableStatus::Updating,
        Some(SdkTableStatus::Deleting) => TableStatus::Deleting,
        Some(SdkTableStatus::Archiving) => TableStatus::Archiving,
        Some(SdkTableStatus::Archived) => TableStatus::Archived,
        Some(SdkTableStatus::InaccessibleEncryptionCredentials) => TableStatus::Inaccessible,
        _ => TableStatus::Creating,
    }
}

impl TableStatusApi for DynamoDbClient {
    async fn describe_tables(&self, names: &[String]) -> Result<Vec<Observed<TableStatus>>, CloudError> {
        let mut observed = Vec::with_capacity(names.len());
        for name in names {
            let status = self.table_status(name).await?;
            debug!(table = %name, status = %status, "Described table");
            observed.push(Observed::new(name.as_str(), status));
        }
        Ok(observed)
    }

    async fn delete_table(&self, name: &str) -> Result<(), CloudError> {
        info!(table = %name, "Deleting table");
        self.client
            .delete_table()
            .table_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }
}

/// Tables are deleted here but never created.
impl ResourceApi for DynamoDbClient {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        Err(invalid_request(format!("DynamoDB client cannot create {}", spec.kind)))
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, CloudError> {
        if kind != ResourceKind::Table {
            return Err(invalid_request(format!("DynamoDB client cannot look up {kind}")));
        }
        Ok(self.table_status(name).await? != TableStatus::NotFound)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        if resource.kind != ResourceKind::Table {
            return Err(invalid_request(format!("DynamoDB client cannot delete {}", resource.kind)));
        }
        self.delete_table(&resource.name).await
    }
}
