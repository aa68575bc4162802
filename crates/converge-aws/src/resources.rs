//! Kind-dispatching resource API
//!
//! Routes each [`ResourceKind`] to the client of the service that owns it,
//! so the lifecycle facades can take one `ResourceApi` for every kind.

use crate::context::AwsContext;
use crate::dynamodb::DynamoDbClient;
use crate::ec2::Ec2Client;
use crate::iam::IamClient;
use crate::sqs::SqsConnection;
use converge_common::ResourceKind;
use converge_core::cloud::{ResourceApi, ResourceRef, ResourceSpec};
use converge_core::error::CloudError;

#[derive(Debug, Clone)]
pub struct AwsResources {
    ec2: Ec2Client,
    iam: IamClient,
    sqs: SqsConnection,
    dynamodb: DynamoDbClient,
}

impl AwsResources {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            ec2: Ec2Client::from_context(ctx),
            iam: IamClient::from_context(ctx),
            sqs: SqsConnection::from_context(ctx),
            dynamodb: DynamoDbClient::from_context(ctx),
        }
    }

    pub fn ec2(&self) -> &Ec2Client {
        &self.ec2
    }

    pub fn dynamodb(&self) -> &DynamoDbClient {
        &self.dynamodb
    }
}

impl ResourceApi for AwsResources {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        match spec.kind {
            ResourceKind::Role | ResourceKind::InstanceProfile => self.iam.create(spec).await,
            ResourceKind::Queue => self.sqs.create(spec).await,
            ResourceKind::Table => self.dynamodb.create(spec).await,
            _ => self.ec2.create(spec).await,
        }
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, CloudError> {
        match kind {
            ResourceKind::Role | ResourceKind::InstanceProfile => self.iam.exists(kind, name).await,
            ResourceKind::Queue => self.sqs.exists(kind, name).await,
            ResourceKind::Table => self.dynamodb.exists(kind, name).await,
            _ => self.ec2.exists(kind, name).await,
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        match resource.kind {
            ResourceKind::Role | ResourceKind::InstanceProfile => self.iam.delete(resource).await,
            ResourceKind::Queue => self.sqs.delete(resource).await,
            ResourceKind::Table => self.dynamodb.delete(resource).await,
            _ => self.ec2.delete(resource).await,
        }
    }
}
