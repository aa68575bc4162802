//! AWS adapters for converge
//!
//! Implements the `converge-core` collaborator traits on top of the AWS SDK:
//! EC2 instance status, spot requests, key pairs and security groups; IAM
//! roles and instance profiles; SQS queues; DynamoDB table status; S3
//! object download. Every
//! client is built from an explicit [`AwsContext`].

pub mod context;
pub mod dynamodb;
pub mod ec2;
mod error;
pub mod iam;
pub mod resources;
pub mod s3;
pub mod spot_price;
pub mod sqs;

pub use context::AwsContext;
pub use dynamodb::DynamoDbClient;
pub use ec2::Ec2Client;
pub use iam::IamClient;
pub use resources::AwsResources;
pub use s3::S3Client;
pub use sqs::{SqsConnection, SqsConnector};
