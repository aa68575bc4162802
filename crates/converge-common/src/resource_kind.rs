//! Resource kinds and their capability table
//!
//! Every cloud object the convergence core can wait on is named by a
//! [`ResourceKind`]. Callers pick the kind explicitly; the core never infers
//! it from the shape of a handle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Types of cloud resources managed by converge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// EC2 compute instance
    Instance,
    /// EC2 key pair
    KeyPair,
    /// VPC security group
    SecurityGroup,
    /// IAM role
    Role,
    /// IAM instance profile (named identically to its role)
    InstanceProfile,
    /// SQS message queue
    Queue,
    /// EC2 spot instance request
    SpotRequest,
    /// DynamoDB table
    Table,
}

/// Operations a provider adapter supports for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub create: bool,
    pub describe: bool,
    pub delete: bool,
    pub exists_check: bool,
    /// Creating an existing name succeeds and returns the existing resource
    /// instead of failing with a conflict code
    pub idempotent_create: bool,
}

impl Capabilities {
    const ALL: Capabilities = Capabilities {
        create: true,
        describe: true,
        delete: true,
        exists_check: true,
        idempotent_create: false,
    };

    /// Described and deleted by id, never created through the generic path.
    const UNNAMED: Capabilities = Capabilities {
        create: false,
        describe: true,
        delete: true,
        exists_check: false,
        idempotent_create: false,
    };
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Instance,
        ResourceKind::KeyPair,
        ResourceKind::SecurityGroup,
        ResourceKind::Role,
        ResourceKind::InstanceProfile,
        ResourceKind::Queue,
        ResourceKind::SpotRequest,
        ResourceKind::Table,
    ];

    /// Capability table for this kind.
    ///
    /// Instances and spot requests are launched through dedicated calls
    /// (run/request), not the generic create path, and are never named, so
    /// unique allocation and existence polling do not apply to them. Tables
    /// need a key schema the generic path does not carry; they are waited on
    /// by status instead.
    ///
    /// Queue creation is idempotent: asking for an existing name with the
    /// same attributes hands back the existing queue.
    pub fn capabilities(self) -> Capabilities {
        match self {
            ResourceKind::Instance | ResourceKind::SpotRequest | ResourceKind::Table => Capabilities::UNNAMED,
            ResourceKind::Queue => Capabilities {
                idempotent_create: true,
                ..Capabilities::ALL
            },
            ResourceKind::KeyPair
            | ResourceKind::SecurityGroup
            | ResourceKind::Role
            | ResourceKind::InstanceProfile => Capabilities::ALL,
        }
    }

    /// Provider error codes meaning "a resource with this name already exists".
    pub fn conflict_codes(self) -> &'static [&'static str] {
        match self {
            ResourceKind::KeyPair => &["InvalidKeyPair.Duplicate"],
            ResourceKind::SecurityGroup => &["InvalidGroup.Duplicate"],
            ResourceKind::Role | ResourceKind::InstanceProfile => &["EntityAlreadyExists"],
            ResourceKind::Queue => &["QueueAlreadyExists", "AWS.SimpleQueueService.QueueNameExists"],
            ResourceKind::Instance | ResourceKind::SpotRequest | ResourceKind::Table => &[],
        }
    }

    /// Provider error codes meaning "no resource with this id/name".
    pub fn not_found_codes(self) -> &'static [&'static str] {
        match self {
            ResourceKind::Instance => &["InvalidInstanceID.NotFound"],
            ResourceKind::KeyPair => &["InvalidKeyPair.NotFound"],
            ResourceKind::SecurityGroup => &["InvalidGroup.NotFound", "InvalidGroupId.Malformed"],
            ResourceKind::Role | ResourceKind::InstanceProfile => &["NoSuchEntity"],
            ResourceKind::Queue => &[
                "AWS.SimpleQueueService.NonExistentQueue",
                "QueueDoesNotExist",
            ],
            ResourceKind::SpotRequest => &["InvalidSpotInstanceRequestID.NotFound"],
            ResourceKind::Table => &["ResourceNotFoundException"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::KeyPair => "key-pair",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::Role => "role",
            ResourceKind::InstanceProfile => "instance-profile",
            ResourceKind::Queue => "queue",
            ResourceKind::SpotRequest => "spot-request",
            ResourceKind::Table => "table",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}
