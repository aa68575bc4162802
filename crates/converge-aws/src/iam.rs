//! IAM roles and instance profiles
//!
//! An instance profile is conventionally named identically to the role it
//! carries. Deleting either one first detaches everything that would make
//! IAM reject the delete with `DeleteConflict`.

use crate::context::AwsContext;
use crate::error::{cloud_error, invalid_request};
use aws_sdk_iam::Client;
use converge_common::ResourceKind;
use converge_core::cloud::{ResourceApi, ResourceRef, ResourceSpec};
use converge_core::error::CloudError;
use tracing::{debug, info};

/// The trust policy allowing EC2 to assume the role
const EC2_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "ec2.amazonaws.com"
            },
            "Action": "sts:AssumeRole"
        }
    ]
}"#;

/// IAM client for managing roles and instance profiles
#[derive(Debug, Clone)]
pub struct IamClient {
    client: Client,
}

impl IamClient {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.iam_client(),
        }
    }

    /// Create a role.
    ///
    /// Recognised params: `assume_role_policy` (defaults to the EC2 trust
    /// policy), `description`, and `policy_name` with `policy` to attach an
    /// inline policy document.
    async fn create_role(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        let trust = spec
            .params
            .get("assume_role_policy")
            .map(String::as_str)
            .unwrap_or(EC2_ASSUME_ROLE_POLICY);
        let inline = match (spec.params.get("policy_name"), spec.params.get("policy")) {
            (Some(name), Some(document)) => Some((name, document)),
            (None, None) => None,
            _ => return Err(invalid_request("policy_name and policy must be given together")),
        };

        info!(role_name = %spec.name, "Creating IAM role");
        let response = self
            .client
            .create_role()
            .role_name(&spec.name)
            .assume_role_policy_document(trust)
            .set_description(spec.params.get("description").cloned())
            .send()
            .await
            .map_err(cloud_error)?;

        if let Some((policy_name, document)) = inline {
            self.client
                .put_role_policy()
                .role_name(&spec.name)
                .policy_name(policy_name)
                .policy_document(document)
                .send()
                .await
                .map_err(cloud_error)?;
            debug!(role_name = %spec.name, policy_name = %policy_name, "Attached inline policy");
        }

        let id = response.role().map(|r| r.arn()).unwrap_or(spec.name.as_str());
        Ok(ResourceRef::new(ResourceKind::Role, id, &spec.name))
    }

    /// Create an instance profile, adding the role named by the `role`
    /// param when present.
    async fn create_instance_profile(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        info!(profile_name = %spec.name, "Creating instance profile");
        let response = self
            .client
            .create_instance_profile()
            .instance_profile_name(&spec.name)
            .send()
            .await
            .map_err(cloud_error)?;

        if let Some(role) = spec.params.get("role") {
            self.client
                .add_role_to_instance_profile()
                .instance_profile_name(&spec.name)
                .role_name(role)
                .send()
                .await
                .map_err(cloud_error)?;
            debug!(profile_name = %spec.name, role_name = %role, "Added role to instance profile");
        }

        let id = response
            .instance_profile()
            .map(|p| p.arn())
            .unwrap_or(spec.name.as_str());
        Ok(ResourceRef::new(ResourceKind::InstanceProfile, id, &spec.name))
    }

    async fn role_exists(&self, name: &str) -> Result<bool, CloudError> {
        not_found_as_false(
            self.client
                .get_role()
                .role_name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(cloud_error),
        )
    }

    async fn instance_profile_exists(&self, name: &str) -> Result<bool, CloudError> {
        not_found_as_false(
            self.client
                .get_instance_profile()
                .instance_profile_name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(cloud_error),
        )
    }

    async fn delete_role(&self, name: &str) -> Result<(), CloudError> {
        info!(role_name = %name, "Deleting IAM role");

        let profiles = self
            .client
            .list_instance_profiles_for_role()
            .role_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        for profile in profiles.instance_profiles() {
            self.client
                .remove_role_from_instance_profile()
                .instance_profile_name(profile.instance_profile_name())
                .role_name(name)
                .send()
                .await
                .map_err(cloud_error)?;
        }

        let inline = self
            .client
            .list_role_policies()
            .role_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        for policy_name in inline.policy_names() {
            self.client
                .delete_role_policy()
                .role_name(name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(cloud_error)?;
        }

        let attached = self
            .client
            .list_attached_role_policies()
            .role_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        for policy in attached.attached_policies() {
            if let Some(arn) = policy.policy_arn() {
                self.client
                    .detach_role_policy()
                    .role_name(name)
                    .policy_arn(arn)
                    .send()
                    .await
                    .map_err(cloud_error)?;
            }
        }

        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<(), CloudError> {
        info!(profile_name = %name, "Deleting instance profile");

        let response = self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        if let Some(profile) = response.instance_profile() {
            for role in profile.roles() {
                self.client
                    .remove_role_from_instance_profile()
                    .instance_profile_name(name)
                    .role_name(role.role_name())
                    .send()
                    .await
                    .map_err(cloud_error)?;
            }
        }

        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }
}

fn not_found_as_false(result: Result<(), CloudError>) -> Result<bool, CloudError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found_for(ResourceKind::Role) => Ok(false),
        Err(e) => Err(e),
    }
}

impl ResourceApi for IamClient {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        match spec.kind {
            ResourceKind::Role => self.create_role(spec).await,
            ResourceKind::InstanceProfile => self.create_instance_profile(spec).await,
            other => Err(invalid_request(format!("IAM client cannot create {other}"))),
        }
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, CloudError> {
        match kind {
            ResourceKind::Role => self.role_exists(name).await,
            ResourceKind::InstanceProfile => self.instance_profile_exists(name).await,
            other => Err(invalid_request(format!("IAM client cannot look up {other}"))),
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        match resource.kind {
            ResourceKind::Role => self.delete_role(&resource.name).await,
            ResourceKind::InstanceProfile => self.delete_instance_profile(&resource.name).await,
            other => Err(invalid_request(format!("IAM client cannot delete {other}"))),
        }
    }
}
