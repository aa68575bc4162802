//! EC2 instance status, spot requests, key pairs and security groups

use crate::context::AwsContext;
use crate::error::{cloud_error, invalid_request, missing_field};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange, SummaryStatus};
use converge_common::ResourceKind;
use converge_core::cloud::{
    HealthStatus, InstanceState, InstanceStatus, InstanceStatusApi, Observed, ResourceApi, ResourceRef, ResourceSpec,
    SpotApi, SpotRequestState,
};
use converge_core::error::CloudError;
use std::future::Future;
use tracing::{debug, info, warn};

/// Default CIDR for ingress rules given without one
const DEFAULT_INGRESS_CIDR: &str = "0.0.0.0/0";

/// EC2 client for the convergence collaborator traits
#[derive(Debug, Clone)]
pub struct Ec2Client {
    client: Client,
    region: String,
}

impl Ec2Client {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
            region: ctx.region().to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn create_key_pair(&self, name: &str) -> Result<ResourceRef, CloudError> {
        info!(key_name = %name, region = %self.region, "Creating key pair");
        let response = self
            .client
            .create_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(cloud_error)?;

        let id = response.key_pair_id().unwrap_or(name);
        let mut resource = ResourceRef::new(ResourceKind::KeyPair, id, name);
        resource.material = response.key_material().map(str::to_string);
        Ok(resource)
    }

    async fn key_pair_exists(&self, name: &str) -> Result<bool, CloudError> {
        let result = self.client.describe_key_pairs().key_names(name).send().await;
        match result {
            Ok(response) => Ok(!response.key_pairs().is_empty()),
            Err(e) => {
                let err = cloud_error(e);
                if err.is_not_found_for(ResourceKind::KeyPair) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Create a security group.
    ///
    /// Recognised params: `vpc_id`, `description`, `ingress_ports` (comma
    /// separated TCP ports) and `ingress_cidr`. If the ingress rules cannot
    /// be added the new group is deleted again and the ingress error
    /// returned.
    async fn create_security_group(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        let description = spec
            .params
            .get("description")
            .cloned()
            .unwrap_or_else(|| format!("converge security group {}", spec.name));
        let ports = parse_ports(spec.params.get("ingress_ports").map(String::as_str))?;

        info!(group_name = %spec.name, region = %self.region, "Creating security group");
        let response = self
            .client
            .create_security_group()
            .group_name(&spec.name)
            .description(description)
            .set_vpc_id(spec.params.get("vpc_id").cloned())
            .send()
            .await
            .map_err(cloud_error)?;

        let group_id = response.group_id().ok_or_else(|| missing_field("GroupId"))?.to_string();

        if !ports.is_empty() {
            let cidr = spec
                .params
                .get("ingress_cidr")
                .map(String::as_str)
                .unwrap_or(DEFAULT_INGRESS_CIDR);
            let permissions = ports
                .iter()
                .map(|&port| {
                    IpPermission::builder()
                        .ip_protocol("tcp")
                        .from_port(port)
                        .to_port(port)
                        .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
                        .build()
                })
                .collect::<Vec<_>>();

            let authorize = async {
                self.client
                    .authorize_security_group_ingress()
                    .group_id(&group_id)
                    .set_ip_permissions(Some(permissions))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(cloud_error)
            };
            let created = ResourceRef::new(ResourceKind::SecurityGroup, &group_id, &spec.name);
            undo_on_failure(authorize, || self.delete_security_group(&created)).await?;
            debug!(group_id = %group_id, ?ports, "Added ingress rules");
        }

        Ok(ResourceRef::new(ResourceKind::SecurityGroup, group_id, &spec.name))
    }

    /// Look a group up by id when `name` is shaped like one, else by name.
    async fn security_group_exists(&self, name: &str) -> Result<bool, CloudError> {
        let filter = if is_group_id(name) { "group-id" } else { "group-name" };
        let result = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name(filter).values(name).build())
            .send()
            .await;
        match result {
            Ok(response) => Ok(!response.security_groups().is_empty()),
            Err(e) => {
                let err = cloud_error(e);
                if err.is_not_found_for(ResourceKind::SecurityGroup) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_security_group(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        info!(group = %resource.id, "Deleting security group");
        let request = self.client.delete_security_group();
        let request = if is_group_id(&resource.id) {
            request.group_id(&resource.id)
        } else {
            request.group_name(&resource.name)
        };
        request.send().await.map_err(cloud_error)?;
        Ok(())
    }
}

/// Run `step`; when it fails, run `undo` and return the step's error.
///
/// A failed undo is logged, never returned.
async fn undo_on_failure<S, U, UF>(step: S, undo: U) -> Result<(), CloudError>
where
    S: Future<Output = Result<(), CloudError>>,
    U: FnOnce() -> UF,
    UF: Future<Output = Result<(), CloudError>>,
{
    let Err(e) = step.await else {
        return Ok(());
    };
    warn!(error = %e, "Step failed, undoing");
    if let Err(cleanup) = undo().await {
        warn!(error = %cleanup, "Undo failed");
    }
    Err(e)
}

/// Security group ids are `sg-` followed by hex; anything else is a name.
fn is_group_id(value: &str) -> bool {
    value
        .strip_prefix("sg-")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Distinct ports in first-seen order. EC2 rejects a request that names
/// the same rule twice.
fn parse_ports(value: Option<&str>) -> Result<Vec<i32>, CloudError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let mut ports = Vec::new();
    for p in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port = p
            .parse::<u16>()
            .map(i32::from)
            .map_err(|_| invalid_request(format!("invalid ingress port: {p}")))?;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

fn health_status(status: Option<&SummaryStatus>) -> HealthStatus {
    match status {
        Some(SummaryStatus::Ok) => HealthStatus::Ok,
        Some(SummaryStatus::Initializing) => HealthStatus::Initializing,
        Some(SummaryStatus::Impaired) => HealthStatus::Impaired,
        Some(SummaryStatus::InsufficientData) => HealthStatus::InsufficientData,
        _ => HealthStatus::NotApplicable,
    }
}

impl InstanceStatusApi for Ec2Client {
    async fn describe_instance_status(
        &self,
        ids: &[String],
        include_all: bool,
    ) -> Result<Vec<Observed<InstanceStatus>>, CloudError> {
        let mut observed = Vec::with_capacity(ids.len());
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_instance_status()
                .set_instance_ids(Some(ids.to_vec()))
                .include_all_instances(include_all)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(cloud_error)?;

            for status in response.instance_statuses() {
                let Some(id) = status.instance_id() else {
                    continue;
                };
                let code = status.instance_state().and_then(|s| s.code());
                let Some(state) = code.and_then(InstanceState::from_code) else {
                    debug!(instance_id = %id, ?code, "Skipping instance with unknown state code");
                    continue;
                };
                let system_status = health_status(status.system_status().and_then(|s| s.status()));
                observed.push(Observed::new(id, InstanceStatus { state, system_status }));
            }

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(observed)
    }
}

impl SpotApi for Ec2Client {
    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequestState>, CloudError> {
        let response = self
            .client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(cloud_error)?;

        Ok(response
            .spot_instance_requests()
            .iter()
            .filter_map(|request| {
                Some(SpotRequestState {
                    id: request.spot_instance_request_id()?.to_string(),
                    instance_id: request.instance_id().map(str::to_string),
                    status_code: request
                        .status()
                        .and_then(|s| s.code())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "Cancelling spot requests");
        self.client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "Terminating instances in batch");
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }
}

impl ResourceApi for Ec2Client {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        match spec.kind {
            ResourceKind::KeyPair => self.create_key_pair(&spec.name).await,
            ResourceKind::SecurityGroup => self.create_security_group(spec).await,
            other => Err(invalid_request(format!("EC2 client cannot create {other}"))),
        }
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, CloudError> {
        match kind {
            ResourceKind::KeyPair => self.key_pair_exists(name).await,
            ResourceKind::SecurityGroup => self.security_group_exists(name).await,
            other => Err(invalid_request(format!("EC2 client cannot look up {other} by name"))),
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        match resource.kind {
            ResourceKind::KeyPair => {
                info!(key_name = %resource.name, "Deleting key pair");
                self.client
                    .delete_key_pair()
                    .key_name(&resource.name)
                    .send()
                    .await
                    .map_err(cloud_error)?;
                Ok(())
            }
            ResourceKind::SecurityGroup => self.delete_security_group(resource).await,
            ResourceKind::Instance => self.terminate_instances(std::slice::from_ref(&resource.id)).await,
            ResourceKind::SpotRequest => self.cancel_spot_requests(std::slice::from_ref(&resource.id)).await,
            other => Err(invalid_request(format!("EC2 client cannot delete {other}"))),
        }
    }
}
