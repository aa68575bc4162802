//! Synchronous lifecycle facades for named resources.
//!
//! Each facade checks the precondition, issues the mutating call through
//! [`ResourceApi`], then polls existence until the change is observable.

use crate::allocator::{AllocateOptions, Allocated, allocate_unique};
use crate::cloud::{ResourceApi, ResourceRef, ResourceSpec};
use crate::error::{CloudError, ConvergeError, Result};
use crate::wait::{PollConfig, poll};
use converge_common::ResourceKind;
use converge_common::defaults::{DEFAULT_SPOT_KEY_PAIR_PREFIX, DEFAULT_SPOT_SECURITY_GROUP_PREFIX};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Port opened by [`create_region_access`]
const SSH_PORT: &str = "22";

/// Fail with `Validation` unless `kind` supports generic create/exists.
pub fn ensure_capability(kind: ResourceKind) -> Result<()> {
    let caps = kind.capabilities();
    if !caps.create || !caps.exists_check {
        return Err(ConvergeError::Validation(format!(
            "{kind} does not support named create/exists operations"
        )));
    }
    Ok(())
}

fn ensure_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConvergeError::Validation("resource name is required".to_string()));
    }
    Ok(())
}

/// Poll until `name` exists (`target = true`) or is gone (`target = false`).
pub async fn wait_exists<A>(
    api: &A,
    kind: ResourceKind,
    name: &str,
    target: bool,
    config: &PollConfig,
) -> Result<bool>
where
    A: ResourceApi + ?Sized,
{
    let what = format!("{kind} {name}");
    poll(config, &what, &target, || async move {
        api.exists(kind, name)
            .await
            .map_err(|e| ConvergeError::from_cloud("Exists", e))
    })
    .await
}

/// Create a named resource and wait until it is visible.
///
/// # Errors
/// * `AlreadyExists` - the name is already visible before creation
pub async fn create_sync<A>(api: &A, spec: &ResourceSpec, config: &PollConfig) -> Result<ResourceRef>
where
    A: ResourceApi + ?Sized,
{
    ensure_capability(spec.kind)?;
    ensure_name(&spec.name)?;

    let exists = api
        .exists(spec.kind, &spec.name)
        .await
        .map_err(|e| ConvergeError::from_cloud("Exists", e))?;
    if exists {
        return Err(ConvergeError::AlreadyExists {
            kind: spec.kind,
            name: spec.name.clone(),
        });
    }

    let created = api.create(spec).await.map_err(|e| {
        if e.is_conflict_for(spec.kind) {
            ConvergeError::AlreadyExists {
                kind: spec.kind,
                name: spec.name.clone(),
            }
        } else {
            ConvergeError::from_cloud("Create", e)
        }
    })?;

    wait_exists(api, spec.kind, &spec.name, true, config).await?;
    info!(kind = %spec.kind, name = %spec.name, "Resource created");
    Ok(created)
}

/// Delete a named resource and wait until it is gone.
///
/// # Errors
/// * `DoesNotExist` - the resource is not visible before deletion
pub async fn delete_sync<A>(api: &A, resource: &ResourceRef, config: &PollConfig) -> Result<()>
where
    A: ResourceApi + ?Sized,
{
    ensure_capability(resource.kind)?;
    ensure_name(&resource.name)?;

    let not_found = || ConvergeError::DoesNotExist {
        kind: resource.kind,
        name: resource.name.clone(),
    };

    let exists = api
        .exists(resource.kind, &resource.name)
        .await
        .map_err(|e| ConvergeError::from_cloud("Exists", e))?;
    if !exists {
        return Err(not_found());
    }

    api.delete(resource).await.map_err(|e| {
        if e.is_not_found_for(resource.kind) {
            not_found()
        } else {
            ConvergeError::from_cloud("Delete", e)
        }
    })?;

    wait_exists(api, resource.kind, &resource.name, false, config).await?;
    info!(kind = %resource.kind, name = %resource.name, "Resource deleted");
    Ok(())
}

/// Conflict error for a name found taken before create was called.
fn name_taken(kind: ResourceKind, name: &str) -> CloudError {
    let code = kind.conflict_codes().first().copied().unwrap_or("AlreadyExists");
    CloudError::new(code, format!("{kind} {name} already exists"))
}

/// Create a resource under a unique `prefix + suffix` name.
///
/// `params` are passed through to every create attempt. For kinds whose
/// create is idempotent each candidate is checked for existence first, since
/// the provider would otherwise hand back the existing resource. In sync mode
/// the call also waits for the chosen name to become visible.
pub async fn create_unique<A>(
    api: &A,
    kind: ResourceKind,
    prefix: &str,
    params: &BTreeMap<String, String>,
    options: &AllocateOptions,
) -> Result<Allocated<ResourceRef>>
where
    A: ResourceApi + ?Sized,
{
    ensure_capability(kind)?;
    let precheck = kind.capabilities().idempotent_create;

    let allocated = allocate_unique(kind, prefix, options.seed(), options.max_attempts, |name| {
        let spec = ResourceSpec {
            kind,
            name,
            params: params.clone(),
        };
        async move {
            if precheck && api.exists(kind, &spec.name).await? {
                return Err(name_taken(kind, &spec.name));
            }
            api.create(&spec).await
        }
    })
    .await?;

    if let Some(config) = &options.sync {
        wait_exists(api, kind, &allocated.name, true, config).await?;
    }
    Ok(allocated)
}

/// Names and options for [`create_region_access`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionAccessRequest {
    pub key_pair_prefix: String,
    pub security_group_prefix: String,
    /// Create the security group in this VPC instead of the default one
    pub vpc_id: Option<String>,
    /// Save the new private key here, as `<name>.pem`
    pub key_dir: Option<PathBuf>,
}

impl Default for RegionAccessRequest {
    fn default() -> Self {
        Self {
            key_pair_prefix: DEFAULT_SPOT_KEY_PAIR_PREFIX.to_string(),
            security_group_prefix: DEFAULT_SPOT_SECURITY_GROUP_PREFIX.to_string(),
            vpc_id: None,
            key_dir: None,
        }
    }
}

/// A key pair and an SSH security group, ready for launching instances.
#[derive(Debug, Clone)]
pub struct RegionAccess {
    pub key_pair: Allocated<ResourceRef>,
    pub security_group: Allocated<ResourceRef>,
    pub key_path: Option<PathBuf>,
}

/// Create a unique key pair and a unique security group with SSH open
/// inbound, for the region `api` talks to.
///
/// If the security group cannot be created the key pair is deleted again,
/// along with its saved private key.
pub async fn create_region_access<A>(
    api: &A,
    request: &RegionAccessRequest,
    options: &AllocateOptions,
) -> Result<RegionAccess>
where
    A: ResourceApi + ?Sized,
{
    let key_pair = create_unique(
        api,
        ResourceKind::KeyPair,
        &request.key_pair_prefix,
        &BTreeMap::new(),
        options,
    )
    .await?;

    let key_path = match &request.key_dir {
        Some(dir) => Some(save_key_material(dir, &key_pair.handle).await?),
        None => None,
    };

    let mut params = BTreeMap::from([("ingress_ports".to_string(), SSH_PORT.to_string())]);
    if let Some(vpc_id) = &request.vpc_id {
        params.insert("vpc_id".to_string(), vpc_id.clone());
    }

    let security_group = match create_unique(
        api,
        ResourceKind::SecurityGroup,
        &request.security_group_prefix,
        &params,
        options,
    )
    .await
    {
        Ok(group) => group,
        Err(e) => {
            warn!(key_name = %key_pair.name, error = %e, "Security group creation failed, removing key pair");
            if let Err(cleanup) = api.delete(&key_pair.handle).await {
                warn!(key_name = %key_pair.name, error = %cleanup, "Failed to delete key pair");
            }
            if let Some(dir) = &request.key_dir {
                remove_key_material(dir, &key_pair.name).await?;
            }
            return Err(e);
        }
    };

    info!(
        key_name = %key_pair.name,
        group_name = %security_group.name,
        "Region access ready"
    );
    Ok(RegionAccess {
        key_pair,
        security_group,
        key_path,
    })
}

/// Path a key pair's private key is saved under.
pub fn key_material_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pem"))
}

/// Write a freshly created key pair's private key to `<dir>/<name>.pem`.
///
/// The directory is created if missing and the file is readable by the
/// owner only.
pub async fn save_key_material(dir: &Path, resource: &ResourceRef) -> Result<PathBuf> {
    let material = resource.material.as_deref().ok_or_else(|| {
        ConvergeError::Validation(format!("{} has no key material to save", resource.name))
    })?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ConvergeError::io(dir, e))?;

    let path = key_material_path(dir, &resource.name);
    tokio::fs::write(&path, material)
        .await
        .map_err(|e| ConvergeError::io(&path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| ConvergeError::io(&path, e))?;
    }

    debug!(path = %path.display(), "Saved key material");
    Ok(path)
}

/// Remove a saved private key; a missing file is not an error.
pub async fn remove_key_material(dir: &Path, name: &str) -> Result<()> {
    let path = key_material_path(dir, name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConvergeError::io(&path, e)),
    }
}
