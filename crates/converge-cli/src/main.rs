//! converge: wait-until-true operations on AWS resources from the shell
//!
//! Every subcommand prints a JSON document on stdout; logs go to stderr.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use converge_aws::spot_price::{SpotPriceQuery, find_cheapest_prices};
use converge_aws::{AwsContext, AwsResources, DynamoDbClient, Ec2Client, S3Client, SqsConnector};
use converge_common::ResourceKind;
use converge_core::error::ConvergeError;
use converge_core::Settings;
use converge_core::cloud::{InstanceState, ResourceApi, ResourceRef};
use converge_core::lifecycle::{
    RegionAccessRequest, create_region_access, create_unique, delete_sync, save_key_material,
};
use converge_core::queue::{DurableQueue, SendOptions};
use converge_core::remote::openssh::OpenSshTransport;
use converge_core::remote::{HostPlan, RemoteOrchestrator};
use converge_core::spot::poll_spot_requests;
use converge_core::tracker::{
    default_table_poll, delete_and_wait_until_tables_deleted, instance_state_and_status, poll_instances,
    wait_until_tables_active,
};
use converge_core::transfer::{SyncRequest, sync_to_local};
use converge_core::wait::PollConfig;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(about = "Turn eventually-consistent AWS operations into bounded synchronous ones")]
#[command(version)]
struct Args {
    /// JSON settings file (defaults apply when omitted)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    config: Option<PathBuf>,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// AWS profile to use (overrides AWS_PROFILE env var)
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Running,
    Stopped,
    Terminated,
}

impl From<TargetState> for InstanceState {
    fn from(target: TargetState) -> Self {
        match target {
            TargetState::Running => InstanceState::Running,
            TargetState::Stopped => InstanceState::Stopped,
            TargetState::Terminated => InstanceState::Terminated,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait until every instance reaches the target state
    WaitInstances {
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(long, value_enum)]
        target: TargetState,

        /// Check once instead of waiting
        #[arg(long)]
        check: bool,
    },

    /// Wait until every spot request is fulfilled
    WaitSpot {
        #[arg(required = true)]
        request_ids: Vec<String>,
    },

    /// Wait until every DynamoDB table is active
    WaitTables {
        #[arg(required = true)]
        names: Vec<String>,

        /// Delete the tables and wait until they are gone instead
        #[arg(long)]
        delete: bool,
    },

    /// Create a unique key pair and a security group with SSH open
    CreateRegionAccess {
        /// Create the security group in this VPC
        #[arg(long)]
        vpc_id: Option<String>,

        /// Directory to save the private key in
        #[arg(long)]
        key_dir: Option<PathBuf>,
    },

    /// Create a resource under a unique `prefix + suffix` name
    CreateUnique {
        kind: ResourceKind,
        prefix: String,

        /// Kind-specific parameter, repeatable (e.g. vpc_id=vpc-123)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Return as soon as the create call succeeds
        #[arg(long = "async")]
        no_wait: bool,

        /// Directory to save a new key pair's private key in
        #[arg(long)]
        key_dir: Option<PathBuf>,
    },

    /// Delete a resource and wait until it is gone
    Delete {
        kind: ResourceKind,
        name_or_id: String,

        /// Return as soon as the delete call succeeds
        #[arg(long = "async")]
        no_wait: bool,
    },

    /// Durable queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run a JSON plan of per-host tasks over SSH
    RunRemote {
        /// File holding a JSON array of host plans
        #[arg(long)]
        plan: PathBuf,

        /// Private key used for hosts that do not name one
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Mirror every object under a prefix into a local directory
    SyncS3 {
        bucket: String,
        prefix: String,
        dir: PathBuf,

        /// Remove the directory before downloading
        #[arg(long)]
        clean: bool,
    },

    /// List current spot prices, cheapest first
    SpotPrices {
        instance_type: String,

        /// Comma-separated regions to check (default: all enabled)
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,

        /// Skip zones priced above this
        #[arg(long)]
        max_bid: Option<f64>,

        #[arg(long, default_value = converge_aws::spot_price::DEFAULT_PRODUCT_DESCRIPTION)]
        product_description: String,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Send one message
    Send {
        name: String,
        body: String,

        /// Delivery delay in seconds
        #[arg(long)]
        delay: Option<u32>,

        /// String message attribute, repeatable
        #[arg(long = "attribute", value_name = "KEY=VALUE")]
        attributes: Vec<String>,
    },

    /// Receive up to `max` messages
    Receive {
        name: String,

        #[arg(long, default_value_t = 1)]
        max: u32,

        /// Delete the messages after printing them
        #[arg(long)]
        delete: bool,
    },

    /// Remove every message from the queue
    Purge { name: String },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(exit_code(&e));
    }
}

/// 2 when a wait ran out of time, 1 for any other failure
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<ConvergeError>() {
        Some(err) if err.is_timeout() => 2,
        _ => 1,
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    // Keep SDK internals quiet unless RUST_LOG asks for them
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse repeated `key=value` arguments.
fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("expected KEY=VALUE, got {pair:?}"),
        })
        .collect()
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let settings = Settings::load_or_default(args.config.as_deref())?;
    let ctx = AwsContext::new(&args.region, args.profile.as_deref()).await;
    if let Some(profile) = ctx.profile() {
        info!(profile = %profile, region = %ctx.region(), "Using AWS profile");
    }

    match args.command {
        Command::WaitInstances { ids, target, check } => handle_wait_instances(&ctx, &settings, ids, target, check).await,
        Command::WaitSpot { request_ids } => handle_wait_spot(&ctx, &settings, request_ids).await,
        Command::WaitTables { names, delete } => handle_wait_tables(&ctx, names, delete).await,
        Command::CreateRegionAccess { vpc_id, key_dir } => {
            handle_create_region_access(&ctx, &settings, vpc_id, key_dir).await
        }
        Command::CreateUnique {
            kind,
            prefix,
            params,
            no_wait,
            key_dir,
        } => handle_create_unique(&ctx, &settings, kind, &prefix, &params, no_wait, key_dir).await,
        Command::Delete {
            kind,
            name_or_id,
            no_wait,
        } => handle_delete(&ctx, &settings, kind, name_or_id, no_wait).await,
        Command::Queue { action } => handle_queue(&ctx, &settings, action).await,
        Command::RunRemote { plan, key_file } => handle_run_remote(&settings, &plan, key_file).await,
        Command::SyncS3 {
            bucket,
            prefix,
            dir,
            clean,
        } => handle_sync_s3(&ctx, &settings, bucket, prefix, dir, clean).await,
        Command::SpotPrices {
            instance_type,
            regions,
            max_bid,
            product_description,
        } => {
            let query = SpotPriceQuery {
                instance_type,
                product_description,
                regions: (!regions.is_empty()).then_some(regions),
                max_bid,
            };
            let quotes = find_cheapest_prices(&ctx, &query).await?;
            print_json(&serde_json::to_value(quotes)?)
        }
    }
}

async fn handle_wait_instances(
    ctx: &AwsContext,
    settings: &Settings,
    ids: Vec<String>,
    target: TargetState,
    check: bool,
) -> Result<()> {
    let ec2 = Ec2Client::from_context(ctx);
    let config = if check {
        PollConfig::immediate()
    } else {
        settings.poll_config()
    };

    let converged = poll_instances(&ec2, &ids, target.into(), &config).await?;

    let mut instances = Vec::with_capacity(ids.len());
    for id in &ids {
        let (state, status) = instance_state_and_status(&ec2, id).await?;
        instances.push(json!({ "id": id, "state": state, "system_status": status }));
    }

    print_json(&json!({
        "target": InstanceState::from(target).as_str(),
        "converged": converged,
        "instances": instances,
    }))
}

async fn handle_wait_spot(ctx: &AwsContext, settings: &Settings, request_ids: Vec<String>) -> Result<()> {
    let ec2 = Ec2Client::from_context(ctx);
    let instance_ids = poll_spot_requests(&ec2, &request_ids, &settings.spot_config()).await?;
    print_json(&json!({ "request_ids": request_ids, "instance_ids": instance_ids }))
}

async fn handle_wait_tables(ctx: &AwsContext, names: Vec<String>, delete: bool) -> Result<()> {
    let dynamodb = DynamoDbClient::from_context(ctx);
    let config = default_table_poll();

    let converged = if delete {
        delete_and_wait_until_tables_deleted(&dynamodb, &names, &config).await?
    } else {
        wait_until_tables_active(&dynamodb, &names, &config).await?
    };

    print_json(&json!({
        "tables": names,
        "target": if delete { "deleted" } else { "active" },
        "converged": converged,
    }))
}

async fn handle_create_region_access(
    ctx: &AwsContext,
    settings: &Settings,
    vpc_id: Option<String>,
    key_dir: Option<PathBuf>,
) -> Result<()> {
    let api = AwsResources::from_context(ctx);
    let request = RegionAccessRequest {
        vpc_id,
        key_dir,
        ..Default::default()
    };

    let access = create_region_access(&api, &request, &settings.allocate_options()).await?;

    print_json(&json!({
        "region": ctx.region(),
        "key_pair": access.key_pair.name,
        "security_group": access.security_group.name,
        "security_group_id": access.security_group.handle.id,
        "key_file": access.key_path,
    }))
}

async fn handle_create_unique(
    ctx: &AwsContext,
    settings: &Settings,
    kind: ResourceKind,
    prefix: &str,
    params: &[String],
    no_wait: bool,
    key_dir: Option<PathBuf>,
) -> Result<()> {
    let api = AwsResources::from_context(ctx);
    let params = parse_pairs(params)?;
    let mut options = settings.allocate_options();
    if no_wait {
        options.sync = None;
    }

    let allocated = create_unique(&api, kind, prefix, &params, &options).await?;

    let key_file = match (&key_dir, &allocated.handle.material) {
        (Some(dir), Some(_)) => Some(save_key_material(dir, &allocated.handle).await?),
        _ => None,
    };

    print_json(&json!({
        "kind": kind.as_str(),
        "name": allocated.name,
        "id": allocated.handle.id,
        "attempts": allocated.attempts,
        "key_file": key_file,
    }))
}

async fn handle_delete(
    ctx: &AwsContext,
    settings: &Settings,
    kind: ResourceKind,
    name_or_id: String,
    no_wait: bool,
) -> Result<()> {
    let api = AwsResources::from_context(ctx);
    let resource = ResourceRef::named(kind, name_or_id);

    // Instances and spot requests have no existence check to wait on
    if no_wait || !kind.capabilities().exists_check {
        api.delete(&resource)
            .await
            .with_context(|| format!("Failed to delete {kind} {}", resource.name))?;
    } else {
        delete_sync(&api, &resource, &settings.poll_config()).await?;
    }

    print_json(&json!({ "kind": kind.as_str(), "deleted": resource.name }))
}

async fn handle_queue(ctx: &AwsContext, settings: &Settings, action: QueueAction) -> Result<()> {
    let name = match &action {
        QueueAction::Send { name, .. } | QueueAction::Receive { name, .. } | QueueAction::Purge { name } => name.clone(),
    };
    let mut queue = DurableQueue::connect(SqsConnector::new(ctx.clone()), name, settings.queue_config()).await?;

    match action {
        QueueAction::Send {
            body,
            delay,
            attributes,
            ..
        } => {
            let options = SendOptions {
                delay_seconds: delay,
                attributes: parse_pairs(&attributes)?,
            };
            let message_id = queue.send_message(&body, &options).await?;
            print_json(&json!({ "message_id": message_id }))
        }
        QueueAction::Receive { max, delete, .. } => {
            let mut batch = queue.receive_messages(max, &[]).await?;
            let printed = serde_json::to_value(&batch)?;
            if delete {
                queue.delete_messages(&mut batch.messages).await?;
                for bad in &batch.undecodable {
                    queue.discard(bad).await?;
                }
            }
            print_json(&json!({
                "messages": printed["messages"],
                "undecodable": printed["undecodable"],
                "deleted": delete,
            }))
        }
        QueueAction::Purge { .. } => {
            queue.purge().await?;
            print_json(&json!({ "purged": queue.queue_name() }))
        }
    }
}

async fn handle_run_remote(settings: &Settings, plan: &std::path::Path, key_file: Option<PathBuf>) -> Result<()> {
    let content = std::fs::read_to_string(plan).with_context(|| format!("Failed to read plan: {}", plan.display()))?;
    let mut plans: Vec<HostPlan> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse plan: {}", plan.display()))?;

    for plan in &mut plans {
        if plan.host.username.is_empty() {
            plan.host.username = settings.remote.username.clone();
        }
        if plan.host.key_file.is_none() {
            plan.host.key_file = key_file.clone();
        }
    }

    let orchestrator = RemoteOrchestrator::new(Arc::new(OpenSshTransport::default()))
        .with_connect_timeout(settings.connect_timeout())
        .with_max_concurrent_hosts(settings.remote.max_concurrent_hosts);
    let report = orchestrator.run(plans).await?;

    let hosts: Vec<_> = report
        .hosts
        .iter()
        .map(|host| {
            json!({
                "address": host.address,
                "succeeded": host.succeeded(),
                "max_return_code_exceeded": host.max_return_code_exceeded,
                "error": host.error.as_ref().map(ToString::to_string),
                "results": host.results,
            })
        })
        .collect();
    print_json(&json!({ "hosts": hosts }))?;

    if !report.all_succeeded() {
        bail!("remote run failed on: {}", report.failed_hosts().join(", "));
    }
    Ok(())
}

async fn handle_sync_s3(
    ctx: &AwsContext,
    settings: &Settings,
    bucket: String,
    prefix: String,
    dir: PathBuf,
    clean: bool,
) -> Result<()> {
    let source = S3Client::from_context(ctx);
    let request = SyncRequest {
        bucket,
        prefix,
        local_path: dir,
        clean_first: clean,
    };

    let report = sync_to_local(&source, &request, settings.transfer.max_concurrency).await?;
    print_json(&json!({
        "files": report.files,
        "skipped": report.skipped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_wait_instances() {
        let args = Args::try_parse_from([
            "converge",
            "wait-instances",
            "i-1",
            "i-2",
            "--target",
            "stopped",
            "--check",
        ])
        .unwrap();
        match args.command {
            Command::WaitInstances { ids, target, check } => {
                assert_eq!(ids, vec!["i-1", "i-2"]);
                assert_eq!(target, TargetState::Stopped);
                assert!(check);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_create_unique_kind() {
        let args = Args::try_parse_from([
            "converge",
            "--region",
            "eu-west-1",
            "create-unique",
            "security-group",
            "sg_",
            "--param",
            "vpc_id=vpc-1",
            "--async",
        ])
        .unwrap();
        assert_eq!(args.region, "eu-west-1");
        match args.command {
            Command::CreateUnique {
                kind,
                prefix,
                params,
                no_wait,
                ..
            } => {
                assert_eq!(kind, ResourceKind::SecurityGroup);
                assert_eq!(prefix, "sg_");
                assert_eq!(params, vec!["vpc_id=vpc-1"]);
                assert!(no_wait);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_wait_tables_delete() {
        let args = Args::try_parse_from(["converge", "wait-tables", "runs", "results", "--delete"]).unwrap();
        match args.command {
            Command::WaitTables { names, delete } => {
                assert_eq!(names, vec!["runs", "results"]);
                assert!(delete);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_timeouts_exit_with_2() {
        let timeout = ConvergeError::Timeout {
            what: "instances".to_string(),
            target: "running".to_string(),
            pending: vec!["i-1".to_string()],
            waited: std::time::Duration::from_secs(60),
        };
        assert_eq!(exit_code(&anyhow::Error::new(timeout).context("Failed to wait")), 2);

        let invalid = ConvergeError::Validation("bad".to_string());
        assert_eq!(exit_code(&anyhow::Error::new(invalid)), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(Args::try_parse_from(["converge", "delete", "bucket", "b"]).is_err());
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(pairs.get("a").map(String::as_str), Some("1"));
        assert_eq!(pairs.get("b").map(String::as_str), Some("x=y"));
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=v".to_string()]).is_err());
    }
}
