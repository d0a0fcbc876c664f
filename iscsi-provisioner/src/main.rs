//! iscsi-provisioner: Kubernetes dynamic provisioner for iSCSI volumes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iscsi_provisioner::provisioner::{DEFAULT_FS_TYPE, PROVISIONER_NAME};
use iscsi_provisioner::types::parse_duration;
use iscsi_provisioner::{
    ChapCredentials, Config, ControllerConfig, IscsiProvisioner, ProvisionController,
};
use target_api::{HttpClient, ServerCfg};

#[derive(Parser, Debug)]
#[command(name = "iscsi-provisioner")]
#[command(about = "Dynamic provisioner for iSCSI volumes backed by iscsi-target-api")]
struct Args {
    /// Name this provisioner answers to in StorageClass `provisioner`.
    #[arg(long, env = "PROVISIONER_NAME", default_value = PROVISIONER_NAME)]
    provisioner_name: String,

    /// iscsi-target-api host.
    #[arg(long, env = "TARGET_API_ADDRESS", default_value = "localhost")]
    target_api_address: String,

    #[arg(long, env = "TARGET_API_PORT", default_value_t = 8811)]
    target_api_port: u16,

    #[arg(long, env = "API_USERNAME", default_value = "admin")]
    api_username: String,

    #[arg(long, env = "API_PASSWORD", default_value = "", hide_env_values = true)]
    api_password: String,

    /// Timeout for a single iscsi-target-api request.
    #[arg(long, env = "TARGET_API_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    target_api_timeout: Duration,

    /// Filesystem for volumes whose StorageClass has no fsType.
    #[arg(long, env = "DEFAULT_FS", default_value = DEFAULT_FS_TYPE)]
    default_fs: String,

    /// TOML file with session CHAP credentials for initiators.
    #[arg(long, env = "SESSION_CHAP_CREDENTIAL_FILE")]
    session_chap_credential_file: Option<PathBuf>,

    /// Requeue interval for objects that reconciled successfully.
    #[arg(long, env = "RESYNC_PERIOD", default_value = "15m", value_parser = parse_duration)]
    resync_period: Duration,

    #[arg(
        long,
        env = "EXPONENTIAL_BACKOFF_ON_ERROR",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    exponential_backoff_on_error: bool,

    /// Consecutive failures before an object is left alone until it changes (0: no limit).
    #[arg(long, env = "FAIL_RETRY_THRESHOLD", default_value_t = 10)]
    fail_retry_threshold: u32,

    #[arg(long, env = "LEASE_PERIOD", default_value = "15s", value_parser = parse_duration)]
    lease_period: Duration,

    #[arg(long, env = "RENEW_DEADLINE", default_value = "10s", value_parser = parse_duration)]
    renew_deadline: Duration,

    #[arg(long, env = "RETRY_PERIOD", default_value = "2s", value_parser = parse_duration)]
    retry_period: Duration,

    /// Kubernetes API server URL. Overrides the kubeconfig server.
    #[arg(long, env = "MASTER")]
    master: Option<String>,

    /// Path to a kubeconfig. In-cluster configuration is used when unset.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

async fn kube_config(args: &Args) -> anyhow::Result<kube::Config> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        // Server URL is filled in from --master below.
        None if args.master.is_some() => kube::Config::new(Default::default()),
        None => kube::Config::incluster().context("failed to load in-cluster config")?,
    };

    if let Some(master) = &args.master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("invalid --master {master:?}"))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Only our crates get detailed logging; kube, hyper and friends stay at warn.
    let filter = match args.v {
        0 => "warn".to_string(),
        1 => "iscsi_provisioner=info,target_api=info,warn".to_string(),
        2 => "iscsi_provisioner=debug,target_api=debug,warn".to_string(),
        3 => "iscsi_provisioner=trace,target_api=trace,warn".to_string(),
        _ => "iscsi_provisioner=trace,target_api=trace,info".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let controller_config = ControllerConfig {
        provisioner_name: args.provisioner_name.clone(),
        resync_period: args.resync_period,
        exponential_backoff: args.exponential_backoff_on_error,
        fail_retry_threshold: args.fail_retry_threshold,
        lease_period: args.lease_period,
        renew_deadline: args.renew_deadline,
        retry_period: args.retry_period,
    };
    controller_config.validate()?;

    let chap_credentials = args
        .session_chap_credential_file
        .as_deref()
        .map(ChapCredentials::load)
        .transpose()?;

    let client = Client::try_from(kube_config(&args).await?)
        .context("failed to create kubernetes client")?;
    let server_version = client
        .apiserver_version()
        .await
        .context("failed to get kubernetes server version")?;

    let target_api = HttpClient::new(ServerCfg {
        address: args.target_api_address,
        port: args.target_api_port,
        username: args.api_username,
        password: args.api_password,
        timeout: args.target_api_timeout,
    })?;

    info!(
        provisioner = %args.provisioner_name,
        target_api = %target_api.base_url(),
        kubernetes = %server_version.git_version,
        session_chap = chap_credentials.is_some(),
        "starting iscsi provisioner"
    );

    let provisioner = IscsiProvisioner::new(
        Config {
            provisioner_name: args.provisioner_name,
            default_fs: args.default_fs,
            chap_credentials,
        },
        Arc::new(target_api),
    );

    ProvisionController::new(client, Arc::new(provisioner), controller_config)?
        .run()
        .await;

    Ok(())
}
