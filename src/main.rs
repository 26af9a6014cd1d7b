//! sa-certgen - cluster-signed certificates for Kubernetes service accounts

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sa_certgen::client::{IdentityApi, KubeClusterClient, SecretApi};
use sa_certgen::config::IssuerConfig;
use sa_certgen::controller::{IssuanceOrchestrator, INTERMEDIARY_NAMESPACE};
use sa_certgen::export::{export_secret, DEFAULT_EXPORT_NAMESPACE, DEFAULT_EXPORT_SECRET};
use sa_certgen::feeder::IdentityFeeder;
use sa_certgen::retry::{retry_with_backoff, RetryConfig};
use sa_certgen::{DEFAULT_CHAIN_PREFIX, DEFAULT_SIGNER_NAME, DEFAULT_TRUST_DOMAIN};

/// sa-certgen - issue cluster-signed X.509 certificates for service accounts
#[derive(Parser, Debug)]
#[command(name = "sa-certgen", version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue certificates for service accounts
    ///
    /// Lists every service account once and issues for each, or with --watch
    /// keeps issuing as service accounts are created or updated.
    Issue(IssueArgs),

    /// Issue the intermediary CA certificate into istio-system/intermediary2
    Intermediary(IntermediaryArgs),

    /// Write the entries of a key-and-cert secret to local files
    Export(ExportArgs),
}

/// Settings shared by every issuing command
#[derive(Args, Debug)]
struct IssuerArgs {
    /// Trust domain used for SPIFFE ids
    #[arg(long, env = "TRUST_DOMAIN", default_value = DEFAULT_TRUST_DOMAIN)]
    trust_domain: String,

    /// Prefix of the certificate chain entry (`<prefix>cert-chain.pem`)
    #[arg(long, env = "CHAIN_PREFIX", default_value = DEFAULT_CHAIN_PREFIX)]
    chain_prefix: String,

    /// Only issue for these namespaces (repeatable; empty means all)
    #[arg(long = "namespace", env = "NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// signerName requested on every signing request
    #[arg(long, env = "SIGNER_NAME", default_value = DEFAULT_SIGNER_NAME)]
    signer_name: String,

    /// Seconds to wait for the signer
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Milliseconds between signing request status reads
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Attempts per issuance (1 = no retry)
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,

    /// Name signing requests `<service>.<namespace>` without a random suffix
    #[arg(long)]
    fixed_request_names: bool,

    /// Add the SPIFFE id as a URI SAN (some signers drop it)
    #[arg(long)]
    spiffe_san: bool,
}

impl IssuerArgs {
    fn into_config(self, max_concurrent_issuances: usize) -> anyhow::Result<IssuerConfig> {
        let config = IssuerConfig {
            trust_domain: self.trust_domain,
            chain_prefix: self.chain_prefix,
            signer_name: self.signer_name,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            signing_timeout: Duration::from_secs(self.timeout_secs),
            unique_request_names: !self.fixed_request_names,
            include_spiffe_san: self.spiffe_san,
            retry: RetryConfig::with_max_attempts(self.max_attempts.max(1)),
            max_concurrent_issuances,
            ..Default::default()
        }
        .with_namespaces(self.namespaces);
        config.validate()?;
        Ok(config)
    }
}

/// Issue mode arguments
#[derive(Args, Debug)]
struct IssueArgs {
    #[command(flatten)]
    issuer: IssuerArgs,

    /// Keep watching service accounts instead of issuing once
    #[arg(long, env = "WATCH")]
    watch: bool,

    /// In batch mode, continue past failed identities
    #[arg(long)]
    keep_going: bool,

    /// Issuances to run at once across distinct service accounts (watch mode)
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

/// Intermediary mode arguments
#[derive(Args, Debug)]
struct IntermediaryArgs {
    #[command(flatten)]
    issuer: IssuerArgs,

    /// Also write the issued key and certificate into this directory
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

/// Export mode arguments
#[derive(Args, Debug)]
struct ExportArgs {
    /// Namespace of the secret
    #[arg(long, default_value = DEFAULT_EXPORT_NAMESPACE)]
    namespace: String,

    /// Name of the secret
    #[arg(long, default_value = DEFAULT_EXPORT_SECRET)]
    name: String,

    /// Directory to write the files into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls client needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Issue(args) => run_issue(args).await,
        Commands::Intermediary(args) => run_intermediary(args).await,
        Commands::Export(args) => run_export(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

async fn cluster_client() -> anyhow::Result<Arc<KubeClusterClient>> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    Ok(Arc::new(KubeClusterClient::new(client)))
}

/// Issue for every service account, once or continuously
async fn run_issue(args: IssueArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.issuer.into_config(args.concurrency)?);
    let cluster = cluster_client().await?;
    let orchestrator = Arc::new(IssuanceOrchestrator::new(
        config.clone(),
        cluster.clone(),
        cluster.clone(),
    ));
    let feeder = IdentityFeeder::new(orchestrator);

    info!(
        trust_domain = %config.trust_domain,
        signer = %config.signer_name,
        namespaces = ?config.namespaces,
        watch = args.watch,
        "starting issuance"
    );

    if args.watch {
        tokio::select! {
            summary = feeder.run_watch(cluster.watch_identities()) => {
                warn!(issued = summary.issued, failed = summary.failed, "service account watch ended");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch");
            }
        }
        return Ok(());
    }

    let identities = retry_with_backoff(&config.retry, "list service accounts", || {
        cluster.list_identities()
    })
    .await?;
    info!(count = identities.len(), "listed service accounts");
    let summary = feeder.run_batch(identities, args.keep_going).await?;
    if summary.failed > 0 {
        anyhow::bail!("{} issuance(s) failed", summary.failed);
    }
    Ok(())
}

/// Issue the intermediary CA and optionally export it
async fn run_intermediary(args: IntermediaryArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.issuer.into_config(1)?);
    let cluster = cluster_client().await?;
    let orchestrator = IssuanceOrchestrator::new(config, cluster.clone(), cluster.clone());

    let report = orchestrator.issue_intermediary().await?;
    info!(
        secret = %report.secret_name,
        request = %report.request_name,
        elapsed_ms = report.timings.total().as_millis() as u64,
        "intermediary issued"
    );

    if let Some(dir) = args.out_dir {
        let record = cluster
            .get(INTERMEDIARY_NAMESPACE, &report.secret_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("intermediary secret vanished after issuance"))?;
        export_secret(&record, &dir)?;
    }
    Ok(())
}

/// Write a secret's entries to files
async fn run_export(args: ExportArgs) -> anyhow::Result<()> {
    let cluster = cluster_client().await?;
    let record = cluster
        .get(&args.namespace, &args.name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("secret {}/{} not found", args.namespace, args.name))?;

    for path in export_secret(&record, &args.out_dir)? {
        println!("{}", path.display());
    }
    Ok(())
}
