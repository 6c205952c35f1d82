//! Canopy - multi-tenant RoleRequest controller

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use canopy::config::ControllerArgs;
use canopy::controller::{Context, RoleRequestController};
use canopy::credentials::{CredentialIssuer, PkiCredentialIssuer, UnconfiguredCredentialIssuer};
use canopy::crd::all_crds;
use canopy::events::KubeEventPublisher;
use canopy::pki::CertificateAuthority;
use canopy::store::KubeObjectStore;
use canopy::telemetry::init_logging;
use canopy::FIELD_MANAGER;

/// Canopy - grants namespaced roles through approved RoleRequests
#[derive(Parser, Debug)]
#[command(name = "canopy", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the RoleRequest controller
    ///
    /// Watches RoleRequests cluster-wide, walks each one through policy
    /// consent and approval, binds approved roles and deletes requests once
    /// they expire.
    Controller(ControllerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let manifests = all_crds()
            .iter()
            .map(serde_yaml::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRDs: {}", e))?;
        println!("{}", manifests.join("---\n"));
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        // flags fall back to their environment variables
        None => run_controller(DefaultArgs::parse_from(["canopy"]).args).await,
    }
}

/// Controller arguments when no subcommand is given
#[derive(Parser, Debug)]
struct DefaultArgs {
    #[command(flatten)]
    args: ControllerArgs,
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_logging(args.log_format)?;
    let config = args.controller_config()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let credentials = credential_issuer(&args).await?;
    let store = Arc::new(KubeObjectStore::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client, "canopy-controller"));

    let ctx = Context::builder(store)
        .events(events)
        .credentials(credentials)
        .config(config.clone())
        .build()?;
    let controller = RoleRequestController::new(Arc::new(ctx));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    tracing::info!(workers = config.workers, "Starting RoleRequest controller");
    controller.run(config.workers, cancel).await?;
    Ok(())
}

/// Client certificate issuer backed by the configured CA, if any
async fn credential_issuer(args: &ControllerArgs) -> anyhow::Result<Arc<dyn CredentialIssuer>> {
    let (Some(cert_path), Some(key_path)) = (&args.ca_cert, &args.ca_key) else {
        tracing::warn!("No CA configured, client-certificate requests will not be provisioned");
        return Ok(Arc::new(UnconfiguredCredentialIssuer));
    };

    let cert_pem = tokio::fs::read_to_string(cert_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read CA certificate {:?}: {}", cert_path, e))?;
    let key_pem = tokio::fs::read_to_string(key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read CA key {:?}: {}", key_path, e))?;
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem)
        .map_err(|e| anyhow::anyhow!("Failed to load CA: {}", e))?;

    Ok(Arc::new(PkiCredentialIssuer::new(
        Arc::new(ca),
        args.cluster_name.clone(),
        args.api_server.clone(),
        args.kubeconfig_dir.clone(),
    )))
}

/// Ensure all Canopy CRDs are installed
///
/// Server-side apply keeps the installed CRDs in step with the binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Canopy CRDs installed/updated");
    Ok(())
}
