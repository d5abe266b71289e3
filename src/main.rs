//! flotta-sim - edge device fleet simulator for load testing Flotta

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use flotta_sim::config::{
    ControlPlaneEndpoint, LifecycleTimings, ManagementEndpoint, RetryLimits, SimConfig,
};
use flotta_sim::control::HttpControlPlaneClient;
use flotta_sim::driver::{DriverConfig, FleetDriver};
use flotta_sim::identity::{
    load_ca, write_bootstrap_bundle, BootstrapIdentity, CertsDir, IdentityProvider,
    InProcessProvider, OpensslProvider,
};
use flotta_sim::lifecycle::Backends;
use flotta_sim::management::HttpManagementClient;
use flotta_sim::pki::CertificateAuthority;
use flotta_sim::telemetry::{init_tracing, LogFormat};
use flotta_sim::{
    DEFAULT_CLUSTER_API_PORT, DEFAULT_LABEL_KEY, DEFAULT_MANAGEMENT_PORT,
    DEFAULT_MAX_REGISTER_ATTEMPTS,
};

/// flotta-sim - simulate a fleet of edge devices against a Flotta control plane
#[derive(Parser, Debug)]
#[command(name = "flotta-sim", version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FLOTTA_SIM_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated fleet
    ///
    /// Every device enrols, waits for approval, registers, gets labeled and
    /// assigned workloads, then polls for updates and sends heartbeats for
    /// the configured number of iterations.
    Run(RunArgs),

    /// Write a self-signed bootstrap bundle for local setups
    ///
    /// Produces default_ca.pem, default_cert.pem and default_key.pem in the
    /// certificate folder, plus default_ca_key.pem holding the signing CA key.
    BootstrapCerts(BootstrapArgs),
}

/// Fleet run arguments
#[derive(Args, Debug)]
struct RunArgs {
    /// Folder holding the bootstrap bundle; device keys are written here
    #[arg(long, env = "CERTS_FOLDER")]
    certs_folder: PathBuf,

    /// Flotta management server host
    #[arg(long, env = "HTTPS_SERVER")]
    https_server: String,

    /// Flotta management server port
    #[arg(long, env = "HTTPS_SERVER_PORT", default_value_t = DEFAULT_MANAGEMENT_PORT)]
    https_server_port: u16,

    /// Cluster API server host
    #[arg(long, env = "OCP_API_SERVER")]
    ocp_api_server: String,

    /// Cluster API server port
    #[arg(long, env = "OCP_API_PORT", default_value_t = DEFAULT_CLUSTER_API_PORT)]
    ocp_api_port: u16,

    /// Bearer token for the cluster API
    #[arg(long, env = "K8S_BEARER_TOKEN", hide_env_values = true)]
    k8s_bearer_token: String,

    /// Namespace of the edge device resources
    #[arg(long, env = "TARGET_NAMESPACE", default_value = "default")]
    target_namespace: String,

    /// Workloads created per device
    #[arg(long, env = "EDGE_DEPLOYMENTS_PER_DEVICE", default_value_t = 1)]
    deployment_per_device: u32,

    /// Steady-state iterations per device
    #[arg(long, env = "TEST_ITERATIONS", default_value_t = 1)]
    test_iterations: u32,

    /// Devices to simulate
    #[arg(long, env = "FLOTTA_SIM_DEVICES", default_value_t = 1)]
    devices: usize,

    /// Devices started per second (all at once if unset)
    #[arg(long, env = "FLOTTA_SIM_SPAWN_RATE")]
    spawn_rate: Option<f64>,

    /// Maximum devices running at the same time
    #[arg(long, env = "FLOTTA_SIM_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Stop the run after this many seconds
    #[arg(long, env = "FLOTTA_SIM_RUN_TIME")]
    run_time_secs: Option<u64>,

    /// Give up approval after this many attempts (retries forever if unset)
    #[arg(long)]
    approve_max_attempts: Option<u32>,

    /// Registration attempts before a device fails
    #[arg(long, default_value_t = DEFAULT_MAX_REGISTER_ATTEMPTS)]
    max_register_attempts: u32,

    /// Label key binding workloads to their device
    #[arg(long, default_value = DEFAULT_LABEL_KEY)]
    label_key: String,

    /// Generate device keys in-process instead of running openssl
    #[arg(long)]
    in_process_keys: bool,
}

impl RunArgs {
    fn sim_config(&self) -> SimConfig {
        SimConfig {
            certs_dir: self.certs_folder.clone(),
            management: ManagementEndpoint {
                host: self.https_server.clone(),
                port: self.https_server_port,
            },
            control_plane: ControlPlaneEndpoint {
                host: self.ocp_api_server.clone(),
                port: self.ocp_api_port,
                bearer_token: self.k8s_bearer_token.clone(),
                namespace: self.target_namespace.clone(),
            },
            workload_count: self.deployment_per_device,
            iteration_count: self.test_iterations,
            label_key: self.label_key.clone(),
            timings: LifecycleTimings::default(),
            retry_limits: RetryLimits {
                max_register_attempts: self.max_register_attempts,
                approve_max_attempts: self.approve_max_attempts,
            },
        }
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            device_count: self.devices,
            spawn_rate: self.spawn_rate,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Bootstrap bundle arguments
#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Folder to write the bundle into
    #[arg(long, env = "CERTS_FOLDER")]
    certs_folder: PathBuf,

    /// Common name of the bootstrap client certificate
    #[arg(long, default_value = "flotta-bootstrap")]
    common_name: String,

    /// Sign with an existing CA certificate instead of a fresh one
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Key of the CA given by --ca-cert
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format)?;

    match cli.command {
        Commands::Run(args) => run_fleet(args).await,
        Commands::BootstrapCerts(args) => bootstrap_certs(args).await,
    }
}

async fn run_fleet(args: RunArgs) -> anyhow::Result<()> {
    let config = args.sim_config();
    config.validate().context("invalid configuration")?;
    let driver_config = args.driver_config();
    driver_config.validate().context("invalid fleet settings")?;

    let certs = CertsDir::new(&config.certs_dir);
    let bootstrap = BootstrapIdentity::load(&certs)
        .await
        .context("failed to load bootstrap bundle")?;

    let identity: Arc<dyn IdentityProvider> = if args.in_process_keys {
        Arc::new(InProcessProvider::new(certs.clone()))
    } else {
        Arc::new(OpensslProvider::new(certs.clone()))
    };
    let backends = Backends {
        management: Arc::new(HttpManagementClient::new(
            config.management.clone(),
            bootstrap,
        )?),
        control_plane: Arc::new(HttpControlPlaneClient::new(config.control_plane.clone())?),
        identity,
    };

    info!(
        management = %config.management.base_url(),
        cluster_api = %config.control_plane.base_url(),
        namespace = %config.control_plane.namespace,
        workloads = config.workload_count,
        iterations = config.iteration_count,
        "Configuration loaded"
    );

    let driver = FleetDriver::new(config, driver_config, backends);
    let token = driver.cancellation_token();

    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "Error setting up signal handler"),
        }
    });

    if let Some(secs) = args.run_time_secs {
        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(run_time_secs = secs, "Run time elapsed");
                    timer_token.cancel();
                }
            }
        });
    }

    let report = driver.run().await;
    report.log_summary();

    if !report.all_succeeded() {
        anyhow::bail!("{} of {} devices failed", report.failed(), report.total());
    }
    Ok(())
}

async fn bootstrap_certs(args: BootstrapArgs) -> anyhow::Result<()> {
    let ca = match (&args.ca_cert, &args.ca_key) {
        (Some(cert), Some(key)) => load_ca(cert, key)
            .await
            .context("failed to load the signing CA")?,
        _ => CertificateAuthority::new("Flotta Bootstrap CA")?,
    };

    let certs = CertsDir::new(&args.certs_folder);
    write_bootstrap_bundle(&certs, &ca, &args.common_name).await?;

    info!(
        folder = %args.certs_folder.display(),
        reused_ca = args.ca_cert.is_some(),
        "Bootstrap bundle written"
    );
    Ok(())
}
