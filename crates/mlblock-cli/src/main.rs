//! mlblock CLI - kernel orchestration services.
//!
//! Single binary that provides:
//! - `mlblock kernel-service` - kernel API plus the event reconciler
//! - `mlblock project-service` - project API, kernel webhook and tunnel
//! - `mlblock reconcile` - the event reconciler on its own
//! - `mlblock init` - write a default configuration file

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use mlblock_core::{
    http::{build_kernel_router, build_project_router, KernelAppState, ProjectAppState},
    ContainerRuntime, CredentialSigner, DockerRuntime, EventReconciler, KernelManager,
    KernelRepository, ProjectManager, ProjectRepository, RestKernelService, ServiceConfig, Tunnel,
};

#[derive(Parser)]
#[command(name = "mlblock")]
#[command(about = "Kernel orchestration services", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "mlblock.yaml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the kernel API and watch runtime events
    KernelService,

    /// Serve the project API, kernel webhook and tunnel
    ProjectService,

    /// Watch runtime events and correct kernel status
    Reconcile,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if cli.json {
        fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    match cli.command {
        Commands::KernelService => run_kernel_service(load_config(&cli.config)?).await,
        Commands::ProjectService => run_project_service(load_config(&cli.config)?).await,
        Commands::Reconcile => run_reconciler(load_config(&cli.config)?).await,
        Commands::Init { force } => init_config(&cli.config, force),
    }
}

fn load_config(path: &Path) -> Result<ServiceConfig> {
    ServiceConfig::load_or_default(path).with_context(|| format!("loading {}", path.display()))
}

async fn run_kernel_service(config: ServiceConfig) -> Result<()> {
    let kernel_config = &config.kernel_service;
    tracing::info!(
        bind = %kernel_config.bind,
        image = %kernel_config.image,
        "Starting kernel service"
    );

    let repo = KernelRepository::open(&kernel_config.database)
        .with_context(|| format!("opening {}", kernel_config.database.display()))?;
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(&config.runtime, kernel_config)?);
    let manager = KernelManager::new(kernel_config, repo, runtime)?;
    let router = build_kernel_router(KernelAppState {
        kernels: Arc::new(manager),
    });

    let reconciler = build_reconciler(&config)?;
    let shutdown = shutdown_on_signal();

    let listener = TcpListener::bind(kernel_config.bind)
        .await
        .with_context(|| format!("binding {}", kernel_config.bind))?;
    tracing::info!(addr = %kernel_config.bind, "Kernel API listening");

    let mut reconciler = tokio::spawn(reconciler.run(stopped(shutdown.clone())));
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(stopped(shutdown))
            .await
    });

    tokio::select! {
        joined = &mut reconciler => {
            joined.context("reconciler task panicked")?.context("reconciler failed")?;
            server.await.context("server task panicked")?.context("kernel API failed")?;
        }
        joined = &mut server => {
            joined.context("server task panicked")?.context("kernel API failed")?;
            reconciler.await.context("reconciler task panicked")?.context("reconciler failed")?;
        }
    }

    tracing::info!("Kernel service stopped");
    Ok(())
}

async fn run_project_service(config: ServiceConfig) -> Result<()> {
    let project_config = &config.project_service;
    tracing::info!(
        bind = %project_config.bind,
        kernel_api = %project_config.kernel_api,
        "Starting project service"
    );

    let signer = CredentialSigner::new(config.require_secret()?);
    let repo = ProjectRepository::open(&project_config.database)
        .with_context(|| format!("opening {}", project_config.database.display()))?;
    let provisioner = RestKernelService::new(project_config, signer.clone())?;
    let tunnel = Tunnel::new(repo.clone(), project_config.tunnel_timeout())?;
    let router = build_project_router(ProjectAppState {
        projects: Arc::new(ProjectManager::new(repo, Arc::new(provisioner))),
        tunnel,
        signer,
    });

    let listener = TcpListener::bind(project_config.bind)
        .await
        .with_context(|| format!("binding {}", project_config.bind))?;
    tracing::info!(addr = %project_config.bind, "Project API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(stopped(shutdown_on_signal()))
        .await
        .context("project API failed")?;

    tracing::info!("Project service stopped");
    Ok(())
}

async fn run_reconciler(config: ServiceConfig) -> Result<()> {
    let reconciler = build_reconciler(&config)?;
    reconciler
        .run(stopped(shutdown_on_signal()))
        .await
        .context("reconciler failed")
}

/// A reconciler with its own store connection and runtime client.
fn build_reconciler(config: &ServiceConfig) -> Result<EventReconciler> {
    let kernel_config = &config.kernel_service;
    let repo = KernelRepository::open(&kernel_config.database)
        .with_context(|| format!("opening {}", kernel_config.database.display()))?;
    let runtime = DockerRuntime::connect(&config.runtime, kernel_config)?;
    Ok(EventReconciler::new(
        repo,
        Arc::new(runtime),
        kernel_config.fatal_exit_codes.clone(),
    ))
}

/// Flips to `true` on SIGTERM or Ctrl-C.
fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let terminate = terminate_signal();
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate => tracing::info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    tracing::info!("Received SIGINT");
                }
            }
        }
        let _ = tx.send(true);
    });
    rx
}

/// Registers the SIGTERM handler immediately; the returned future waits for it.
#[cfg(unix)]
fn terminate_signal() -> impl Future<Output = ()> + Send + 'static {
    use tokio::signal::unix::{signal, SignalKind};

    let registered = signal(SignalKind::terminate());
    async move {
        match registered {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_signal() -> impl Future<Output = ()> + Send + 'static {
    std::future::pending::<()>()
}

fn stopped(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} already exists, use --force to overwrite", path.display());
        return Ok(());
    }

    let default_config = r#"# mlblock configuration

# Shared secret for callback credentials.
# Prefer setting MLBLOCK_CALLBACK_SECRET instead.
callback_secret: ""

kernel_service:
  bind: 0.0.0.0:8000
  database: kernels.db
  image: mlblock-kernel-slave:0.0.6
  # Address workers use to reach this service
  orchestrator_url: http://host.docker.internal:8000
  worker_port: 5000
  # Host prefixed to a worker's published port
  advertise_host: 127.0.0.1
  worker_config_file: /root/.local/share/jupyter/runtime/config.json
  # Worker exit codes reported as error rather than stopped
  fatal_exit_codes: [1]
  webhook_timeout_secs: 5

project_service:
  bind: 0.0.0.0:8080
  database: projects.db
  kernel_api: http://localhost:8000
  # Address the kernel service uses for webhooks back to us
  public_url: http://host.docker.internal:8080
  request_timeout_secs: 5
  tunnel_timeout_secs: 30

runtime:
  # docker_socket: /var/run/docker.sock
  timeout_secs: 5
"#;
    std::fs::write(path, default_config)
        .with_context(|| format!("writing {}", path.display()))?;

    println!("Wrote {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. export MLBLOCK_CALLBACK_SECRET=<shared secret>");
    println!("  2. mlblock kernel-service");
    println!("  3. mlblock project-service");

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sigterm_requests_shutdown() {
        let rx = shutdown_on_signal();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), stopped(rx))
            .await
            .unwrap();
    }
}
