use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wharf_core::{Environment, EnvironmentName, EnvironmentStatus};
use wharf_hub::catalog::BranchCatalog;
use wharf_hub::discovery::Discovery;
use wharf_hub::providers::{SubprocessDocker, SubprocessGit};
use wharf_hub::safety::SafetyGate;
use wharf_hub::server::{router, Hub, HubConfig};
use wharf_hub::session::SessionManager;
use wharf_storage::{PortRegistry, RegistryError};

#[derive(Parser, Debug)]
#[command(name = "wharf-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long, default_value = "")]
    data_dir: String,
    #[arg(long, default_value = "")]
    shell: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let addr: SocketAddr = match resolve_addr(&args.addr).parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %args.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %addr);
        return;
    }

    let repo_root = match args.repo.canonicalize() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_repo", error = %err, repo = %args.repo.display());
            return;
        }
    };
    let data_dir = resolve_data_dir(&args.data_dir, &repo_root);
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        error!(event = "data_dir_error", error = %err, dir = %data_dir.display());
        return;
    }

    let registry = match PortRegistry::open(data_dir.join("registry.db")) {
        Ok(value) => Arc::new(value),
        Err(err) => {
            error!(event = "registry_error", error = %err);
            return;
        }
    };

    let git = Arc::new(SubprocessGit::new(repo_root.clone()));
    let docker = Arc::new(SubprocessDocker);
    let catalog = BranchCatalog::new(git.clone());
    let discovery = Discovery::new(
        git.clone(),
        docker.clone(),
        registry.clone(),
        repo_root.clone(),
    );

    let base = catalog.base_branch().await;
    if let Err(err) = seed_base_environment(&registry, &base, &repo_root) {
        error!(event = "base_seed_error", error = %err);
        return;
    }

    let hub = Arc::new(Hub {
        config: HubConfig {
            repo_root: repo_root.clone(),
            shell: resolve_shell(&args.shell),
        },
        registry,
        catalog,
        discovery,
        gate: SafetyGate::new(),
        sessions: Arc::new(SessionManager::new()),
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %addr);
            return;
        }
    };
    info!(event = "hub_start", addr = %addr, repo = %repo_root.display(), base = %base);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };
    if let Err(err) = axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

/// The primary checkout is always registered, bound to the base branch and
/// protected from removal. Re-seeding on every start is a no-op.
fn seed_base_environment(
    registry: &PortRegistry,
    base: &str,
    repo_root: &std::path::Path,
) -> Result<(), RegistryError> {
    let name = match EnvironmentName::from_branch(base) {
        Ok(name) => name,
        Err(_) => return Ok(()),
    };
    match registry.insert_environment(&Environment {
        name,
        worktree_path: repo_root.to_path_buf(),
        branch: base.to_string(),
        status: EnvironmentStatus::Managed,
        is_base: true,
        ports: Default::default(),
        containers: Vec::new(),
    }) {
        Ok(()) | Err(RegistryError::EnvironmentExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("WHARF_LOG").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_addr(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var("WHARF_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:9800".to_string()
}

fn resolve_data_dir(flag: &str, repo_root: &std::path::Path) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("WHARF_DATA_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    repo_root.join(".wharf")
}

fn resolve_shell(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
