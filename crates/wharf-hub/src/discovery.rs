//! Discovery of pre-existing worktree environments and the import flow
//! that brings them under management.
//!
//! A candidate is a git worktree that is not the primary checkout and is
//! not already registered. Its containers are matched by the naming
//! convention `wharf-<environment>-<service>`.

use crate::providers::{ContainerInfo, ContainerProvider, GitProvider};
use crate::{map_registry, CONTAINER_PREFIX};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use wharf_core::{
    Candidate, ContainerBinding, Environment, EnvironmentName, EnvironmentStatus,
    OrchestratorError,
};
use wharf_storage::PortRegistry;

const COMPOSE_FILE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

pub struct Discovery<G, C> {
    git: Arc<G>,
    containers: Arc<C>,
    registry: Arc<PortRegistry>,
    repo_root: PathBuf,
    /// Environment names with an import currently in flight. Guards
    /// against two concurrent imports of the same candidate.
    importing: Mutex<HashSet<String>>,
}

/// Releases the in-flight marker when an import ends, on any path out.
struct ImportGuard<'a> {
    importing: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for ImportGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.importing.lock() {
            set.remove(&self.name);
        }
    }
}

impl<G: GitProvider, C: ContainerProvider> Discovery<G, C> {
    pub fn new(
        git: Arc<G>,
        containers: Arc<C>,
        registry: Arc<PortRegistry>,
        repo_root: PathBuf,
    ) -> Self {
        Self {
            git,
            containers,
            registry,
            repo_root,
            importing: Mutex::new(HashSet::new()),
        }
    }

    /// Scan worktrees for environments that exist on disk but are not yet
    /// managed. Container listing failures degrade to candidates without
    /// container details rather than failing the scan.
    pub async fn discover_unmanaged(&self) -> Result<Vec<Candidate>, OrchestratorError> {
        let worktrees = self
            .git
            .list_worktrees()
            .await
            .map_err(|err| OrchestratorError::PreconditionFailed(format!("git query failed: {err}")))?;
        let containers = match self.containers.list_containers().await {
            Ok(list) => list,
            Err(err) => {
                warn!(event = "discovery_container_probe_failed", error = %err);
                Vec::new()
            }
        };

        let mut candidates = Vec::new();
        for worktree in worktrees {
            if worktree.path == self.repo_root {
                continue;
            }
            let branch = worktree.branch.clone();
            // Detached worktrees fall back to their directory name.
            let raw_name = match branch.as_deref() {
                Some(branch) => branch,
                None => match worktree.path.file_name().and_then(|n| n.to_str()) {
                    Some(stem) => stem,
                    None => continue,
                },
            };
            let name = match EnvironmentName::from_branch(raw_name) {
                Ok(name) => name,
                Err(_) => continue,
            };
            if self.registry.is_managed(&name).map_err(map_registry)? {
                continue;
            }

            let mut issues = Vec::new();
            if !worktree.path.exists() {
                issues.push(format!("worktree path missing: {}", worktree.path.display()));
            }
            match branch.as_deref() {
                Some(branch) => {
                    let resolvable = self.git.branch_exists(branch).await.unwrap_or(false);
                    if !resolvable {
                        issues.push(format!("branch does not resolve: {branch}"));
                    }
                }
                None => issues.push("worktree has a detached HEAD".to_string()),
            }
            let has_compose_file = COMPOSE_FILE_NAMES
                .iter()
                .any(|file| worktree.path.join(file).exists());

            let bindings = bindings_for(name.as_str(), &containers);
            let running = bindings
                .into_iter()
                .filter(|binding| binding.state == "running")
                .collect();

            candidates.push(Candidate {
                name,
                path: worktree.path,
                branch,
                can_import: issues.is_empty(),
                issues,
                has_compose_file,
                running_containers: running,
            });
        }
        Ok(candidates)
    }

    /// Bring a discovered candidate under management: register it, reserve
    /// the exact ports its containers already publish, and mark it managed.
    pub async fn import_environment(&self, raw: &str) -> Result<Environment, OrchestratorError> {
        let name: EnvironmentName = raw.parse()?;
        let _guard = {
            let mut set = self
                .importing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !set.insert(name.to_string()) {
                return Err(OrchestratorError::Conflict(format!(
                    "import of {name} already in progress"
                )));
            }
            ImportGuard {
                importing: &self.importing,
                name: name.to_string(),
            }
        };

        if self.registry.is_managed(&name).map_err(map_registry)? {
            return Err(OrchestratorError::AlreadyManaged(format!(
                "environment {name} not found or already managed"
            )));
        }
        let candidate = self
            .discover_unmanaged()
            .await?
            .into_iter()
            .find(|candidate| candidate.name == name)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "environment {name} not found or already managed"
                ))
            })?;
        if !candidate.can_import {
            return Err(OrchestratorError::PreconditionFailed(format!(
                "cannot import {name}: {}",
                candidate.issues.join("; ")
            )));
        }
        let branch = candidate.branch.clone().ok_or_else(|| {
            OrchestratorError::PreconditionFailed(format!("{name} has no branch to bind"))
        })?;

        self.registry
            .insert_environment(&Environment {
                name: name.clone(),
                worktree_path: candidate.path.clone(),
                branch: branch.clone(),
                status: EnvironmentStatus::Importing,
                is_base: false,
                ports: Default::default(),
                containers: Vec::new(),
            })
            .map_err(map_registry)?;

        // A failure past this point must unregister the environment and its
        // partial reservations, or the candidate could never be retried.
        match self.activate(&name, &branch).await {
            Ok(environment) => Ok(environment),
            Err(err) => {
                if let Err(rollback) = self.registry.remove_environment(&name) {
                    warn!(
                        event = "import_rollback_failed",
                        environment = %name,
                        error = %rollback
                    );
                }
                Err(err)
            }
        }
    }

    async fn activate(
        &self,
        name: &EnvironmentName,
        branch: &str,
    ) -> Result<Environment, OrchestratorError> {
        let containers = match self.containers.list_containers().await {
            Ok(list) => list,
            Err(err) => {
                warn!(event = "import_container_probe_failed", environment = %name, error = %err);
                Vec::new()
            }
        };
        let bindings = bindings_for(name.as_str(), &containers);
        for binding in &bindings {
            if let Some(port) = binding.port {
                self.registry
                    .reserve_exact(name, &binding.service, port)
                    .map_err(map_registry)?;
            }
        }

        self.registry
            .update_status(name, EnvironmentStatus::Managed)
            .map_err(map_registry)?;
        info!(
            event = "environment_imported",
            environment = %name,
            branch = %branch,
            containers = bindings.len()
        );

        let mut environment = self
            .registry
            .get_environment(name)
            .map_err(map_registry)?
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        environment.containers = bindings;
        Ok(environment)
    }
}

/// Match containers named `wharf-<environment>-<service>` to an
/// environment. The published port, when any, is the first host mapping.
fn bindings_for(environment: &str, containers: &[ContainerInfo]) -> Vec<ContainerBinding> {
    let prefix = format!("{CONTAINER_PREFIX}{environment}-");
    containers
        .iter()
        .filter_map(|container| {
            let service = container.name.strip_prefix(&prefix)?;
            if service.is_empty() {
                return None;
            }
            Some(ContainerBinding {
                service: service.to_string(),
                state: container.state.clone(),
                port: container.ports.first().map(|mapping| mapping.host_port),
            })
        })
        .collect()
}
