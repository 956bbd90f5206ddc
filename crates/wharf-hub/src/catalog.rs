//! Derived branch catalog: which branches exist, which are free to bind to
//! a new environment, and what their latest commits look like. Everything
//! here is recomputed on each query; the previous listing is kept only as a
//! bounded-staleness fallback when the repository cannot be queried.

use crate::providers::GitProvider;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use wharf_core::util::TtlCache;
use wharf_core::{Branch, BranchKind, OrchestratorError};

/// How long a previously computed listing may stand in for a failed query.
const FALLBACK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct BranchListing {
    pub base: String,
    pub local: Vec<Branch>,
    pub remote: Vec<Branch>,
}

pub struct BranchCatalog<G> {
    git: Arc<G>,
    cached: Mutex<TtlCache<(), BranchListing>>,
}

impl<G: GitProvider> BranchCatalog<G> {
    pub fn new(git: Arc<G>) -> Self {
        Self::with_fallback_ttl(git, FALLBACK_TTL)
    }

    pub fn with_fallback_ttl(git: Arc<G>, ttl: Duration) -> Self {
        Self {
            git,
            cached: Mutex::new(TtlCache::new(ttl)),
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, TtlCache<(), BranchListing>> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Base-branch resolution never fails: prefer `main`, fall back to
    /// `master`, default to `main` when neither resolves.
    pub async fn base_branch(&self) -> String {
        if let Ok(true) = self.git.branch_exists("main").await {
            return "main".to_string();
        }
        if let Ok(true) = self.git.branch_exists("master").await {
            return "master".to_string();
        }
        "main".to_string()
    }

    pub async fn refresh_from_remote(&self) -> Result<(), OrchestratorError> {
        self.git
            .fetch_remote()
            .await
            .map_err(|err| OrchestratorError::RemoteUnavailable(err.to_string()))
    }

    /// List local and remote branches with availability derived from the
    /// base branch and the set of branches already bound to managed
    /// environments. With `refresh`, fetches from the remote first; a
    /// failed refresh degrades to the locally known state rather than
    /// failing the listing.
    pub async fn list_available(
        &self,
        bound_branches: &HashSet<String>,
        refresh: bool,
    ) -> Result<BranchListing, OrchestratorError> {
        if refresh {
            if let Err(err) = self.refresh_from_remote().await {
                warn!(event = "catalog_refresh_failed", error = %err);
            }
        }
        match self.compute(bound_branches).await {
            Ok(listing) => {
                self.lock_cache().insert((), listing.clone());
                Ok(listing)
            }
            Err(err) => {
                // A recent listing beats a hard failure; an expired one
                // does not.
                if let Some(cached) = self.lock_cache().get(&()).cloned() {
                    warn!(event = "catalog_using_cached", error = %err);
                    return Ok(cached);
                }
                Err(err)
            }
        }
    }

    async fn compute(
        &self,
        bound_branches: &HashSet<String>,
    ) -> Result<BranchListing, OrchestratorError> {
        let base = self.base_branch().await;
        let locals = self
            .git
            .local_branches()
            .await
            .map_err(|err| OrchestratorError::PreconditionFailed(format!("git query failed: {err}")))?;
        let remotes = self
            .git
            .remote_branches()
            .await
            .map_err(|err| OrchestratorError::PreconditionFailed(format!("git query failed: {err}")))?;

        // A remote branch counts as tracked only when some local branch's
        // configured upstream merge ref points at refs/heads/<short name>.
        // A same-named local branch without that configuration does not
        // count as tracking.
        let tracked: HashMap<String, String> = locals
            .iter()
            .filter_map(|branch| {
                branch
                    .merge_ref
                    .as_deref()
                    .and_then(|merge| merge.strip_prefix("refs/heads/"))
                    .map(|short| (short.to_string(), branch.name.clone()))
            })
            .collect();

        let mut local_out = Vec::with_capacity(locals.len());
        for branch in &locals {
            let is_base = branch.name == base;
            local_out.push(Branch {
                name: branch.name.clone(),
                kind: if is_base { BranchKind::Base } else { BranchKind::Local },
                available: !is_base && !bound_branches.contains(&branch.name),
                commit: self.commit_or_none(&branch.name).await,
            });
        }

        let mut remote_out = Vec::with_capacity(remotes.len());
        for name in &remotes {
            let short = name.split_once('/').map(|(_, rest)| rest).unwrap_or(name);
            remote_out.push(Branch {
                name: name.clone(),
                kind: BranchKind::Remote,
                available: !tracked.contains_key(short),
                commit: self.commit_or_none(name).await,
            });
        }

        Ok(BranchListing {
            base,
            local: local_out,
            remote: remote_out,
        })
    }

    /// One branch's failed commit lookup degrades to an absent summary
    /// instead of aborting the whole listing.
    async fn commit_or_none(&self, branch: &str) -> Option<wharf_core::CommitSummary> {
        match self.git.last_commit(branch).await {
            Ok(commit) => Some(commit),
            Err(err) => {
                debug!(event = "commit_lookup_failed", branch = branch, error = %err);
                None
            }
        }
    }
}
