pub mod backoff;
pub mod error;
pub mod protocol;
pub mod util;

pub use error::OrchestratorError;
pub use protocol::{classify, encode_control, ChannelPayload, ControlFrame, FrameError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Environment identity, derived from the bound branch name with path
/// separators normalized to hyphens (`feature/login` -> `feature-login`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentName(String);

impl EnvironmentName {
    pub fn from_branch(branch: &str) -> Result<Self, OrchestratorError> {
        let normalized = branch.trim().replace('/', "-");
        if normalized.is_empty() {
            return Err(OrchestratorError::PreconditionFailed(
                "environment name cannot be empty".to_string(),
            ));
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(OrchestratorError::PreconditionFailed(format!(
                "environment name '{normalized}' contains whitespace"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvironmentName {
    type Err = OrchestratorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::from_branch(input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Discovered,
    Importing,
    Managed,
    Broken,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Discovered => "discovered",
            EnvironmentStatus::Importing => "importing",
            EnvironmentStatus::Managed => "managed",
            EnvironmentStatus::Broken => "broken",
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentStatus {
    type Err = OrchestratorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "discovered" => Ok(EnvironmentStatus::Discovered),
            "importing" => Ok(EnvironmentStatus::Importing),
            "managed" => Ok(EnvironmentStatus::Managed),
            "broken" => Ok(EnvironmentStatus::Broken),
            other => Err(OrchestratorError::PreconditionFailed(format!(
                "unknown environment status '{other}'"
            ))),
        }
    }
}

/// A managed development environment: one worktree, one branch, a set of
/// exclusively-owned port allocations and the containers bound to them.
///
/// Worktree path and branch are immutable after creation; the container and
/// port lists are mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub status: EnvironmentStatus,
    pub is_base: bool,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub containers: Vec<ContainerBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBinding {
    pub service: String,
    pub state: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Local,
    Remote,
    Base,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub hash: String,
    pub subject: String,
    pub author: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Derived view of one branch; recomputed on each catalog query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub kind: BranchKind,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitSummary>,
}

/// A worktree known to version control but absent from the registry,
/// produced by discovery and consumed by import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub name: EnvironmentName,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub can_import: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    pub has_compose_file: bool,
    #[serde(default)]
    pub running_containers: Vec<ContainerBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Interactive,
    LogStream,
    CombinedLogStream,
}

impl SessionKind {
    pub fn is_interactive(&self) -> bool {
        matches!(self, SessionKind::Interactive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Interactive => "interactive",
            SessionKind::LogStream => "log-stream",
            SessionKind::CombinedLogStream => "combined-log-stream",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_name_normalizes_slashes() {
        let name = EnvironmentName::from_branch("feature/login/v2").unwrap();
        assert_eq!(name.as_str(), "feature-login-v2");
    }

    #[test]
    fn environment_name_rejects_empty_and_whitespace() {
        assert!(EnvironmentName::from_branch("   ").is_err());
        assert!(EnvironmentName::from_branch("has space").is_err());
    }

    #[test]
    fn session_kind_round_trips_kebab_case() {
        let kind: SessionKind = serde_json::from_str("\"combined-log-stream\"").unwrap();
        assert_eq!(kind, SessionKind::CombinedLogStream);
        assert_eq!(
            serde_json::to_string(&SessionKind::LogStream).unwrap(),
            "\"log-stream\""
        );
    }
}
