//! Narrow provider interfaces over the external version-control and
//! container-runtime tools. The orchestrator's logic never shells out
//! directly: it talks to these traits, so tests run against mocks and the
//! subprocess plumbing stays in one place.
//!
//! Every invocation is bounded by a short timeout and classified as a
//! failure on expiry rather than hanging the event loop.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use wharf_core::CommitSummary;

pub const TOOL_TIMEOUT: Duration = Duration::from_secs(5);
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status}: {stderr}")]
    Failed {
        tool: String,
        status: i32,
        stderr: String,
    },
    #[error("could not parse {tool} output: {reason}")]
    Parse { tool: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBranch {
    pub name: String,
    /// The configured upstream merge ref (`branch.<name>.merge`), e.g.
    /// `refs/heads/feature-x`. Absent when the branch tracks nothing.
    pub merge_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
    pub ports: Vec<PortMapping>,
}

// The methods are spelled as desugared `impl Future + Send` so callers can
// await them from multi-threaded server tasks; implementations still write
// plain `async fn`.
pub trait GitProvider: Send + Sync {
    fn list_worktrees(&self)
        -> impl Future<Output = Result<Vec<WorktreeInfo>, ProviderError>> + Send;
    fn local_branches(&self)
        -> impl Future<Output = Result<Vec<LocalBranch>, ProviderError>> + Send;
    fn remote_branches(&self) -> impl Future<Output = Result<Vec<String>, ProviderError>> + Send;
    fn branch_exists(&self, name: &str)
        -> impl Future<Output = Result<bool, ProviderError>> + Send;
    fn last_commit(
        &self,
        branch: &str,
    ) -> impl Future<Output = Result<CommitSummary, ProviderError>> + Send;
    fn fetch_remote(&self) -> impl Future<Output = Result<(), ProviderError>> + Send;
}

pub trait ContainerProvider: Send + Sync {
    fn list_containers(&self)
        -> impl Future<Output = Result<Vec<ContainerInfo>, ProviderError>> + Send;
}

async fn run_tool(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let label = match args.first() {
        Some(first) => format!("{program} {first}"),
        None => program.to_string(),
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    debug!(event = "tool_invoke", tool = %label);
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(ProviderError::Timeout {
                tool: label,
                timeout,
            })
        }
        Ok(Err(source)) => return Err(ProviderError::Spawn { tool: label, source }),
        Ok(Ok(output)) => output,
    };
    if !output.status.success() {
        return Err(ProviderError::Failed {
            tool: label,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Git via the `git` command-line tool, scoped to one repository.
pub struct SubprocessGit {
    repo: PathBuf,
}

impl SubprocessGit {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn git(&self, args: &[&str], timeout: Duration) -> Result<String, ProviderError> {
        run_tool("git", args, Some(&self.repo), timeout).await
    }
}

impl GitProvider for SubprocessGit {
    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, ProviderError> {
        let output = self
            .git(&["worktree", "list", "--porcelain"], TOOL_TIMEOUT)
            .await?;
        Ok(parse_worktrees(&output))
    }

    async fn local_branches(&self) -> Result<Vec<LocalBranch>, ProviderError> {
        let names = self
            .git(
                &["for-each-ref", "refs/heads", "--format=%(refname:short)"],
                TOOL_TIMEOUT,
            )
            .await?;
        // Exit status 1 with no output just means no tracking configuration.
        let merge_refs = match self
            .git(
                &["config", "--get-regexp", r"^branch\..*\.merge$"],
                TOOL_TIMEOUT,
            )
            .await
        {
            Ok(output) => parse_merge_refs(&output),
            Err(ProviderError::Failed { status: 1, .. }) => HashMap::new(),
            Err(err) => return Err(err),
        };
        Ok(names
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| LocalBranch {
                name: name.to_string(),
                merge_ref: merge_refs.get(name).cloned(),
            })
            .collect())
    }

    async fn remote_branches(&self) -> Result<Vec<String>, ProviderError> {
        let output = self
            .git(
                &["for-each-ref", "refs/remotes", "--format=%(refname:short)"],
                TOOL_TIMEOUT,
            )
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.contains('/') && !line.ends_with("/HEAD"))
            .map(str::to_string)
            .collect())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, ProviderError> {
        let refname = format!("refs/heads/{name}");
        match self
            .git(&["rev-parse", "--verify", "--quiet", &refname], TOOL_TIMEOUT)
            .await
        {
            Ok(_) => Ok(true),
            Err(ProviderError::Failed { status: 1, .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn last_commit(&self, branch: &str) -> Result<CommitSummary, ProviderError> {
        let output = self
            .git(
                &["log", "-1", "--format=%H%x09%s%x09%an%x09%cI", branch, "--"],
                TOOL_TIMEOUT,
            )
            .await?;
        parse_commit_line(output.trim())
    }

    async fn fetch_remote(&self) -> Result<(), ProviderError> {
        self.git(&["fetch", "--all", "--prune"], NETWORK_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Containers via `docker ps`, matched later against the environment naming
/// convention.
pub struct SubprocessDocker;

impl ContainerProvider for SubprocessDocker {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ProviderError> {
        let output = run_tool(
            "docker",
            &[
                "ps",
                "--format",
                "{{.Names}}\t{{.Status}}\t{{.Ports}}",
            ],
            None,
            TOOL_TIMEOUT,
        )
        .await?;
        Ok(parse_containers(&output))
    }
}

fn parse_worktrees(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(info) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                info.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                info.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
            // "detached" and "bare" lines leave branch as None.
        }
    }
    if let Some(info) = current {
        worktrees.push(info);
    }
    worktrees
}

fn parse_merge_refs(output: &str) -> HashMap<String, String> {
    let mut refs = HashMap::new();
    for line in output.lines() {
        let Some((key, value)) = line.trim().rsplit_once(' ') else {
            continue;
        };
        // Branch names may themselves contain dots, so strip the fixed
        // prefix and suffix rather than splitting on '.'.
        let Some(name) = key
            .strip_prefix("branch.")
            .and_then(|rest| rest.strip_suffix(".merge"))
        else {
            continue;
        };
        refs.insert(name.to_string(), value.to_string());
    }
    refs
}

fn parse_containers(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let name = fields.next()?.trim().to_string();
            let status = fields.next().unwrap_or("").trim();
            let ports_field = fields.next().unwrap_or("");
            Some(ContainerInfo {
                name,
                state: container_state(status),
                ports: ports_field
                    .split(',')
                    .filter_map(|mapping| parse_port_mapping(mapping.trim()))
                    .collect(),
            })
        })
        .collect()
}

fn container_state(status: &str) -> String {
    if status.starts_with("Up") {
        "running".to_string()
    } else if status.starts_with("Exited") {
        "exited".to_string()
    } else if status.starts_with("Created") {
        "created".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Parse one published-port entry in docker's `host:container/proto` form,
/// e.g. `0.0.0.0:5432->5432/tcp` or `[::]:8080->80/tcp`. Entries without a
/// published host port (plain `6379/tcp`) yield `None`.
pub fn parse_port_mapping(entry: &str) -> Option<PortMapping> {
    let (host_part, container_part) = entry.split_once("->")?;
    let host_port: u16 = host_part.rsplit_once(':')?.1.parse().ok()?;
    let (container_port, protocol) = container_part.split_once('/')?;
    Some(PortMapping {
        host_port,
        container_port: container_port.parse().ok()?,
        protocol: protocol.trim().to_string(),
    })
}

fn parse_commit_line(line: &str) -> Result<CommitSummary, ProviderError> {
    let parse_err = |reason: &str| ProviderError::Parse {
        tool: "git log".to_string(),
        reason: reason.to_string(),
    };
    let mut fields = line.splitn(4, '\t');
    let hash = fields.next().filter(|h| !h.is_empty()).ok_or_else(|| parse_err("missing hash"))?;
    let subject = fields.next().ok_or_else(|| parse_err("missing subject"))?;
    let author = fields.next().ok_or_else(|| parse_err("missing author"))?;
    let raw_ts = fields.next().ok_or_else(|| parse_err("missing timestamp"))?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(raw_ts.trim())
        .map_err(|err| parse_err(&format!("bad timestamp '{raw_ts}': {err}")))?
        .with_timezone(&Utc);
    Ok(CommitSummary {
        hash: hash.to_string(),
        subject: subject.to_string(),
        author: author.to_string(),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain_blocks() {
        let output = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.worktrees/feature-login
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature/login

worktree /repo/.worktrees/detached-probe
HEAD 3333333333333333333333333333333333333333
detached
";
        let worktrees = parse_worktrees(output);
        assert_eq!(worktrees.len(), 3);
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));
        assert_eq!(worktrees[1].branch.as_deref(), Some("feature/login"));
        assert_eq!(
            worktrees[1].path,
            PathBuf::from("/repo/.worktrees/feature-login")
        );
        assert_eq!(worktrees[2].branch, None);
    }

    #[test]
    fn parses_merge_refs_with_dotted_branch_names() {
        let output = "\
branch.main.merge refs/heads/main
branch.release.v1.2.merge refs/heads/release.v1.2
";
        let refs = parse_merge_refs(output);
        assert_eq!(refs.get("main").map(String::as_str), Some("refs/heads/main"));
        assert_eq!(
            refs.get("release.v1.2").map(String::as_str),
            Some("refs/heads/release.v1.2")
        );
    }

    #[test]
    fn parses_docker_ps_lines() {
        let output = "\
wharf-feature-login-web\tUp 2 hours\t0.0.0.0:3100->3000/tcp, [::]:3100->3000/tcp
wharf-feature-login-db\tExited (0) 3 minutes ago\t
unrelated\tUp 5 days\t6379/tcp
";
        let containers = parse_containers(output);
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[0].state, "running");
        assert_eq!(
            containers[0].ports,
            vec![
                PortMapping {
                    host_port: 3100,
                    container_port: 3000,
                    protocol: "tcp".to_string()
                };
                2
            ]
        );
        assert_eq!(containers[1].state, "exited");
        assert!(containers[1].ports.is_empty());
        // Unpublished ports are not bindings.
        assert!(containers[2].ports.is_empty());
    }

    #[test]
    fn port_mapping_parses_ipv4_and_ipv6_forms() {
        assert_eq!(
            parse_port_mapping("0.0.0.0:5432->5432/tcp"),
            Some(PortMapping {
                host_port: 5432,
                container_port: 5432,
                protocol: "tcp".to_string()
            })
        );
        assert_eq!(
            parse_port_mapping("[::]:8080->80/tcp").map(|m| m.host_port),
            Some(8080)
        );
        assert_eq!(parse_port_mapping("6379/tcp"), None);
        assert_eq!(parse_port_mapping("garbage"), None);
    }

    // Server handlers run on the multi-threaded runtime, so provider
    // futures must be Send.
    #[test]
    fn provider_futures_are_send() {
        fn require_send<F: Future + Send>(_future: F) {}
        let git = SubprocessGit::new("/repo");
        require_send(git.list_worktrees());
        require_send(git.local_branches());
        require_send(git.branch_exists("main"));
        require_send(git.last_commit("main"));
        require_send(git.fetch_remote());
        require_send(SubprocessDocker.list_containers());
    }

    #[test]
    fn commit_line_parses_and_rejects() {
        let commit = parse_commit_line(
            "abc123\tfix login redirect\tJane Doe\t2026-08-20T10:15:00+02:00",
        )
        .unwrap();
        assert_eq!(commit.subject, "fix login redirect");
        assert_eq!(commit.author, "Jane Doe");
        assert!(parse_commit_line("").is_err());
        assert!(parse_commit_line("abc\tsubject\tauthor\tnot-a-date").is_err());
    }
}
