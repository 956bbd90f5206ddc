//! Pre-flight validation for destructive or bulky filesystem operations.
//!
//! The gate never performs the operation. It answers one question: if this
//! export, delete, or archive ran right now, would it have the space and a
//! sane target to run against?

use fs2::available_space;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fraction added on top of the estimated size before comparing against
/// free space.
pub const DISK_BUFFER: f64 = 0.10;
/// Below this multiple of the required space, the verdict stays safe but
/// carries a warning.
pub const WARNING_HEADROOM: f64 = 1.5;

/// Paths an operation must never target, directly or via a symlink.
const RESERVED_PATHS: [&str; 13] = [
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/run", "/sbin",
    "/sys", "/usr",
];

pub trait DiskProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Probes the real filesystem.
pub struct SystemDiskProbe;

impl DiskProbe for SystemDiskProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        available_space(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Export,
    Delete,
    Archive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub target: PathBuf,
    pub estimated_bytes: u64,
    #[serde(default)]
    pub options: GateOptions,
}

/// Per-request tuning. Every check can be skipped individually; a skipped
/// check reports neither success nor failure.
#[derive(Debug, Clone, Deserialize)]
pub struct GateOptions {
    #[serde(default = "default_buffer")]
    pub buffer: f64,
    #[serde(default = "default_check")]
    pub check_disk: bool,
    #[serde(default = "default_check")]
    pub check_path: bool,
}

fn default_buffer() -> f64 {
    DISK_BUFFER
}

fn default_check() -> bool {
    true
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            buffer: DISK_BUFFER,
            check_disk: true,
            check_path: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskCheck {
    pub available: u64,
    pub required: u64,
    pub has_space: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathCheck {
    pub exists: bool,
    pub is_dir: bool,
    pub writable: bool,
    pub reserved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub safe: bool,
    pub checks: Checks,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub struct SafetyGate<D = SystemDiskProbe> {
    probe: D,
}

impl SafetyGate<SystemDiskProbe> {
    pub fn new() -> Self {
        Self {
            probe: SystemDiskProbe,
        }
    }
}

impl Default for SafetyGate<SystemDiskProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DiskProbe> SafetyGate<D> {
    pub fn with_probe(probe: D) -> Self {
        Self { probe }
    }

    /// Validate an operation without running it. Every violated check is
    /// reported; the verdict is unsafe if any check fails.
    pub fn validate(&self, request: &OperationRequest) -> Verdict {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let disk = if request.options.check_disk {
            let required = required_bytes(request.estimated_bytes, request.options.buffer);
            let probe_root = nearest_existing_ancestor(&request.target);
            match self.probe.available_space(&probe_root) {
                Ok(available) => {
                    let has_space = available >= required;
                    if !has_space {
                        errors.push(format!(
                            "insufficient disk space: {available} bytes available, {required} required"
                        ));
                    } else if (available as f64) < (required as f64) * WARNING_HEADROOM {
                        warnings.push(format!(
                            "low disk headroom: {available} bytes available, {required} required"
                        ));
                    }
                    Some(DiskCheck {
                        available,
                        required,
                        has_space,
                    })
                }
                Err(err) => {
                    errors.push(format!("disk space probe failed: {err}"));
                    None
                }
            }
        } else {
            None
        };

        let path = if request.options.check_path {
            self.check_path(request, &mut errors)
        } else {
            None
        };

        Verdict {
            safe: errors.is_empty(),
            checks: Checks { disk, path },
            warnings,
            errors,
        }
    }

    fn check_path(&self, request: &OperationRequest, errors: &mut Vec<String>) -> Option<PathCheck> {
        let target = &request.target;
        let exists = target.exists();
        let is_dir = target.is_dir();
        // Reserved-path checks run against the resolved path so a symlink
        // into a system directory does not slip through.
        let resolved = target
            .canonicalize()
            .unwrap_or_else(|_| target.to_path_buf());
        let reserved = is_reserved(&resolved);
        let writable = exists && is_writable(target);

        if !exists {
            errors.push(format!("target does not exist: {}", target.display()));
        } else if !is_dir {
            errors.push(format!("target is not a directory: {}", target.display()));
        } else if !writable {
            errors.push(format!("target is not writable: {}", target.display()));
        }
        if reserved {
            errors.push(format!(
                "target resolves to a reserved system path: {}",
                resolved.display()
            ));
        }

        Some(PathCheck {
            exists,
            is_dir,
            writable,
            reserved,
        })
    }
}

/// Estimated size plus the safety buffer, rounded up. The buffer is
/// computed on its own so float error on `1.0 + buffer` cannot inflate the
/// requirement by a stray byte.
fn required_bytes(estimated: u64, buffer: f64) -> u64 {
    estimated.saturating_add((estimated as f64 * buffer).ceil() as u64)
}

/// Free-space probes need an existing path; walk up until one exists.
fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return PathBuf::from("/"),
        }
    }
}

fn is_reserved(path: &Path) -> bool {
    RESERVED_PATHS.iter().any(|reserved| {
        if *reserved == "/" {
            path == Path::new("/")
        } else {
            path.starts_with(reserved)
        }
    })
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o200 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_writable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunStep {
    pub description: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunSummary {
    pub steps: Vec<DryRunStep>,
    pub total_bytes: u64,
    pub estimated_duration: Duration,
}

/// Assumed sustained throughput for duration estimates.
const THROUGHPUT_BYTES_PER_SEC: u64 = 100 * 1024 * 1024;

pub fn dry_run_summary(steps: Vec<DryRunStep>) -> DryRunSummary {
    let total_bytes: u64 = steps.iter().map(|step| step.bytes).sum();
    let seconds = (total_bytes / THROUGHPUT_BYTES_PER_SEC).max(1);
    DryRunSummary {
        steps,
        total_bytes,
        estimated_duration: Duration::from_secs(seconds),
    }
}
