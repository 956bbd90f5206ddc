//! Durable resource registry: the single source of truth for which
//! environments are managed and which ports they exclusively own.
//!
//! Every mutation commits to SQLite before becoming visible to readers, so
//! a relaunch after a crash never collides with ports still held by running
//! containers. All access goes through one `Mutex<Connection>`; port
//! allocation is a single critical section.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use wharf_core::{Environment, EnvironmentName, EnvironmentStatus};

pub const REGISTRY_SCHEMA_VERSION: i64 = 1;

/// Ports handed out when the preferred port is taken.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 3000..=3999;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("port range {start}..={end} exhausted for {environment}:{service}")]
    PortExhausted {
        environment: String,
        service: String,
        start: u16,
        end: u16,
    },
    #[error("port {port} already held by {holder}")]
    PortHeld { port: u16, holder: String },
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),
    #[error("environment already registered: {0}")]
    EnvironmentExists(String),
    #[error("base environment {0} is not eligible for deletion")]
    BaseEnvironment(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("corrupt registry row: {0}")]
    Corrupt(String),
}

pub struct PortRegistry {
    conn: Mutex<Connection>,
    range: RangeInclusive<u16>,
}

impl PortRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::open_with_range(path, DEFAULT_PORT_RANGE)
    }

    pub fn open_with_range(
        path: impl AsRef<Path>,
        range: RangeInclusive<u16>,
    ) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        let registry = Self {
            conn: Mutex::new(conn),
            range,
        };
        registry.migrate()?;
        Ok(registry)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
            range: DEFAULT_PORT_RANGE,
        };
        registry.migrate()?;
        Ok(registry)
    }

    fn migrate(&self) -> Result<(), RegistryError> {
        let conn = self.lock();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > REGISTRY_SCHEMA_VERSION {
            return Err(RegistryError::UnsupportedSchemaVersion {
                found: current,
                supported: REGISTRY_SCHEMA_VERSION,
            });
        }
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_registry.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a previous holder panicked mid-write;
        // the sqlite transaction has already rolled back at that point.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a port for (environment, service): the preferred port when
    /// free, otherwise the next free port in the configured range.
    pub fn allocate(
        &self,
        environment: &EnvironmentName,
        service: &str,
        preferred: Option<u16>,
    ) -> Result<u16, RegistryError> {
        let conn = self.lock();
        if let Some(existing) = lookup_port(&conn, environment.as_str(), service)? {
            return Ok(existing);
        }
        if let Some(port) = preferred {
            if lookup_holder(&conn, port)?.is_none() {
                insert_allocation(&conn, environment.as_str(), service, port)?;
                return Ok(port);
            }
        }
        for port in self.range.clone() {
            if lookup_holder(&conn, port)?.is_none() {
                insert_allocation(&conn, environment.as_str(), service, port)?;
                return Ok(port);
            }
        }
        Err(RegistryError::PortExhausted {
            environment: environment.to_string(),
            service: service.to_string(),
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Register an exact, already-published port (used by import, which
    /// must reuse the running container's host port rather than reassign).
    /// Idempotent for the same (environment, service, port) triple.
    pub fn reserve_exact(
        &self,
        environment: &EnvironmentName,
        service: &str,
        port: u16,
    ) -> Result<(), RegistryError> {
        let conn = self.lock();
        if let Some(holder) = lookup_holder(&conn, port)? {
            if holder == format!("{environment}:{service}") {
                return Ok(());
            }
            return Err(RegistryError::PortHeld { port, holder });
        }
        if let Some(existing) = lookup_port(&conn, environment.as_str(), service)? {
            return Err(RegistryError::PortHeld {
                port: existing,
                holder: format!("{environment}:{service}"),
            });
        }
        insert_allocation(&conn, environment.as_str(), service, port)
    }

    pub fn release(&self, environment: &EnvironmentName, service: &str) -> Result<(), RegistryError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM port_allocations WHERE environment = ?1 AND service = ?2",
            params![environment.as_str(), service],
        )?;
        Ok(())
    }

    pub fn ports_for(
        &self,
        environment: &EnvironmentName,
    ) -> Result<BTreeMap<String, u16>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT service, port FROM port_allocations WHERE environment = ?1 ORDER BY service",
        )?;
        let rows = stmt.query_map(params![environment.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u16>(1)?))
        })?;
        let mut ports = BTreeMap::new();
        for row in rows {
            let (service, port) = row?;
            ports.insert(service, port);
        }
        Ok(ports)
    }

    pub fn is_managed(&self, environment: &EnvironmentName) -> Result<bool, RegistryError> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM environments WHERE name = ?1 AND status = 'managed'",
                params![environment.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_environment(&self, env: &Environment) -> Result<(), RegistryError> {
        let conn = self.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM environments WHERE name = ?1",
                params![env.name.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(RegistryError::EnvironmentExists(env.name.to_string()));
        }
        conn.execute(
            "INSERT INTO environments
                 (name, worktree_path, branch, status, is_base, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                env.name.as_str(),
                env.worktree_path.to_string_lossy(),
                env.branch,
                env.status.as_str(),
                env.is_base as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_status(
        &self,
        environment: &EnvironmentName,
        status: EnvironmentStatus,
    ) -> Result<(), RegistryError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE environments SET status = ?2 WHERE name = ?1",
            params![environment.as_str(), status.as_str()],
        )?;
        if changed == 0 {
            return Err(RegistryError::EnvironmentNotFound(environment.to_string()));
        }
        Ok(())
    }

    pub fn get_environment(
        &self,
        environment: &EnvironmentName,
    ) -> Result<Option<Environment>, RegistryError> {
        let row = {
            let conn = self.lock();
            conn.query_row(
                "SELECT name, worktree_path, branch, status, is_base
                 FROM environments WHERE name = ?1",
                params![environment.as_str()],
                environment_from_row,
            )
            .optional()?
        };
        let Some(mut env) = row.transpose().map_err(RegistryError::Corrupt)? else {
            return Ok(None);
        };
        env.ports = self.ports_for(environment)?;
        Ok(Some(env))
    }

    pub fn list_environments(&self) -> Result<Vec<Environment>, RegistryError> {
        let names = {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT name FROM environments ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut environments = Vec::with_capacity(names.len());
        for name in names {
            let name = EnvironmentName::from_branch(&name)
                .map_err(|err| RegistryError::Corrupt(err.to_string()))?;
            if let Some(env) = self.get_environment(&name)? {
                environments.push(env);
            }
        }
        Ok(environments)
    }

    /// Remove an environment and release all of its allocations. The base
    /// environment is never eligible for deletion.
    pub fn remove_environment(&self, environment: &EnvironmentName) -> Result<(), RegistryError> {
        let conn = self.lock();
        let is_base: Option<i64> = conn
            .query_row(
                "SELECT is_base FROM environments WHERE name = ?1",
                params![environment.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match is_base {
            None => return Err(RegistryError::EnvironmentNotFound(environment.to_string())),
            Some(flag) if flag != 0 => {
                return Err(RegistryError::BaseEnvironment(environment.to_string()))
            }
            Some(_) => {}
        }
        conn.execute(
            "DELETE FROM port_allocations WHERE environment = ?1",
            params![environment.as_str()],
        )?;
        conn.execute(
            "DELETE FROM environments WHERE name = ?1",
            params![environment.as_str()],
        )?;
        Ok(())
    }
}

fn lookup_port(
    conn: &Connection,
    environment: &str,
    service: &str,
) -> Result<Option<u16>, RegistryError> {
    Ok(conn
        .query_row(
            "SELECT port FROM port_allocations WHERE environment = ?1 AND service = ?2",
            params![environment, service],
            |row| row.get(0),
        )
        .optional()?)
}

fn lookup_holder(conn: &Connection, port: u16) -> Result<Option<String>, RegistryError> {
    Ok(conn
        .query_row(
            "SELECT environment || ':' || service FROM port_allocations WHERE port = ?1",
            params![port],
            |row| row.get(0),
        )
        .optional()?)
}

fn insert_allocation(
    conn: &Connection,
    environment: &str,
    service: &str,
    port: u16,
) -> Result<(), RegistryError> {
    conn.execute(
        "INSERT INTO port_allocations (environment, service, port, allocated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![environment, service, port, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

#[allow(clippy::type_complexity)]
fn environment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Environment, String>> {
    let name: String = row.get(0)?;
    let worktree_path: String = row.get(1)?;
    let branch: String = row.get(2)?;
    let status: String = row.get(3)?;
    let is_base: i64 = row.get(4)?;
    Ok(build_environment(
        &name,
        &worktree_path,
        &branch,
        &status,
        is_base != 0,
    ))
}

fn build_environment(
    name: &str,
    worktree_path: &str,
    branch: &str,
    status: &str,
    is_base: bool,
) -> Result<Environment, String> {
    let name = EnvironmentName::from_branch(name).map_err(|err| err.to_string())?;
    let status = EnvironmentStatus::from_str(status).map_err(|err| err.to_string())?;
    Ok(Environment {
        name,
        worktree_path: worktree_path.into(),
        branch: branch.to_string(),
        status,
        is_base,
        ports: BTreeMap::new(),
        containers: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: &str) -> EnvironmentName {
        EnvironmentName::from_branch(raw).unwrap()
    }

    fn managed(raw: &str, branch: &str, is_base: bool) -> Environment {
        Environment {
            name: name(raw),
            worktree_path: format!("/tmp/worktrees/{raw}").into(),
            branch: branch.to_string(),
            status: EnvironmentStatus::Managed,
            is_base,
            ports: BTreeMap::new(),
            containers: Vec::new(),
        }
    }

    #[test]
    fn preferred_port_wins_when_free() {
        let registry = PortRegistry::open_in_memory().unwrap();
        let port = registry.allocate(&name("feature-a"), "web", Some(3100)).unwrap();
        assert_eq!(port, 3100);
    }

    #[test]
    fn taken_preferred_port_falls_back_to_next_free() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.allocate(&name("feature-a"), "web", Some(3000)).unwrap();
        let port = registry.allocate(&name("feature-b"), "web", Some(3000)).unwrap();
        assert_eq!(port, 3001);
    }

    #[test]
    fn no_port_is_ever_held_by_two_pairs() {
        let registry = PortRegistry::open_in_memory().unwrap();
        let mut seen = std::collections::HashSet::new();
        for env in ["a", "b", "c"] {
            for service in ["web", "db", "cache"] {
                let port = registry.allocate(&name(env), service, Some(3000)).unwrap();
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
    }

    #[test]
    fn allocate_is_idempotent_per_pair() {
        let registry = PortRegistry::open_in_memory().unwrap();
        let first = registry.allocate(&name("feature-a"), "web", Some(3200)).unwrap();
        let second = registry.allocate(&name("feature-a"), "web", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn released_port_becomes_reusable() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.allocate(&name("feature-a"), "web", Some(3000)).unwrap();
        registry.release(&name("feature-a"), "web").unwrap();
        let port = registry.allocate(&name("feature-b"), "web", Some(3000)).unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let registry = {
            let conn = Connection::open_in_memory().unwrap();
            let registry = PortRegistry {
                conn: Mutex::new(conn),
                range: 3000..=3001,
            };
            registry.migrate().unwrap();
            registry
        };
        registry.allocate(&name("a"), "web", None).unwrap();
        registry.allocate(&name("b"), "web", None).unwrap();
        let err = registry.allocate(&name("c"), "web", None).unwrap_err();
        assert!(matches!(err, RegistryError::PortExhausted { .. }));
    }

    #[test]
    fn reserve_exact_reuses_published_port_and_rejects_collisions() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.reserve_exact(&name("feature-a"), "db", 5432).unwrap();
        // Idempotent for the same triple.
        registry.reserve_exact(&name("feature-a"), "db", 5432).unwrap();
        let err = registry
            .reserve_exact(&name("feature-b"), "db", 5432)
            .unwrap_err();
        assert!(matches!(err, RegistryError::PortHeld { port: 5432, .. }));
    }

    #[test]
    fn allocations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let registry = PortRegistry::open(&path).unwrap();
            registry.insert_environment(&managed("feature-a", "feature/a", false)).unwrap();
            registry.allocate(&name("feature-a"), "web", Some(3123)).unwrap();
        }
        let registry = PortRegistry::open(&path).unwrap();
        assert!(registry.is_managed(&name("feature-a")).unwrap());
        let ports = registry.ports_for(&name("feature-a")).unwrap();
        assert_eq!(ports.get("web"), Some(&3123));
        // Still-held port is not reassigned after restart.
        let port = registry.allocate(&name("feature-b"), "web", Some(3123)).unwrap();
        assert_ne!(port, 3123);
    }

    #[test]
    fn only_one_environment_may_bind_the_base_branch() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.insert_environment(&managed("main", "main", true)).unwrap();
        let err = registry
            .insert_environment(&managed("main-two", "main", true))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Sqlite(_)));
    }

    #[test]
    fn base_environment_cannot_be_removed() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.insert_environment(&managed("main", "main", true)).unwrap();
        let err = registry.remove_environment(&name("main")).unwrap_err();
        assert!(matches!(err, RegistryError::BaseEnvironment(_)));
    }

    #[test]
    fn remove_releases_all_allocations() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.insert_environment(&managed("feature-a", "feature/a", false)).unwrap();
        registry.allocate(&name("feature-a"), "web", Some(3000)).unwrap();
        registry.allocate(&name("feature-a"), "db", Some(5432)).unwrap();
        registry.remove_environment(&name("feature-a")).unwrap();
        assert!(registry.ports_for(&name("feature-a")).unwrap().is_empty());
        let port = registry.allocate(&name("feature-b"), "web", Some(3000)).unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn duplicate_environment_insert_is_rejected() {
        let registry = PortRegistry::open_in_memory().unwrap();
        registry.insert_environment(&managed("feature-a", "feature/a", false)).unwrap();
        let err = registry
            .insert_environment(&managed("feature-a", "feature/a", false))
            .unwrap_err();
        assert!(matches!(err, RegistryError::EnvironmentExists(_)));
    }
}
