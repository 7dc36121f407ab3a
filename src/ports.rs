//! Port lease registry.
//!
//! Services claim a port from a configured range and record the claim in a small
//! JSON discovery file (`~/.warden/ports.json` by default), so other processes
//! can find a running service without hardcoded ports. Every read-modify-write
//! of the file happens under an exclusive advisory lock on a sibling `.lock`
//! file. Leases whose owning process has died are reclaimed lazily.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PortsConfig;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{service}' is already leased on port {} by process {}", .lease.port, .lease.process_id)]
    AlreadyLeased { service: String, lease: PortLease },

    #[error("no free port in {start}-{end} for service '{service}'")]
    Exhausted { service: String, start: u16, end: u16 },

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("port registry I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One service's claimed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortLease {
    pub service: String,
    pub port: u16,
    pub process_id: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    port: u16,
    process_id: u32,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    services: BTreeMap<String, LeaseRecord>,
}

impl LeaseRecord {
    fn to_lease(&self, service: &str) -> PortLease {
        PortLease {
            service: service.to_string(),
            port: self.port,
            process_id: self.process_id,
            updated_at: self.updated_at,
        }
    }
}

/// Returns whether a process with this pid currently exists.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // signal 0 probes for existence; EPERM means it exists under another user
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[derive(Debug, Clone)]
pub struct PortRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    range: RangeInclusive<u16>,
    owner_pid: u32,
    liveness: fn(u32) -> bool,
}

impl PortRegistry {
    pub fn new(path: impl Into<PathBuf>, range: RangeInclusive<u16>) -> Result<Self, RegistryError> {
        if range.is_empty() {
            return Err(RegistryError::InvalidRange {
                start: *range.start(),
                end: *range.end(),
            });
        }
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Ok(Self {
            path,
            lock_path,
            range,
            owner_pid: std::process::id(),
            liveness: process_alive,
        })
    }

    pub fn from_config(config: &PortsConfig, path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::new(path, config.range_start..=config.range_end)
    }

    /// Record leases under a different owner pid (a process acting for another).
    pub fn with_owner(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn with_liveness(mut self, liveness: fn(u32) -> bool) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Claim a port for `service`.
    ///
    /// A live lease held by another process is reported as
    /// [`RegistryError::AlreadyLeased`]; a lease held by this owner is returned as is.
    pub fn acquire(&self, service: &str) -> Result<PortLease, RegistryError> {
        self.locked(|file| {
            if let Some(record) = file.services.get(service) {
                if record.process_id == self.owner_pid {
                    return Ok((record.to_lease(service), false));
                }
                if (self.liveness)(record.process_id) {
                    return Err(RegistryError::AlreadyLeased {
                        service: service.to_string(),
                        lease: record.to_lease(service),
                    });
                }
                tracing::info!(
                    service,
                    port = record.port,
                    stale_pid = record.process_id,
                    "reclaiming stale port lease"
                );
                file.services.remove(service);
            }

            let taken: HashSet<u16> = file
                .services
                .values()
                .filter(|r| r.process_id == self.owner_pid || (self.liveness)(r.process_id))
                .map(|r| r.port)
                .collect();

            for port in self.range.clone() {
                if taken.contains(&port) || !port_is_free(port) {
                    continue;
                }
                let record = LeaseRecord {
                    port,
                    process_id: self.owner_pid,
                    updated_at: Utc::now(),
                };
                let lease = record.to_lease(service);
                file.services.insert(service.to_string(), record);
                tracing::info!(service, port, pid = self.owner_pid, "port leased");
                return Ok((lease, true));
            }

            Err(RegistryError::Exhausted {
                service: service.to_string(),
                start: *self.range.start(),
                end: *self.range.end(),
            })
        })
    }

    /// Record an externally chosen port (e.g. a fixed control-plane port) for `service`.
    pub fn record(&self, service: &str, port: u16) -> Result<PortLease, RegistryError> {
        self.locked(|file| {
            if let Some(record) = file.services.get(service) {
                if record.process_id != self.owner_pid && (self.liveness)(record.process_id) {
                    return Err(RegistryError::AlreadyLeased {
                        service: service.to_string(),
                        lease: record.to_lease(service),
                    });
                }
            }
            let record = LeaseRecord {
                port,
                process_id: self.owner_pid,
                updated_at: Utc::now(),
            };
            let lease = record.to_lease(service);
            file.services.insert(service.to_string(), record);
            Ok((lease, true))
        })
    }

    /// Drop the lease for `service` if this owner holds it or it is stale.
    pub fn release(&self, service: &str) -> Result<bool, RegistryError> {
        self.locked(|file| {
            let Some(record) = file.services.get(service) else {
                return Ok((false, false));
            };
            if record.process_id != self.owner_pid && (self.liveness)(record.process_id) {
                tracing::warn!(
                    service,
                    owner = record.process_id,
                    "refusing to release a lease held by another live process"
                );
                return Ok((false, false));
            }
            file.services.remove(service);
            tracing::info!(service, "port lease released");
            Ok((true, true))
        })
    }

    /// Find the live lease for `service`, pruning it if its owner is gone.
    pub fn discover(&self, service: &str) -> Result<Option<PortLease>, RegistryError> {
        self.locked(|file| {
            let Some(record) = file.services.get(service) else {
                return Ok((None, false));
            };
            if (self.liveness)(record.process_id) {
                return Ok((Some(record.to_lease(service)), false));
            }
            tracing::info!(service, stale_pid = record.process_id, "pruning stale port lease");
            file.services.remove(service);
            Ok((None, true))
        })
    }

    /// All live leases, pruning stale ones on the way.
    pub fn leases(&self) -> Result<Vec<PortLease>, RegistryError> {
        self.locked(|file| {
            let before = file.services.len();
            file.services.retain(|_, r| (self.liveness)(r.process_id));
            let dirty = file.services.len() != before;
            let leases = file
                .services
                .iter()
                .map(|(name, r)| r.to_lease(name))
                .collect();
            Ok((leases, dirty))
        })
    }

    fn locked<R>(
        &self,
        f: impl FnOnce(&mut RegistryFile) -> Result<(R, bool), RegistryError>,
    ) -> Result<R, RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io(parent, e))?;
            }
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.io(&self.lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| self.io(&self.lock_path, e))?;

        let result = self.load().and_then(|mut file| {
            let (out, dirty) = f(&mut file)?;
            if dirty {
                self.persist(&file)?;
            }
            Ok(out)
        });

        let _ = FileExt::unlock(&lock);
        result
    }

    fn load(&self) -> Result<RegistryFile, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RegistryFile::default()),
            Err(e) => return Err(self.io(&self.path, e)),
        };
        if contents.trim().is_empty() {
            return Ok(RegistryFile::default());
        }
        match serde_json::from_str(&contents) {
            Ok(file) => Ok(file),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "port registry is unreadable, starting from an empty record"
                );
                Ok(RegistryFile::default())
            }
        }
    }

    fn persist(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| self.io(&self.path, std::io::Error::other(e)))?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = std::fs::File::create(&tmp_path).map_err(|e| self.io(&tmp_path, e))?;
        tmp.write_all(&bytes).map_err(|e| self.io(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| self.io(&tmp_path, e))?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io(&self.path, e))
    }

    fn io(&self, path: &Path, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn always_alive(_: u32) -> bool {
        true
    }

    fn never_alive(_: u32) -> bool {
        false
    }

    fn free_range(width: u16) -> RangeInclusive<u16> {
        // Let the OS pick a free port and build a range starting there.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let start = listener.local_addr().unwrap().port();
        drop(listener);
        start..=start.saturating_add(width)
    }

    #[test]
    fn rejects_empty_range() {
        let tmp = TempDir::new().unwrap();
        #[allow(clippy::reversed_empty_ranges)]
        let err = PortRegistry::new(tmp.path().join("ports.json"), 10..=5).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { start: 10, end: 5 }));
    }

    #[test]
    fn acquire_persists_and_discover_finds_it() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ports.json");
        let registry = PortRegistry::new(&path, free_range(20)).unwrap();

        let lease = registry.acquire("worker").unwrap();
        assert_eq!(lease.process_id, std::process::id());

        let contents = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["services"]["worker"]["port"], lease.port);

        let found = registry.discover("worker").unwrap().unwrap();
        assert_eq!(found.port, lease.port);
        assert!(registry.discover("missing").unwrap().is_none());
    }

    #[test]
    fn same_owner_reacquire_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = PortRegistry::new(tmp.path().join("ports.json"), free_range(20)).unwrap();
        let first = registry.acquire("worker").unwrap();
        let second = registry.acquire("worker").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_services_get_distinct_ports() {
        let tmp = TempDir::new().unwrap();
        let registry = PortRegistry::new(tmp.path().join("ports.json"), free_range(20)).unwrap();
        let a = registry.acquire("worker").unwrap();
        let b = registry.acquire("indexer").unwrap();
        assert_ne!(a.port, b.port);
        assert_eq!(registry.leases().unwrap().len(), 2);
    }

    #[test]
    fn stale_lease_is_pruned_on_discover() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ports.json");
        let range = free_range(20);
        PortRegistry::new(&path, range.clone())
            .unwrap()
            .with_owner(4_000_001)
            .with_liveness(always_alive)
            .acquire("worker")
            .unwrap();

        let observer = PortRegistry::new(&path, range).unwrap().with_liveness(never_alive);
        assert!(observer.discover("worker").unwrap().is_none());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"worker\""));
    }

    #[test]
    fn release_refuses_foreign_live_lease() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ports.json");
        let range = free_range(20);
        PortRegistry::new(&path, range.clone())
            .unwrap()
            .with_owner(4_000_002)
            .with_liveness(always_alive)
            .acquire("worker")
            .unwrap();

        let other = PortRegistry::new(&path, range).unwrap().with_liveness(always_alive);
        assert!(!other.release("worker").unwrap());
        assert!(other.discover("worker").unwrap().is_some());
    }

    #[test]
    fn record_claims_a_fixed_port() {
        let tmp = TempDir::new().unwrap();
        let registry = PortRegistry::new(tmp.path().join("ports.json"), free_range(5)).unwrap();
        let lease = registry.record("control-plane", 3002).unwrap();
        assert_eq!(lease.port, 3002);
        assert_eq!(registry.discover("control-plane").unwrap().unwrap().port, 3002);
        assert!(registry.release("control-plane").unwrap());
        assert!(!registry.release("control-plane").unwrap());
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ports.json");
        std::fs::write(&path, "{not json").unwrap();
        let registry = PortRegistry::new(&path, free_range(5)).unwrap();
        assert!(registry.discover("worker").unwrap().is_none());
        registry.acquire("worker").unwrap();
        assert!(registry.discover("worker").unwrap().is_some());
    }

    #[test]
    fn busy_port_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let registry =
            PortRegistry::new(tmp.path().join("ports.json"), busy..=busy.saturating_add(30)).unwrap();
        let lease = registry.acquire("worker").unwrap();
        assert_ne!(lease.port, busy);
    }
}
