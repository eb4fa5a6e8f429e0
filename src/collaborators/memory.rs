//! In-memory collaborators
//!
//! Recording implementations of every collaborator trait. They keep the
//! calls they received and can be switched into a failing mode, which is
//! what the outbox and migration tests need. The CLI uses them for
//! dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::credentials::CredentialStore;
use super::endpoint::EndpointProvider;
use super::errors::{CollaboratorError, CollaboratorResult};
use super::executor::{JobRequest, RemoteExecutor, RemoteJobId, RemoteJobStatus};
use super::inventory::InventoryClient;
use super::probe::{HealthProbe, InstanceProbe};
use crate::outbox::{InventoryCall, ServiceLabels};
use crate::topology::{ClusterId, EntryKind, InstanceAddr};

fn lock<'a, T>(service: &'static str, m: &'a Mutex<T>) -> CollaboratorResult<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| CollaboratorError::unavailable(service, "lock poisoned"))
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Recording inventory client.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    calls: Mutex<Vec<InventoryCall>>,
    failing: AtomicBool,
}

impl MemoryInventory {
    const SERVICE: &'static str = "inventory";

    /// Create a healthy client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<InventoryCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: InventoryCall) -> CollaboratorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::rejected(Self::SERVICE, "injected failure"));
        }
        lock(Self::SERVICE, &self.calls)?.push(call);
        Ok(())
    }
}

impl InventoryClient for MemoryInventory {
    fn create_module(&self, cluster_id: ClusterId, business_id: u64, domain: &str) -> CollaboratorResult<()> {
        self.record(InventoryCall::CreateModule {
            cluster_id,
            business_id,
            domain: domain.to_string(),
        })
    }

    fn transfer_hosts(&self, domain: &str, hosts: &[String]) -> CollaboratorResult<()> {
        self.record(InventoryCall::TransferHosts {
            domain: domain.to_string(),
            hosts: hosts.to_vec(),
        })
    }

    fn register_service_instances(&self, instances: &[ServiceLabels]) -> CollaboratorResult<()> {
        self.record(InventoryCall::RegisterServiceInstances {
            instances: instances.to_vec(),
        })
    }

    fn delete_service_instances(&self, domain: &str, addrs: &[InstanceAddr]) -> CollaboratorResult<()> {
        self.record(InventoryCall::DeleteServiceInstances {
            domain: domain.to_string(),
            addrs: addrs.to_vec(),
        })
    }

    fn recycle_hosts(&self, hosts: &[String]) -> CollaboratorResult<()> {
        self.record(InventoryCall::RecycleHosts { hosts: hosts.to_vec() })
    }

    fn delete_module(&self, cluster_id: ClusterId, domain: &str) -> CollaboratorResult<()> {
        self.record(InventoryCall::DeleteModule {
            cluster_id,
            domain: domain.to_string(),
        })
    }
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Endpoint provider keeping entries in a map.
#[derive(Debug)]
pub struct MemoryEndpoint {
    kind: EntryKind,
    entries: Mutex<BTreeMap<(String, u16), BTreeSet<InstanceAddr>>>,
    failing: AtomicBool,
}

impl MemoryEndpoint {
    const SERVICE: &'static str = "endpoint";

    /// Create a provider for `kind`.
    pub fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Targets currently registered under an entry, `None` if absent.
    pub fn targets(&self, name: &str, port: u16) -> Option<BTreeSet<InstanceAddr>> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(&(name.to_string(), port)).cloned())
    }

    fn check(&self) -> CollaboratorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable(Self::SERVICE, "injected failure"));
        }
        Ok(())
    }
}

impl EndpointProvider for MemoryEndpoint {
    fn kind(&self) -> EntryKind {
        self.kind
    }

    fn add_targets(&self, name: &str, port: u16, targets: &[InstanceAddr]) -> CollaboratorResult<()> {
        self.check()?;
        lock(Self::SERVICE, &self.entries)?
            .entry((name.to_string(), port))
            .or_default()
            .extend(targets.iter().cloned());
        Ok(())
    }

    fn remove_targets(&self, name: &str, port: u16, targets: &[InstanceAddr]) -> CollaboratorResult<()> {
        self.check()?;
        if let Some(set) = lock(Self::SERVICE, &self.entries)?.get_mut(&(name.to_string(), port)) {
            for target in targets {
                set.remove(target);
            }
        }
        Ok(())
    }

    fn delete_entry(&self, name: &str, port: u16) -> CollaboratorResult<()> {
        self.check()?;
        lock(Self::SERVICE, &self.entries)?.remove(&(name.to_string(), port));
        Ok(())
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Password vault in a map.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    passwords: Mutex<HashMap<(InstanceAddr, u32, String), String>>,
}

impl MemoryCredentials {
    const SERVICE: &'static str = "credentials";

    /// Create an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a password is stored.
    pub fn contains(&self, addr: &InstanceAddr, cloud_zone: u32, username: &str) -> bool {
        self.passwords
            .lock()
            .map(|p| p.contains_key(&(addr.clone(), cloud_zone, username.to_string())))
            .unwrap_or(false)
    }
}

impl CredentialStore for MemoryCredentials {
    fn get_password(&self, addr: &InstanceAddr, cloud_zone: u32, username: &str) -> CollaboratorResult<String> {
        lock(Self::SERVICE, &self.passwords)?
            .get(&(addr.clone(), cloud_zone, username.to_string()))
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound {
                service: Self::SERVICE,
                what: format!("{}@{}", username, addr),
            })
    }

    fn set_password(
        &self,
        addr: &InstanceAddr,
        cloud_zone: u32,
        username: &str,
        password: &str,
    ) -> CollaboratorResult<()> {
        lock(Self::SERVICE, &self.passwords)?
            .insert((addr.clone(), cloud_zone, username.to_string()), password.to_string());
        Ok(())
    }

    fn delete_passwords(
        &self,
        cloud_zone: u32,
        instances: &[InstanceAddr],
        usernames: &[String],
    ) -> CollaboratorResult<()> {
        let mut passwords = lock(Self::SERVICE, &self.passwords)?;
        for addr in instances {
            for username in usernames {
                passwords.remove(&(addr.clone(), cloud_zone, username.clone()));
            }
        }
        Ok(())
    }
}

// =============================================================================
// REMOTE EXECUTOR
// =============================================================================

/// Executor that records submissions; statuses are set by the test.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    next_id: AtomicU64,
    jobs: Mutex<BTreeMap<RemoteJobId, (JobRequest, RemoteJobStatus)>>,
    failing: AtomicBool,
}

impl MemoryExecutor {
    const SERVICE: &'static str = "executor";

    /// Create an executor with no jobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent submission fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Overwrite the status of a job.
    pub fn set_status(&self, id: &RemoteJobId, status: RemoteJobStatus) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(job) = jobs.get_mut(id) {
                job.1 = status;
            }
        }
    }

    /// Set the status of every job submitted with `action`.
    pub fn set_status_for_action(&self, action: &str, status: RemoteJobStatus) {
        if let Ok(mut jobs) = self.jobs.lock() {
            for (request, current) in jobs.values_mut() {
                if request.action == action {
                    *current = status.clone();
                }
            }
        }
    }

    /// Submitted jobs in submission order.
    pub fn submitted(&self) -> Vec<(RemoteJobId, JobRequest)> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().map(|(id, (req, _))| (id.clone(), req.clone())).collect())
            .unwrap_or_default()
    }

    /// Submitted jobs with a given action.
    pub fn submitted_for(&self, action: &str) -> Vec<(RemoteJobId, JobRequest)> {
        self.submitted()
            .into_iter()
            .filter(|(_, req)| req.action == action)
            .collect()
    }
}

impl RemoteExecutor for MemoryExecutor {
    fn submit(&self, request: &JobRequest) -> CollaboratorResult<RemoteJobId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable(Self::SERVICE, "injected failure"));
        }
        // Zero-padded so lexical order is submission order.
        let id = RemoteJobId(format!("job-{:08}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        lock(Self::SERVICE, &self.jobs)?.insert(id.clone(), (request.clone(), RemoteJobStatus::Pending));
        Ok(id)
    }

    fn status(&self, id: &RemoteJobId) -> CollaboratorResult<RemoteJobStatus> {
        lock(Self::SERVICE, &self.jobs)?
            .get(id)
            .map(|(_, status)| status.clone())
            .ok_or_else(|| CollaboratorError::NotFound {
                service: Self::SERVICE,
                what: id.to_string(),
            })
    }
}

// =============================================================================
// HEALTH PROBE
// =============================================================================

/// Probe answering from configured tables.
#[derive(Debug)]
pub struct StaticProbe {
    unreachable: Mutex<BTreeSet<InstanceAddr>>,
    data_sizes: Mutex<BTreeMap<InstanceAddr, u64>>,
    free_disk: Mutex<BTreeMap<String, u64>>,
    dead_endpoints: Mutex<BTreeSet<(String, u16)>>,
    default_data_size: u64,
    default_free_disk: u64,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new(1 << 30, 100 << 30)
    }
}

impl StaticProbe {
    const SERVICE: &'static str = "probe";

    /// Every instance reachable with `default_data_size`, every host with
    /// `default_free_disk` free.
    pub fn new(default_data_size: u64, default_free_disk: u64) -> Self {
        Self {
            unreachable: Mutex::new(BTreeSet::new()),
            data_sizes: Mutex::new(BTreeMap::new()),
            free_disk: Mutex::new(BTreeMap::new()),
            dead_endpoints: Mutex::new(BTreeSet::new()),
            default_data_size,
            default_free_disk,
        }
    }

    /// Mark an instance unreachable.
    pub fn set_unreachable(&self, addr: InstanceAddr) {
        if let Ok(mut set) = self.unreachable.lock() {
            set.insert(addr);
        }
    }

    /// Override the data size of an instance.
    pub fn set_data_size(&self, addr: InstanceAddr, bytes: u64) {
        if let Ok(mut sizes) = self.data_sizes.lock() {
            sizes.insert(addr, bytes);
        }
    }

    /// Override the free disk of a host.
    pub fn set_free_disk(&self, ip: &str, bytes: u64) {
        if let Ok(mut disks) = self.free_disk.lock() {
            disks.insert(ip.to_string(), bytes);
        }
    }

    /// Make an endpoint unreachable.
    pub fn set_endpoint_down(&self, name: &str, port: u16) {
        if let Ok(mut set) = self.dead_endpoints.lock() {
            set.insert((name.to_string(), port));
        }
    }
}

impl HealthProbe for StaticProbe {
    fn probe_instance(&self, addr: &InstanceAddr, _password: &str) -> CollaboratorResult<InstanceProbe> {
        let reachable = !lock(Self::SERVICE, &self.unreachable)?.contains(addr);
        let data_size_bytes = lock(Self::SERVICE, &self.data_sizes)?
            .get(addr)
            .copied()
            .unwrap_or(self.default_data_size);
        Ok(InstanceProbe {
            reachable,
            data_size_bytes,
        })
    }

    fn host_free_disk_bytes(&self, ip: &str) -> CollaboratorResult<u64> {
        Ok(lock(Self::SERVICE, &self.free_disk)?
            .get(ip)
            .copied()
            .unwrap_or(self.default_free_disk))
    }

    fn probe_endpoint(&self, name: &str, port: u16) -> CollaboratorResult<bool> {
        Ok(!lock(Self::SERVICE, &self.dead_endpoints)?.contains(&(name.to_string(), port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_endpoint_add_remove() {
        let dns = MemoryEndpoint::new(EntryKind::Dns);
        let a = InstanceAddr::new("10.0.0.1", 50000);
        let b = InstanceAddr::new("10.0.0.2", 50000);

        dns.add_targets("cache.db", 50000, &[a.clone(), b.clone()]).unwrap();
        dns.remove_targets("cache.db", 50000, &[a]).unwrap();
        assert_eq!(dns.targets("cache.db", 50000).unwrap().into_iter().collect::<Vec<_>>(), vec![b]);

        dns.delete_entry("cache.db", 50000).unwrap();
        assert!(dns.targets("cache.db", 50000).is_none());
    }

    #[test]
    fn test_memory_inventory_failing() {
        let inventory = MemoryInventory::new();
        inventory.set_failing(true);
        assert!(inventory.recycle_hosts(&["10.0.0.1".to_string()]).is_err());
        inventory.set_failing(false);
        inventory.recycle_hosts(&["10.0.0.1".to_string()]).unwrap();
        assert_eq!(inventory.calls().len(), 1);
    }

    #[test]
    fn test_memory_executor_status() {
        let executor = MemoryExecutor::new();
        let id = executor
            .submit(&JobRequest::new("flush", "cache.db", serde_json::json!({})))
            .unwrap();
        assert_eq!(executor.status(&id).unwrap(), RemoteJobStatus::Pending);
        executor.set_status(&id, RemoteJobStatus::Succeeded);
        assert_eq!(executor.status(&id).unwrap(), RemoteJobStatus::Succeeded);
        assert!(executor.status(&RemoteJobId("missing".into())).is_err());
    }

    #[test]
    fn test_memory_credentials_delete() {
        let vault = MemoryCredentials::new();
        let addr = InstanceAddr::new("10.0.0.1", 30000);
        vault.set_password(&addr, 0, "admin", "s3cret").unwrap();
        assert_eq!(vault.get_password(&addr, 0, "admin").unwrap(), "s3cret");

        vault.delete_passwords(0, &[addr.clone()], &["admin".to_string()]).unwrap();
        assert!(!vault.contains(&addr, 0, "admin"));
    }

    #[test]
    fn test_static_probe_overrides() {
        let probe = StaticProbe::new(10, 100);
        let addr = InstanceAddr::new("10.0.0.1", 30000);
        assert!(probe.probe_instance(&addr, "").unwrap().reachable);
        probe.set_unreachable(addr.clone());
        probe.set_free_disk("10.0.0.1", 5);
        assert!(!probe.probe_instance(&addr, "").unwrap().reachable);
        assert_eq!(probe.host_free_disk_bytes("10.0.0.1").unwrap(), 5);
        assert_eq!(probe.host_free_disk_bytes("10.0.0.2").unwrap(), 100);
    }
}
