//! Per-VM network allocation and host plumbing.
//!
//! Every VM gets one tap device, one MAC address, one container CIDR, one
//! gateway address, and one network namespace. All of them derive
//! deterministically from a pool slot, so a restarted manager can reconcile
//! against interfaces that already exist on the host.

use std::collections::{BTreeSet, HashMap};

use firesnap_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::command::run;

/// Number of usable pool slots. Slot 0 is left unused so the 172.16.0.0/24
/// subnet stays free for the host.
pub const POOL_SIZE: u16 = 254;

/// Network parameters of one microVM, derived from its pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    slot: u16,
}

impl NetworkConfig {
    fn new(slot: u16) -> Self {
        Self { slot }
    }

    pub fn tap_name(&self) -> String {
        format!("fc-{}-tap0", self.slot)
    }

    pub fn mac_address(&self) -> String {
        format!(
            "02:FC:00:00:{:02X}:{:02X}",
            self.slot >> 8,
            self.slot & 0xff
        )
    }

    /// Address the guest configures on its interface, with prefix.
    pub fn container_cidr(&self) -> String {
        format!("172.16.{}.2/24", self.slot)
    }

    pub fn gateway_ip(&self) -> String {
        format!("172.16.{}.1", self.slot)
    }

    /// Address the guest is reachable at from the host.
    pub fn guest_ip(&self) -> String {
        format!("172.16.{}.2", self.slot)
    }

    pub fn namespace_name(&self) -> String {
        format!("fc-{}", self.slot)
    }

    pub fn namespace_path(&self) -> String {
        format!("/var/run/netns/{}", self.namespace_name())
    }

    fn host_veth(&self) -> String {
        format!("veth{}-0", self.slot)
    }

    fn ns_veth(&self) -> String {
        format!("veth{}-1", self.slot)
    }

    fn host_veth_ip(&self) -> String {
        format!("10.100.{}.1", self.slot)
    }

    fn ns_veth_ip(&self) -> String {
        format!("10.100.{}.2", self.slot)
    }
}

#[derive(Default)]
struct Pool {
    in_use: HashMap<String, NetworkConfig>,
    allocated: BTreeSet<u16>,
}

pub struct NetworkManager {
    pool: Mutex<Pool>,
    host_plumbing: bool,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self::with_host_plumbing(true)
    }

    /// With `host_plumbing` disabled only the allocation book-keeping runs;
    /// no interfaces or namespaces are touched.
    pub fn with_host_plumbing(host_plumbing: bool) -> Self {
        Self {
            pool: Mutex::new(Pool::default()),
            host_plumbing,
        }
    }

    pub async fn create_network(&self, vm_id: &str) -> Result<NetworkConfig> {
        let config = {
            let mut pool = self.pool.lock().await;
            if pool.in_use.contains_key(vm_id) {
                return Err(Error::Conflict(format!(
                    "network already allocated for VM {vm_id}"
                )));
            }
            let slot = (1..=POOL_SIZE)
                .find(|slot| !pool.allocated.contains(slot))
                .ok_or_else(|| {
                    Error::Resource(format!("network pool exhausted ({POOL_SIZE} slots)"))
                })?;
            let config = NetworkConfig::new(slot);
            pool.allocated.insert(slot);
            pool.in_use.insert(vm_id.to_string(), config.clone());
            config
        };

        if self.host_plumbing {
            if let Err(e) = self.plumb(&config).await {
                if let Err(te) = self.teardown(&config).await {
                    warn!(vm_id, error = %te, "partial network teardown failed");
                }
                let mut pool = self.pool.lock().await;
                pool.in_use.remove(vm_id);
                pool.allocated.remove(&config.slot);
                return Err(e);
            }
        }

        debug!(vm_id, slot = config.slot, "allocated network");
        Ok(config)
    }

    pub async fn get_config(&self, vm_id: &str) -> Result<NetworkConfig> {
        let pool = self.pool.lock().await;
        pool.in_use
            .get(vm_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no network allocated for VM {vm_id}")))
    }

    /// Release a VM's network. Removing an unknown VM is a no-op.
    pub async fn remove_network(&self, vm_id: &str) -> Result<()> {
        let config = {
            let mut pool = self.pool.lock().await;
            match pool.in_use.remove(vm_id) {
                Some(config) => {
                    pool.allocated.remove(&config.slot);
                    config
                }
                None => return Ok(()),
            }
        };

        debug!(vm_id, slot = config.slot, "released network");
        if self.host_plumbing {
            self.teardown(&config).await?;
        }
        Ok(())
    }

    /// VM identifiers with a live allocation.
    pub async fn list_allocations(&self) -> Vec<String> {
        let pool = self.pool.lock().await;
        pool.in_use.keys().cloned().collect()
    }

    async fn plumb(&self, config: &NetworkConfig) -> Result<()> {
        let ns = config.namespace_name();
        let tap = config.tap_name();
        let host_veth = config.host_veth();
        let ns_veth = config.ns_veth();
        let gateway = format!("{}/24", config.gateway_ip());
        let host_veth_addr = format!("{}/30", config.host_veth_ip());
        let ns_veth_addr = format!("{}/30", config.ns_veth_ip());

        run("ip", &["netns", "add", &ns]).await?;
        run(
            "ip",
            &["netns", "exec", &ns, "ip", "tuntap", "add", &tap, "mode", "tap"],
        )
        .await?;
        run(
            "ip",
            &["netns", "exec", &ns, "ip", "addr", "add", &gateway, "dev", &tap],
        )
        .await?;
        run("ip", &["netns", "exec", &ns, "ip", "link", "set", &tap, "up"]).await?;
        run("ip", &["netns", "exec", &ns, "ip", "link", "set", "lo", "up"]).await?;

        run(
            "ip",
            &["link", "add", &host_veth, "type", "veth", "peer", "name", &ns_veth],
        )
        .await?;
        run("ip", &["link", "set", &ns_veth, "netns", &ns]).await?;
        run("ip", &["addr", "add", &host_veth_addr, "dev", &host_veth]).await?;
        run("ip", &["link", "set", &host_veth, "up"]).await?;
        run(
            "ip",
            &["netns", "exec", &ns, "ip", "addr", "add", &ns_veth_addr, "dev", &ns_veth],
        )
        .await?;
        run(
            "ip",
            &["netns", "exec", &ns, "ip", "link", "set", &ns_veth, "up"],
        )
        .await?;
        run(
            "ip",
            &[
                "netns",
                "exec",
                &ns,
                "ip",
                "route",
                "add",
                "default",
                "via",
                &config.host_veth_ip(),
            ],
        )
        .await?;
        run(
            "ip",
            &["route", "add", &config.guest_ip(), "via", &config.ns_veth_ip()],
        )
        .await
    }

    async fn teardown(&self, config: &NetworkConfig) -> Result<()> {
        let guest_ip = config.guest_ip();
        let host_veth = config.host_veth();
        let ns = config.namespace_name();
        let mut first_err = None;
        // Deleting the namespace tears down the tap and the namespace end of
        // the veth pair with it.
        let steps: [&[&str]; 3] = [
            &["route", "del", &guest_ip],
            &["link", "del", &host_veth],
            &["netns", "del", &ns],
        ];
        for step in steps {
            if let Err(e) = run("ip", step).await {
                warn!(slot = config.slot, error = %e, "network teardown step failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager() -> NetworkManager {
        NetworkManager::with_host_plumbing(false)
    }

    #[tokio::test]
    async fn allocations_are_unique_across_live_vms() {
        let manager = manager();
        let mut cidrs = HashSet::new();
        let mut macs = HashSet::new();
        let mut taps = HashSet::new();

        for i in 0..10 {
            let config = manager.create_network(&format!("vm-{i}")).await.unwrap();
            assert!(cidrs.insert(config.container_cidr()));
            assert!(macs.insert(config.mac_address()));
            assert!(taps.insert(config.tap_name()));
        }
    }

    #[tokio::test]
    async fn released_slot_is_reused_deterministically() {
        let manager = manager();
        let first = manager.create_network("vm-a").await.unwrap();
        manager.create_network("vm-b").await.unwrap();

        manager.remove_network("vm-a").await.unwrap();
        let reused = manager.create_network("vm-c").await.unwrap();
        assert_eq!(first, reused);
    }

    #[tokio::test]
    async fn double_allocation_is_a_conflict() {
        let manager = manager();
        manager.create_network("vm-a").await.unwrap();
        let err = manager.create_network("vm-a").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn exhausted_pool_reports_resource_error() {
        let manager = manager();
        for i in 0..POOL_SIZE {
            manager.create_network(&format!("vm-{i}")).await.unwrap();
        }
        let err = manager.create_network("vm-extra").await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let manager = manager();
        manager.create_network("vm-a").await.unwrap();
        manager.remove_network("vm-a").await.unwrap();
        manager.remove_network("vm-a").await.unwrap();
        assert!(matches!(
            manager.get_config("vm-a").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn config_fields_derive_from_slot() {
        let config = NetworkConfig::new(7);
        assert_eq!(config.tap_name(), "fc-7-tap0");
        assert_eq!(config.mac_address(), "02:FC:00:00:00:07");
        assert_eq!(config.container_cidr(), "172.16.7.2/24");
        assert_eq!(config.gateway_ip(), "172.16.7.1");
        assert_eq!(config.guest_ip(), "172.16.7.2");
        assert_eq!(config.namespace_path(), "/var/run/netns/fc-7");
    }
}
