// src/upstream/pool.rs
// Registry of upstream clients keyed by container id, with a runtime
// enable/disable set kept separate from the registered set.

use crate::config::ContainerConfig;
use crate::upstream::client::UpstreamClient;
use crate::upstream::io_log::ContainerIoLogger;
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub struct UpstreamPool {
    clients: HashMap<String, Arc<UpstreamClient>>,
    enabled: RwLock<HashSet<String>>,
}

impl UpstreamPool {
    pub fn from_config(
        containers: &[ContainerConfig],
        io_log: Arc<ContainerIoLogger>,
    ) -> Result<Self> {
        let mut clients = HashMap::new();
        let mut enabled = HashSet::new();

        for c in containers {
            let cid = c.id.trim();
            if cid.is_empty() {
                bail!("container config must have a non-empty id");
            }
            if c.base_url.trim().is_empty() {
                bail!("container {cid} must have a base_url");
            }
            if clients.contains_key(cid) {
                bail!("duplicate container id: {cid}");
            }

            let client = UpstreamClient::new(
                cid,
                c.base_url.trim(),
                c.timeouts.connect_seconds,
                c.timeouts.read_seconds,
                c.analyze_retries,
                Arc::clone(&io_log),
            )?;
            clients.insert(cid.to_string(), Arc::new(client));
            if c.enabled {
                enabled.insert(cid.to_string());
            }
        }

        Ok(Self {
            clients,
            enabled: RwLock::new(enabled),
        })
    }

    pub fn list_enabled(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .enabled
            .read()
            .expect("enabled set poisoned")
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_enabled(&self, container_id: &str) -> bool {
        self.enabled
            .read()
            .expect("enabled set poisoned")
            .contains(container_id)
    }

    pub fn enable(&self, container_id: &str) -> Result<()> {
        if !self.clients.contains_key(container_id) {
            bail!("unknown container_id: {container_id}");
        }
        self.enabled
            .write()
            .expect("enabled set poisoned")
            .insert(container_id.to_string());
        Ok(())
    }

    pub fn disable(&self, container_id: &str) {
        self.enabled
            .write()
            .expect("enabled set poisoned")
            .remove(container_id);
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<UpstreamClient>> {
        self.clients.get(container_id).cloned()
    }
}
