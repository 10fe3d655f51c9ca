//! Persistent catalog.
//!
//! A keyed set of JSON documents under the data directory: one file per
//! chain plus shared files for discovered ports and the IP
//! blacklist/goodlist/rejected sets. Writes are whole-file replace via
//! temp-file + rename; reads are lazy and cached in memory with an
//! explicit refresh. The on-disk JSON layout (2-space pretty) is the
//! contract; another backend can sit behind the same trait.

use crate::error::{Error, Result};
use crate::types::{BlacklistEntry, Chain};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Failures at which a blacklisted host is promoted to the rejected set.
pub const REJECT_THRESHOLD: u32 = 10;

/// Blacklist entries below this failure count age out after six hours.
const BLACKLIST_MAX_AGE_HOURS: i64 = 6;
const BLACKLIST_KEEP_FAILURES: u32 = 5;

/// Rejected hosts age out after a day without new failures.
const REJECTED_MAX_AGE_HOURS: i64 = 24;

const PORTS_FILE: &str = "ports.json";
const BLACKLIST_FILE: &str = "blacklisted_ips.json";
const REJECTED_FILE: &str = "rejected_ips.json";
const GOOD_FILE: &str = "good_ips.json";
const RESERVED: [&str; 4] = [PORTS_FILE, BLACKLIST_FILE, REJECTED_FILE, GOOD_FILE];

const SEED_PORTS: [u16; 2] = [443, 26657];

#[async_trait]
pub trait Storage: Send + Sync {
    /// Re-read all state from disk, replacing the in-memory view.
    async fn refresh(&self) -> Result<()>;

    /// Snapshot of every chain, sorted by name.
    async fn chains(&self) -> Vec<Chain>;

    /// Lookup with refresh-on-miss.
    async fn get_chain(&self, name: &str) -> Option<Chain>;

    /// Insert or replace a chain and persist its document.
    async fn upsert_chain(&self, chain: Chain) -> Result<()>;

    /// Remove a chain and its document. Returns false when absent.
    async fn remove_chain(&self, name: &str) -> Result<bool>;

    /// Persist every chain document.
    async fn save_chains(&self) -> Result<()>;

    fn chain_count(&self) -> usize;

    fn ports(&self) -> BTreeSet<u16>;

    /// Add discovered ports; returns true when the set grew.
    fn add_ports(&self, ports: &[u16]) -> bool;

    async fn save_ports(&self) -> Result<()>;

    fn is_rejected(&self, host: &str) -> bool;

    fn is_good(&self, host: &str) -> bool;

    fn mark_good(&self, host: &str);

    /// Bump a host's blacklist counter, promoting to rejected at the
    /// threshold. Returns the new count.
    fn record_host_failure(&self, host: &str) -> u32;

    async fn save_ip_sets(&self) -> Result<()>;

    /// Age out stale blacklist entries (and long-quiet rejected hosts).
    /// Returns the number of removed entries.
    async fn cleanup_blacklist(&self) -> Result<usize>;
}

pub struct FileStorage {
    data_dir: PathBuf,
    chains: DashMap<String, Chain>,
    ports: Mutex<BTreeSet<u16>>,
    blacklist: DashMap<String, BlacklistEntry>,
    rejected: RwLock<HashSet<String>>,
    good: RwLock<HashSet<String>>,
    // Catalog writes are single-writer; readers use the in-memory maps.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    /// Open (creating if needed) a data directory and load its contents.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;

        let storage = Self {
            data_dir,
            chains: DashMap::new(),
            ports: Mutex::new(SEED_PORTS.into_iter().collect()),
            blacklist: DashMap::new(),
            rejected: RwLock::new(HashSet::new()),
            good: RwLock::new(HashSet::new()),
            write_lock: tokio::sync::Mutex::new(()),
        };
        storage.load_all().await?;
        info!(
            chains = storage.chains.len(),
            "Catalog loaded from {}",
            storage.data_dir.display()
        );
        Ok(storage)
    }

    async fn load_all(&self) -> Result<()> {
        self.load_chain_files().await?;
        if let Some(ports) = self.read_json::<BTreeSet<u16>>(PORTS_FILE).await? {
            let mut guard = self.ports.lock();
            guard.extend(ports);
            guard.extend(SEED_PORTS);
        }
        if let Some(blacklist) = self
            .read_json::<HashMap<String, BlacklistEntry>>(BLACKLIST_FILE)
            .await?
        {
            self.blacklist.clear();
            for (host, entry) in blacklist {
                self.blacklist.insert(host, entry);
            }
        }
        if let Some(rejected) = self.read_json::<HashSet<String>>(REJECTED_FILE).await? {
            *self.rejected.write() = rejected;
        }
        if let Some(good) = self.read_json::<HashSet<String>>(GOOD_FILE).await? {
            *self.good.write() = good;
        }
        Ok(())
    }

    async fn load_chain_files(&self) -> Result<()> {
        let mut loaded = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".json") || RESERVED.contains(&file_name) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Chain>(&bytes) {
                    Ok(chain) => {
                        loaded.insert(chain.chain_name.clone());
                        self.chains.insert(chain.chain_name.clone(), chain);
                    },
                    Err(e) => warn!("Skipping unparseable chain file {}: {}", path.display(), e),
                },
                Err(e) => warn!("Cannot read chain file {}: {}", path.display(), e),
            }
        }
        // Disk is authoritative: drop chains whose documents vanished.
        self.chains.retain(|name, _| loaded.contains(name));
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.data_dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    async fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        write_atomic(&self.data_dir.join(name), &serde_json::to_vec_pretty(value)?).await
    }

    fn chain_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.data_dir.join(format!("{}.json", sanitize_name(name)?)))
    }

    async fn save_chain(&self, chain: &Chain) -> Result<()> {
        let path = self.chain_file(&chain.chain_name)?;
        write_atomic(&path, &serde_json::to_vec_pretty(chain)?).await
    }
}

/// Chain names become file names; restrict them to a safe alphabet.
fn sanitize_name(name: &str) -> Result<&str> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(name)
    } else {
        Err(Error::Storage(format!("invalid chain name: {name:?}")))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn refresh(&self) -> Result<()> {
        debug!("Refreshing catalog from disk");
        self.load_all().await
    }

    async fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.chains.iter().map(|c| c.value().clone()).collect();
        chains.sort_by(|a, b| a.chain_name.cmp(&b.chain_name));
        chains
    }

    async fn get_chain(&self, name: &str) -> Option<Chain> {
        if let Some(chain) = self.chains.get(name) {
            return Some(chain.clone());
        }
        if self.refresh().await.is_err() {
            return None;
        }
        self.chains.get(name).map(|c| c.clone())
    }

    async fn upsert_chain(&self, chain: Chain) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_chain(&chain).await?;
        self.chains.insert(chain.chain_name.clone(), chain);
        Ok(())
    }

    async fn remove_chain(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let existed = self.chains.remove(name).is_some();
        if existed {
            let path = self.chain_file(name)?;
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(existed)
    }

    async fn save_chains(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let chains: Vec<Chain> = self.chains.iter().map(|c| c.value().clone()).collect();
        for chain in &chains {
            self.save_chain(chain).await?;
        }
        debug!(count = chains.len(), "Catalog flushed");
        Ok(())
    }

    fn chain_count(&self) -> usize {
        self.chains.len()
    }

    fn ports(&self) -> BTreeSet<u16> {
        self.ports.lock().clone()
    }

    fn add_ports(&self, ports: &[u16]) -> bool {
        let mut guard = self.ports.lock();
        let before = guard.len();
        guard.extend(ports.iter().copied());
        guard.len() > before
    }

    async fn save_ports(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let ports = self.ports.lock().clone();
        self.write_json(PORTS_FILE, &ports).await
    }

    fn is_rejected(&self, host: &str) -> bool {
        self.rejected.read().contains(host)
    }

    fn is_good(&self, host: &str) -> bool {
        self.good.read().contains(host)
    }

    fn mark_good(&self, host: &str) {
        self.good.write().insert(host.to_string());
    }

    fn record_host_failure(&self, host: &str) -> u32 {
        use dashmap::mapref::entry::Entry;
        let count = match self.blacklist.entry(host.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.failure_count += 1;
                entry.last_seen = Utc::now();
                entry.failure_count
            },
            Entry::Vacant(vacant) => {
                vacant.insert(BlacklistEntry::new());
                1
            },
        };

        if count >= REJECT_THRESHOLD {
            self.rejected.write().insert(host.to_string());
        }
        count
    }

    async fn save_ip_sets(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let blacklist: HashMap<String, BlacklistEntry> = self
            .blacklist
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.write_json(BLACKLIST_FILE, &blacklist).await?;
        let rejected: HashSet<String> = self.rejected.read().clone();
        self.write_json(REJECTED_FILE, &rejected).await?;
        let good: HashSet<String> = self.good.read().clone();
        self.write_json(GOOD_FILE, &good).await?;
        Ok(())
    }

    async fn cleanup_blacklist(&self) -> Result<usize> {
        let now = Utc::now();
        let soft_cutoff = now - ChronoDuration::hours(BLACKLIST_MAX_AGE_HOURS);
        let hard_cutoff = now - ChronoDuration::hours(REJECTED_MAX_AGE_HOURS);

        let before = self.blacklist.len();
        let mut unrejected = Vec::new();
        self.blacklist.retain(|host, entry| {
            if entry.failure_count < BLACKLIST_KEEP_FAILURES && entry.last_seen < soft_cutoff {
                return false;
            }
            if entry.last_seen < hard_cutoff {
                unrejected.push(host.clone());
                return false;
            }
            true
        });
        let removed = before - self.blacklist.len();

        if !unrejected.is_empty() {
            let mut rejected = self.rejected.write();
            for host in &unrejected {
                rejected.remove(host);
            }
        }

        if removed > 0 {
            info!(removed, "Blacklist cleanup");
            self.save_ip_sets().await?;
        }
        Ok(removed)
    }
}
