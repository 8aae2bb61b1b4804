//! Address pool
//!
//! Keeps every endpoint we have heard of, mirrors it in an [`EndpointStore`],
//! picks outbound connection candidates and answers address requests.
//! The pool stays bounded: stale entries are dropped by [`EndpointPool::purge`]
//! and, past `max_size`, the oldest survivors go as well.

use crate::network::endpoint::{unix_time, Endpoint, EndpointKey, ServiceFlags};
use crate::storage::{EndpointStore, StorageError, STORE_VERSION};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{thread_rng, Rng};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Minimum age of the stored last-seen time before a live connection
/// writes it through again
const CONNECTED_UPDATE_INTERVAL: i64 = 20 * 60;

/// Retry delay for endpoints seen within the last hour
const RECENT_RETRY_DELAY: i64 = 10 * 60;

const ONE_HOUR: f64 = 3600.0;
const ONE_DAY: f64 = 86_400.0;

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No candidate address available")]
    NoCandidateAvailable,
    #[error("Address store version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Store error: {0}")]
    Store(#[from] StorageError),
}

/// Pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries kept after a purge
    pub max_size: usize,
    /// Seconds since last seen after which an entry is purged
    pub stale_after: i64,
    /// Minimum seconds between two purges
    pub purge_interval: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 2500,
            stale_after: 14 * 24 * 60 * 60,
            purge_interval: 10 * 60,
        }
    }
}

pub struct EndpointPool {
    endpoints: BTreeMap<EndpointKey, Endpoint>,
    local: Endpoint,
    default_port: u16,
    last_purge: i64,
    /// Refreshed in memory, written out on the next flush
    dirty: HashSet<EndpointKey>,
    store: Box<dyn EndpointStore>,
    config: PoolConfig,
}

impl EndpointPool {
    /// Load the pool from `store`
    pub fn open(
        mut store: Box<dyn EndpointStore>,
        default_port: u16,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        match store.read_version()? {
            None => store.write_version(STORE_VERSION)?,
            Some(found) if found > STORE_VERSION => {
                return Err(PoolError::UnsupportedVersion {
                    found,
                    supported: STORE_VERSION,
                })
            }
            Some(_) => {}
        }

        let mut endpoints = BTreeMap::new();
        let mut invalid = Vec::new();
        for endpoint in store.load_all()? {
            if endpoint.is_valid() {
                endpoints.insert(endpoint.key(), endpoint);
            } else {
                invalid.push(endpoint);
            }
        }

        if !invalid.is_empty() {
            log::warn!("Dropping {} invalid stored addresses", invalid.len());
            store.txn_begin()?;
            for endpoint in &invalid {
                store.erase(&endpoint.key())?;
            }
            store.txn_commit()?;
        }

        log::info!("Loaded {} addresses", endpoints.len());

        let local = Endpoint::new(
            Ipv4Addr::UNSPECIFIED,
            default_port,
            ServiceFlags::NODE_NETWORK.bits(),
        );

        Ok(Self {
            endpoints,
            local,
            default_port,
            last_purge: 0,
            dirty: HashSet::new(),
            store,
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, key: &EndpointKey) -> Option<&Endpoint> {
        self.endpoints.get(key)
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Store failures never abort a pool operation
    fn persist(&mut self, key: &EndpointKey, endpoint: &Endpoint) {
        if let Err(e) = self.store.write(key, endpoint) {
            log::error!("Failed to store address {}: {}", endpoint, e);
        }
    }

    /// Add or refresh an endpoint. `penalty` seconds are subtracted from
    /// its last-seen time first. Returns true only for a new entry.
    pub fn add_endpoint(&mut self, endpoint: &Endpoint, penalty: i64) -> bool {
        if !endpoint.is_routable() || *endpoint == self.local {
            return false;
        }

        let mut endpoint = *endpoint;
        endpoint.set_time((endpoint.time() - penalty).max(0));
        let key = endpoint.key();

        let Some(existing) = self.endpoints.get_mut(&key) else {
            log::debug!("New address {}", endpoint);
            self.endpoints.insert(key, endpoint);
            self.persist(&key, &endpoint);
            return true;
        };

        let mut changed = false;
        if endpoint.time() > existing.time() {
            existing.set_time(endpoint.time());
            changed = true;
        }
        let services = existing.services() | endpoint.services();
        if services != existing.services() {
            existing.set_services(services);
            changed = true;
        }

        if changed {
            let updated = *existing;
            self.persist(&key, &updated);
        }
        false
    }

    /// Add a batch in a single store transaction, returning how many were new
    pub fn add_endpoints<'a, I>(&mut self, endpoints: I, penalty: i64) -> usize
    where
        I: IntoIterator<Item = &'a Endpoint>,
    {
        if let Err(e) = self.store.txn_begin() {
            log::error!("Failed to begin address transaction: {}", e);
        }
        let added = endpoints
            .into_iter()
            .filter(|endpoint| self.add_endpoint(endpoint, penalty))
            .count();
        if let Err(e) = self.store.txn_commit() {
            log::error!("Failed to commit addresses: {}", e);
        }
        added
    }

    /// Refresh the last-seen time of a peer we are connected to. The store
    /// is written at once when its copy is over 20 minutes old, otherwise on
    /// the next [`flush`](Self::flush).
    pub fn currently_connected(&mut self, endpoint: &Endpoint) {
        let now = unix_time();
        let key = endpoint.key();
        let Some(entry) = self.endpoints.get_mut(&key) else {
            return;
        };

        let write_through = now - entry.time() > CONNECTED_UPDATE_INTERVAL;
        entry.set_time(now);
        if write_through {
            let updated = *entry;
            self.dirty.remove(&key);
            self.persist(&key, &updated);
        } else {
            self.dirty.insert(key);
        }
    }

    /// Record a connection attempt
    pub fn mark_tried(&mut self, endpoint: &Endpoint, now: i64) {
        let key = endpoint.key();
        let Some(entry) = self.endpoints.get_mut(&key) else {
            return;
        };
        entry.set_last_try(now);
        let updated = *entry;
        self.dirty.remove(&key);
        self.persist(&key, &updated);
    }

    /// Weighted random pick among entries whose address is not excluded and
    /// whose retry backoff has expired at `start_time`
    pub fn get_candidate(
        &self,
        exclude: &HashSet<IpAddr>,
        start_time: i64,
    ) -> Result<Endpoint, PoolError> {
        let weighted: Vec<(&Endpoint, f64)> = self
            .endpoints
            .values()
            .filter(|endpoint| !exclude.contains(&endpoint.ip()))
            .filter_map(|endpoint| {
                candidate_weight(endpoint, start_time, self.default_port)
                    .map(|weight| (endpoint, weight))
            })
            .collect();

        if weighted.is_empty() {
            return Err(PoolError::NoCandidateAvailable);
        }

        let dist = WeightedIndex::new(weighted.iter().map(|(_, weight)| *weight))
            .map_err(|_| PoolError::NoCandidateAvailable)?;
        let (endpoint, _) = weighted[dist.sample(&mut thread_rng())];
        Ok(*endpoint)
    }

    /// Entries seen within `within` seconds, each kept with probability
    /// `1 / rand_max`
    pub fn get_recent(&self, within: i64, rand_max: u32) -> BTreeSet<Endpoint> {
        let since = unix_time() - within;
        let mut rng = thread_rng();
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.time() >= since)
            .filter(|_| rand_max <= 1 || rng.gen_range(0..rand_max) == 0)
            .copied()
            .collect()
    }

    pub fn count_recent(&self, within: i64) -> usize {
        let since = unix_time() - within;
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.time() >= since)
            .count()
    }

    /// Drop stale entries, then trim to `max_size`
    pub fn purge(&mut self) -> usize {
        self.purge_at(unix_time())
    }

    pub fn purge_at(&mut self, now: i64) -> usize {
        if now - self.last_purge < self.config.purge_interval {
            return 0;
        }
        self.last_purge = now;

        let cutoff = now - self.config.stale_after;
        let (mut doomed, mut live): (Vec<&Endpoint>, Vec<&Endpoint>) = self
            .endpoints
            .values()
            .partition(|endpoint| endpoint.time() < cutoff);

        if live.len() > self.config.max_size {
            live.sort_by_key(|endpoint| endpoint.time());
            let excess = live.len() - self.config.max_size;
            doomed.extend(live.drain(..excess));
        }

        let doomed: Vec<EndpointKey> = doomed.iter().map(|endpoint| endpoint.key()).collect();
        if doomed.is_empty() {
            return 0;
        }

        if let Err(e) = self.store.txn_begin() {
            log::error!("Failed to begin purge transaction: {}", e);
        }
        for key in &doomed {
            self.endpoints.remove(key);
            self.dirty.remove(key);
            if let Err(e) = self.store.erase(key) {
                log::error!("Failed to erase address: {}", e);
            }
        }
        if let Err(e) = self.store.txn_commit() {
            log::error!("Failed to commit purge: {}", e);
        }

        log::info!(
            "Purged {} addresses, {} remaining",
            doomed.len(),
            self.endpoints.len()
        );
        doomed.len()
    }

    pub fn get_local(&self) -> &Endpoint {
        &self.local
    }

    /// Set our externally visible address. Port 0 means the default port.
    pub fn set_local(&mut self, endpoint: &Endpoint) {
        let mut local = *endpoint;
        if local.port() == 0 {
            local.set_port(self.default_port);
        }

        let key = local.key();
        self.dirty.remove(&key);
        if self.endpoints.remove(&key).is_some() {
            if let Err(e) = self.store.erase(&key) {
                log::error!("Failed to erase local address: {}", e);
            }
        }

        log::info!("Local address set to {}", local);
        self.local = local;
    }

    /// Write out refreshed entries, then flush the store
    pub fn flush(&mut self) -> Result<(), PoolError> {
        if !self.dirty.is_empty() {
            self.store.txn_begin()?;
            for key in std::mem::take(&mut self.dirty) {
                if let Some(endpoint) = self.endpoints.get(&key) {
                    if let Err(e) = self.store.write(&key, endpoint) {
                        log::error!("Failed to store address {}: {}", endpoint, e);
                    }
                }
            }
            self.store.txn_commit()?;
        }
        self.store.flush()?;
        Ok(())
    }
}

/// Selection weight of a candidate, or None while its retry backoff runs.
///
/// The backoff grows with the square root of the time since the endpoint
/// was last seen (10 minutes for anything seen within the last hour).
/// Untried entries weigh double, stale ones fade over days, and entries on
/// a non-default port weigh half.
fn candidate_weight(endpoint: &Endpoint, now: i64, default_port: u16) -> Option<f64> {
    let since_seen = (now - endpoint.time()).max(0);

    if endpoint.last_try() != 0 {
        let since_try = now - endpoint.last_try();
        let delay = if since_seen < 3600 {
            RECENT_RETRY_DELAY
        } else {
            (ONE_HOUR * (since_seen as f64 / ONE_HOUR).sqrt()) as i64
        };
        if since_try < delay {
            return None;
        }
    }

    let mut weight = if endpoint.last_try() == 0 { 2.0 } else { 1.0 };
    weight /= 1.0 + since_seen as f64 / ONE_DAY;
    if endpoint.port() != default_port {
        weight /= 2.0;
    }
    Some(weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;

    fn pool() -> EndpointPool {
        EndpointPool::open(Box::new(FileStore::in_memory()), 8333, PoolConfig::default()).unwrap()
    }

    fn endpoint(last: u8, time: i64) -> Endpoint {
        let mut ep = Endpoint::new(Ipv4Addr::new(1, 2, 3, last), 8333, 1);
        ep.set_time(time);
        ep
    }

    #[test]
    fn test_add_endpoint_scenario() {
        let mut pool = pool();
        let now = unix_time();

        assert!(pool.add_endpoint(&endpoint(4, now - 100), 0));
        assert_eq!(pool.len(), 1);

        assert!(!pool.add_endpoint(&endpoint(4, now), 0));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&endpoint(4, 0).key()).unwrap().time(), now);
    }

    #[test]
    fn test_merge_keeps_later_time_and_unions_services() {
        let mut pool = pool();
        let mut first = endpoint(4, 5000);
        first.set_services(1);
        pool.add_endpoint(&first, 0);

        let mut older = endpoint(4, 1000);
        older.set_services(4);
        assert!(!pool.add_endpoint(&older, 0));

        let stored = pool.get(&first.key()).unwrap();
        assert_eq!(stored.time(), 5000);
        assert_eq!(stored.services(), 5);
    }

    #[test]
    fn test_penalty() {
        let mut a = pool();
        let mut b = pool();
        let ep = endpoint(4, 1_000_000);

        a.add_endpoint(&ep, 0);
        b.add_endpoint(&ep, 7200);

        let ta = a.get(&ep.key()).unwrap().time();
        let tb = b.get(&ep.key()).unwrap().time();
        assert_eq!(ta - tb, 7200);
    }

    #[test]
    fn test_penalty_floors_at_zero() {
        let mut pool = pool();
        pool.add_endpoint(&endpoint(4, 10), 7200);
        assert_eq!(pool.get(&endpoint(4, 0).key()).unwrap().time(), 0);
    }

    #[test]
    fn test_rejects_unroutable_and_local() {
        let mut pool = pool();
        let private = Endpoint::new(Ipv4Addr::new(192, 168, 1, 1), 8333, 1);
        assert!(!pool.add_endpoint(&private, 0));

        let local = endpoint(9, unix_time());
        pool.set_local(&local);
        assert!(!pool.add_endpoint(&local, 0));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_set_local_default_port() {
        let mut pool = pool();
        let ep = Endpoint::new(Ipv4Addr::new(8, 8, 4, 4), 0, 1);
        pool.set_local(&ep);
        assert_eq!(pool.get_local().port(), 8333);
    }

    #[test]
    fn test_get_recent_scenario() {
        let mut pool = pool();
        let ten_minutes_ago = unix_time() - 600;
        for i in 1..=5 {
            pool.add_endpoint(&endpoint(i, ten_minutes_ago), 0);
        }
        pool.add_endpoint(&endpoint(6, ten_minutes_ago - 7200), 0);

        assert_eq!(pool.get_recent(3600, 1).len(), 5);
        assert_eq!(pool.count_recent(3600), 5);
    }

    #[test]
    fn test_purge_removes_stale_only() {
        let mut pool = pool();
        let now = unix_time();
        let stale_after = pool.config().stale_after;

        pool.add_endpoint(&endpoint(1, now - stale_after - 10), 0);
        pool.add_endpoint(&endpoint(2, now - stale_after + 10), 0);
        pool.add_endpoint(&endpoint(3, now), 0);

        assert_eq!(pool.purge_at(now), 1);
        assert_eq!(pool.len(), 2);
        assert!(pool.get(&endpoint(2, 0).key()).is_some());
    }

    #[test]
    fn test_purge_rate_limited() {
        let mut pool = pool();
        let now = unix_time();
        assert_eq!(pool.purge_at(now), 0);

        pool.add_endpoint(&endpoint(1, 1000), 0);
        assert_eq!(pool.purge_at(now + 1), 0);
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.purge_at(now + pool.config().purge_interval), 1);
    }

    #[test]
    fn test_purge_capacity_evicts_oldest() {
        let config = PoolConfig {
            max_size: 3,
            ..PoolConfig::default()
        };
        let mut pool =
            EndpointPool::open(Box::new(FileStore::in_memory()), 8333, config).unwrap();
        let now = unix_time();
        for i in 1..=5u8 {
            pool.add_endpoint(&endpoint(i, now - 100 * i as i64), 0);
        }

        assert_eq!(pool.purge_at(now), 2);
        let left: Vec<u8> = pool.iter().map(|ep| ep.ipv4().octets()[3]).collect();
        assert_eq!(left, vec![1, 2, 3]);
    }

    #[test]
    fn test_candidate_respects_exclusion() {
        let mut pool = pool();
        let now = unix_time();
        for i in 1..=4 {
            pool.add_endpoint(&endpoint(i, now - 60), 0);
        }

        let exclude: HashSet<IpAddr> = (1..=3)
            .map(|i| endpoint(i, 0).ip())
            .collect();
        for _ in 0..20 {
            let candidate = pool.get_candidate(&exclude, now).unwrap();
            assert_eq!(candidate, endpoint(4, 0));
        }

        let all: HashSet<IpAddr> = pool.iter().map(|ep| ep.ip()).collect();
        assert!(matches!(
            pool.get_candidate(&all, now),
            Err(PoolError::NoCandidateAvailable)
        ));
    }

    #[test]
    fn test_candidate_backoff() {
        let mut pool = pool();
        let now = unix_time();
        let ep = endpoint(1, now - 60);
        pool.add_endpoint(&ep, 0);
        pool.mark_tried(&ep, now - 30);

        assert!(pool.get_candidate(&HashSet::new(), now).is_err());
        assert!(pool
            .get_candidate(&HashSet::new(), now + RECENT_RETRY_DELAY)
            .is_ok());
    }

    #[test]
    fn test_currently_connected_refreshes_time() {
        let mut pool = pool();
        let ep = endpoint(1, 1000);
        pool.add_endpoint(&ep, 0);

        let before = unix_time();
        pool.currently_connected(&ep);
        assert!(pool.get(&ep.key()).unwrap().time() >= before);
    }

    #[test]
    fn test_reload_from_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let now = unix_time();
        {
            let store = FileStore::open(temp_dir.path()).unwrap();
            let mut pool =
                EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
            pool.add_endpoint(&endpoint(1, now), 0);
            pool.add_endpoints([endpoint(2, now), endpoint(3, now)].iter(), 0);
        }

        let store = FileStore::open(temp_dir.path()).unwrap();
        let pool = EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_connection_state_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let now = unix_time();
        let ep = endpoint(1, now - 60);
        let (time, last_try) = {
            let store = FileStore::open(temp_dir.path()).unwrap();
            let mut pool =
                EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
            pool.add_endpoint(&ep, 0);
            pool.mark_tried(&ep, now);
            pool.currently_connected(&ep);
            pool.flush().unwrap();
            let stored = pool.get(&ep.key()).unwrap();
            (stored.time(), stored.last_try())
        };

        let store = FileStore::open(temp_dir.path()).unwrap();
        let pool = EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
        let reloaded = pool.get(&ep.key()).unwrap();
        assert_eq!(reloaded.last_try(), now);
        assert_eq!(reloaded.last_try(), last_try);
        assert_eq!(reloaded.time(), time);
    }

    #[test]
    fn test_mark_tried_written_through() {
        let temp_dir = tempfile::tempdir().unwrap();
        let now = unix_time();
        let ep = endpoint(1, now - 60);
        {
            let store = FileStore::open(temp_dir.path()).unwrap();
            let mut pool =
                EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
            pool.add_endpoint(&ep, 0);
            pool.mark_tried(&ep, now);
        }

        let store = FileStore::open(temp_dir.path()).unwrap();
        let pool = EndpointPool::open(Box::new(store), 8333, PoolConfig::default()).unwrap();
        assert_eq!(pool.get(&ep.key()).unwrap().last_try(), now);
    }

    #[test]
    fn test_purge_erases_from_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            max_size: 2,
            ..PoolConfig::default()
        };
        let now = unix_time();
        let stale = now - config.stale_after - 10;
        {
            let store = FileStore::open(temp_dir.path()).unwrap();
            let mut pool = EndpointPool::open(Box::new(store), 8333, config.clone()).unwrap();
            pool.add_endpoint(&endpoint(1, stale), 0);
            pool.add_endpoint(&endpoint(2, now - 10), 0);
            pool.add_endpoint(&endpoint(3, now - 20), 0);
            pool.add_endpoint(&endpoint(4, now - 30), 0);

            // one stale, one over capacity
            assert_eq!(pool.purge_at(now), 2);
        }

        let store = FileStore::open(temp_dir.path()).unwrap();
        assert!(!store.exists(&endpoint(1, 0).key()).unwrap());
        assert!(!store.exists(&endpoint(4, 0).key()).unwrap());

        let pool = EndpointPool::open(Box::new(store), 8333, config).unwrap();
        let left: Vec<u8> = pool.iter().map(|ep| ep.ipv4().octets()[3]).collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn test_newer_store_version_rejected() {
        let mut store = FileStore::in_memory();
        store.write_version(STORE_VERSION + 1).unwrap();
        let result = EndpointPool::open(Box::new(store), 8333, PoolConfig::default());
        assert!(matches!(result, Err(PoolError::UnsupportedVersion { .. })));
    }
}
