use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::models::peer::endpoint::BanTarget;
use crate::models::peer::endpoint::Endpoint;

/// A known endpoint, whether or not a connection to it exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointRecord {
    pub endpoint: Endpoint,

    /// Last time the endpoint was registered or refreshed.
    pub seen: SystemTime,

    /// Discovery origin label mapped to the last time the endpoint was
    /// reported from that origin.
    pub source: HashMap<String, SystemTime>,

    /// The endpoint must not be dialed before this time.
    pub lock: Option<SystemTime>,
}

impl EndpointRecord {
    fn new(endpoint: Endpoint, now: SystemTime) -> Self {
        Self {
            endpoint,
            seen: now,
            source: HashMap::new(),
            lock: None,
        }
    }

    pub fn is_locked_at(&self, now: SystemTime) -> bool {
        self.lock.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Default)]
struct DirectoryInner {
    endpoints: HashMap<Endpoint, EndpointRecord>,
    bans: HashMap<BanTarget, SystemTime>,

    /// Flattened copy of the endpoint keys, dropped on every mutation.
    listing: Option<Vec<Endpoint>>,
}

/// The address book: every endpoint this node has heard of, the active
/// bans, and short-lived dial locks.
#[derive(Debug, Default)]
pub struct EndpointDirectory {
    inner: RwLock<DirectoryInner>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, DirectoryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an endpoint or, if known, merge the source and refresh it.
    /// Registering a banned endpoint is allowed; bans only block dialing and
    /// accepting.
    pub fn register(&self, endpoint: Endpoint, source: &str) {
        let now = SystemTime::now();
        let mut inner = self.write();
        let record = inner
            .endpoints
            .entry(endpoint)
            .or_insert_with(|| EndpointRecord::new(endpoint, now));
        record.seen = now;
        record.source.insert(source.to_string(), now);
        inner.listing = None;
    }

    /// Mark a known endpoint as seen without adding a source. Returns false
    /// for unknown endpoints.
    pub fn refresh(&self, endpoint: &Endpoint) -> bool {
        let mut inner = self.write();
        match inner.endpoints.get_mut(endpoint) {
            Some(record) => {
                record.seen = SystemTime::now();
                true
            }
            None => false,
        }
    }

    pub fn deregister(&self, endpoint: &Endpoint) -> Option<EndpointRecord> {
        let mut inner = self.write();
        let removed = inner.endpoints.remove(endpoint);
        if removed.is_some() {
            inner.listing = None;
        }
        removed
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<EndpointRecord> {
        self.read().endpoints.get(endpoint).cloned()
    }

    /// Ban until `until`, purging every endpoint the ban covers. A later
    /// ban overwrites an earlier one, even if it is shorter.
    pub fn ban(&self, target: BanTarget, until: SystemTime) {
        let mut inner = self.write();
        inner.endpoints.retain(|endpoint, _| !target.covers(endpoint));
        inner.bans.insert(target, until);
        inner.listing = None;
    }

    pub fn unban(&self, target: &BanTarget) -> bool {
        self.write().bans.remove(target).is_some()
    }

    pub fn is_banned(&self, endpoint: &Endpoint) -> bool {
        self.is_banned_at(endpoint, SystemTime::now())
    }

    /// Whether the endpoint, or its IP, is banned at `now`. Expired bans
    /// stay in place until the next cleanup.
    pub fn is_banned_at(&self, endpoint: &Endpoint, now: SystemTime) -> bool {
        let inner = self.read();
        [
            BanTarget::Ip(endpoint.address),
            BanTarget::Endpoint(*endpoint),
        ]
        .iter()
        .any(|target| inner.bans.get(target).is_some_and(|until| now < *until))
    }

    pub fn is_ip_banned(&self, address: IpAddr) -> bool {
        let now = SystemTime::now();
        self.read()
            .bans
            .get(&BanTarget::Ip(address))
            .is_some_and(|until| now < *until)
    }

    /// All bans, including expired ones not yet cleaned up.
    pub fn bans(&self) -> HashMap<BanTarget, SystemTime> {
        self.read().bans.clone()
    }

    /// Prevent dialing a known endpoint for `duration`. Returns false for
    /// unknown endpoints.
    pub fn lock(&self, endpoint: &Endpoint, duration: Duration) -> bool {
        let until = SystemTime::now() + duration;
        let mut inner = self.write();
        match inner.endpoints.get_mut(endpoint) {
            Some(record) => {
                record.lock = Some(until);
                true
            }
            None => false,
        }
    }

    pub fn unlock(&self, endpoint: &Endpoint) {
        if let Some(record) = self.write().endpoints.get_mut(endpoint) {
            record.lock = None;
        }
    }

    pub fn is_locked(&self, endpoint: &Endpoint) -> bool {
        self.is_locked_at(endpoint, SystemTime::now())
    }

    pub fn is_locked_at(&self, endpoint: &Endpoint, now: SystemTime) -> bool {
        self.read()
            .endpoints
            .get(endpoint)
            .is_some_and(|record| record.is_locked_at(now))
    }

    /// Drop endpoints not seen within `max_age` and expired bans. Returns
    /// the number of entries removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(max_age, SystemTime::now())
    }

    pub fn cleanup_at(&self, max_age: Duration, now: SystemTime) -> usize {
        let mut inner = self.write();
        let endpoints_before = inner.endpoints.len();
        inner.endpoints.retain(|_, record| {
            now.duration_since(record.seen)
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
        let endpoints_removed = endpoints_before - inner.endpoints.len();

        let bans_before = inner.bans.len();
        inner.bans.retain(|_, until| now < *until);
        let bans_removed = bans_before - inner.bans.len();

        if endpoints_removed > 0 {
            inner.listing = None;
        }
        endpoints_removed + bans_removed
    }

    /// All known endpoints, in no particular order.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        if let Some(listing) = &self.read().listing {
            return listing.clone();
        }

        let mut inner = self.write();
        let listing: Vec<Endpoint> = inner.endpoints.keys().copied().collect();
        inner.listing = Some(listing.clone());
        listing
    }

    pub fn len(&self) -> usize {
        self.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a record's timestamps into the past.
    #[cfg(test)]
    pub(crate) fn age(&self, endpoint: &Endpoint, by: Duration) {
        if let Some(record) = self.write().endpoints.get_mut(endpoint) {
            record.seen -= by;
        }
    }
}
