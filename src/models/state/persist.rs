use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use super::endpoint_directory::EndpointDirectory;
use super::peer_registry::PeerRegistry;
use crate::models::peer::endpoint::BanTarget;
use crate::models::peer::endpoint::Endpoint;

/// Source label of endpoints restored from a persisted state.
pub const PERSIST_SOURCE: &str = "persist";

/// Byte oriented storage for the persisted state.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read the whole file. A missing file reads as empty.
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()>;
}

/// Storage on the local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStorage;

impl Storage for FileStorage {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err),
        };
        let mut bytes = vec![];
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()
    }
}

/// Bans and the endpoints of active peers, as written to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub bans: HashMap<BanTarget, SystemTime>,
    pub bootstrap: Vec<Endpoint>,
}

impl PersistedState {
    /// Collect the current state. Bans expired at `now` are left out.
    pub fn capture(directory: &EndpointDirectory, registry: &PeerRegistry, now: SystemTime) -> Self {
        let bans = directory
            .bans()
            .into_iter()
            .filter(|(_, until)| now < *until)
            .collect();

        let mut bootstrap: Vec<Endpoint> = registry
            .snapshot()
            .iter()
            .map(|peer| peer.endpoint())
            .filter(Endpoint::is_dialable)
            .collect();
        bootstrap.sort();
        bootstrap.dedup();

        Self { bans, bootstrap }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode a persisted blob. Empty input is an empty state; anything
    /// else that does not parse is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn save(&self, storage: &dyn Storage, path: &Path) -> Result<()> {
        storage
            .write(path, &self.to_bytes()?)
            .with_context(|| format!("Failed to write persisted state to {}", path.display()))
    }

    pub fn load(storage: &dyn Storage, path: &Path) -> Result<Self> {
        let bytes = storage
            .read(path)
            .with_context(|| format!("Failed to read persisted state from {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("Corrupt persisted state in {}", path.display()))
    }

    /// Restore bans that are still running at `now` and register the
    /// bootstrap endpoints. Returns the number of bans restored.
    pub fn apply(self, directory: &EndpointDirectory, now: SystemTime) -> usize {
        let mut restored = 0;
        for (target, until) in self.bans {
            if now < until {
                directory.ban(target, until);
                restored += 1;
            }
        }

        for endpoint in self.bootstrap {
            directory.register(endpoint, PERSIST_SOURCE);
        }
        restored
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::tests::shared::test_args;
    use crate::tests::shared::TestChannels;

    /// Storage kept in memory.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStorage {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    }

    impl Storage for MemoryStorage {
        fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default())
        }

        fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), bytes.to_vec());
            Ok(())
        }
    }

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn round_trip_prunes_expired_bans_on_persist() {
        let storage = MemoryStorage::default();
        let path = PathBuf::from("state.json");
        let now = SystemTime::now();

        let directory = EndpointDirectory::new();
        directory.ban(BanTarget::Ip(ip(100)), now + HOUR);
        directory.ban(BanTarget::Endpoint(Endpoint::new(ip(101), 80)), now + HOUR);
        directory.ban(BanTarget::Ip(ip(102)), now - HOUR);

        let channels = TestChannels::new();
        let registry = PeerRegistry::new();
        for last in 1..=5 {
            let peer = channels.peer(
                test_args(),
                std::net::SocketAddr::new(ip(last), 40000),
                last % 2 == 0,
            );
            drop(peer.activate_detached(u64::from(last), 8108));
            registry.upsert(peer);
        }

        PersistedState::capture(&directory, &registry, now)
            .save(&storage, &path)
            .unwrap();
        let loaded = PersistedState::load(&storage, &path).unwrap();

        assert_eq!(2, loaded.bans.len());
        assert!(!loaded.bans.contains_key(&BanTarget::Ip(ip(102))));
        assert_eq!(5, loaded.bootstrap.len());
        assert!(loaded.bootstrap.contains(&Endpoint::new(ip(3), 8108)));

        let restored_directory = EndpointDirectory::new();
        assert_eq!(2, loaded.apply(&restored_directory, now));
        assert_eq!(5, restored_directory.len());
        assert!(restored_directory.is_ip_banned(ip(100)));
        let record = restored_directory
            .get(&Endpoint::new(ip(1), 8108))
            .unwrap();
        assert!(record.source.contains_key(PERSIST_SOURCE));
    }

    #[test]
    fn apply_skips_bans_expired_since_persist() {
        let now = SystemTime::now();
        let state = PersistedState {
            bans: HashMap::from([
                (BanTarget::Ip(ip(1)), now + HOUR),
                (BanTarget::Ip(ip(2)), now + 2 * HOUR),
            ]),
            bootstrap: vec![],
        };

        let directory = EndpointDirectory::new();
        assert_eq!(1, state.apply(&directory, now + 90 * Duration::from_secs(60)));
        assert_eq!(1, directory.bans().len());
    }

    #[test]
    fn missing_and_empty_files_are_empty_state() {
        let storage = MemoryStorage::default();
        let path = PathBuf::from("missing.json");
        assert_eq!(
            PersistedState::default(),
            PersistedState::load(&storage, &path).unwrap()
        );

        storage.write(&path, b"  \n").unwrap();
        assert_eq!(
            PersistedState::default(),
            PersistedState::load(&storage, &path).unwrap()
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let storage = MemoryStorage::default();
        let path = PathBuf::from("corrupt.json");
        storage.write(&path, b"{ \"bans\": 12").unwrap();
        assert!(PersistedState::load(&storage, &path).is_err());
    }

    #[test]
    fn file_storage_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "p2p-gossip-persist-{:016x}.json",
            rand::random::<u64>()
        ));
        assert!(FileStorage.read(&path).unwrap().is_empty());

        let state = PersistedState {
            bans: HashMap::from([(BanTarget::Ip(ip(1)), SystemTime::now() + HOUR)]),
            bootstrap: vec![Endpoint::new(ip(2), 8108)],
        };
        state.save(&FileStorage, &path).unwrap();
        assert_eq!(state, PersistedState::load(&FileStorage, &path).unwrap());

        let json = String::from_utf8(FileStorage.read(&path).unwrap()).unwrap();
        assert!(json.contains("\"bans\""));
        assert!(json.contains("\"bootstrap\""));
        std::fs::remove_file(&path).unwrap();
    }
}
