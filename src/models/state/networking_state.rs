use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use tracing::info;
use tracing::warn;

use super::endpoint_directory::EndpointDirectory;
use super::peer_registry::PeerRegistry;
use super::persist::PersistedState;
use super::persist::Storage;
use crate::config_models::cli_args::Args;
use crate::models::peer::PeerInfo;

/// `NetworkingState` contains the in-memory stores shared between the
/// controller and the application facade, plus access to persisted state.
///
/// Only the controller mutates the stores; everyone else reads.
#[derive(Debug, Clone)]
pub struct NetworkingState {
    pub registry: Arc<PeerRegistry>,
    pub directory: Arc<EndpointDirectory>,
    storage: Arc<dyn Storage>,
}

impl NetworkingState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            registry: Arc::new(PeerRegistry::new()),
            directory: Arc::new(EndpointDirectory::new()),
            storage,
        }
    }

    /// Restore bans and bootstrap endpoints from `--persist-file`. A missing,
    /// empty or corrupt file leaves the stores empty.
    pub fn restore(&self, args: &Args) {
        let Some(path) = &args.persist_file else {
            return;
        };

        match PersistedState::load(self.storage.as_ref(), path) {
            Ok(state) => {
                let endpoints = state.bootstrap.len();
                let bans = state.apply(&self.directory, SystemTime::now());
                info!(
                    "Restored {bans} bans and {endpoints} endpoints from {}",
                    path.display()
                );
            }
            Err(err) => {
                warn!("Starting without persisted state: {err:#}");
            }
        }
    }

    /// Clean up the directory and write bans and active peers to
    /// `--persist-file`. Does nothing if persistence is disabled.
    pub fn persist(&self, args: &Args) -> Result<()> {
        let Some(path) = &args.persist_file else {
            return Ok(());
        };

        self.directory.cleanup(args.peer_age_limit);
        let state = PersistedState::capture(&self.directory, &self.registry, SystemTime::now());
        state.save(self.storage.as_ref(), path)?;
        info!(
            "Persisted {} bans and {} endpoints to {}",
            state.bans.len(),
            state.bootstrap.len(),
            path.display()
        );
        Ok(())
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.registry
            .snapshot()
            .iter()
            .filter(|peer| peer.is_active())
            .map(|peer| peer.info())
            .collect()
    }
}
