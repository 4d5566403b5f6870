pub mod endpoint_directory;
pub mod networking_state;
pub mod peer_registry;
pub mod persist;
